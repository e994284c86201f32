//! Health endpoints for the media session service.
//!
//! - `GET /health` - Liveness: is the process running?
//! - `GET /ready` - Readiness: the worker pool is up and the service is
//!   not draining
//! - `GET /status` - Session resource counts plus host CPU/memory, as JSON
//!
//! The `/metrics` endpoint is served separately via `metrics-exporter-prometheus`.

use crate::session::{MediaSession, SessionStatus};
use crate::system_info::{HostLoad, HostMonitor};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health state for the media session service.
#[derive(Debug)]
pub struct HealthState {
    instance_id: String,
    session: Arc<MediaSession>,
    host: HostMonitor,
    /// Always true after startup.
    live: AtomicBool,
    /// Set on shutdown so traffic drains away before teardown.
    draining: AtomicBool,
}

impl HealthState {
    #[must_use]
    pub fn new(instance_id: String, session: Arc<MediaSession>) -> Self {
        Self {
            instance_id,
            session,
            host: HostMonitor::new(),
            live: AtomicBool::new(true),
            draining: AtomicBool::new(false),
        }
    }

    /// Stop reporting ready (e.g., during shutdown).
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub async fn is_ready(&self) -> bool {
        !self.is_draining() && self.session.workers().worker_count().await > 0
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub instance_id: String,
    pub draining: bool,
    pub session: SessionStatus,
    #[serde(flatten)]
    pub host: HostLoad,
}

/// Create the health router with liveness, readiness and status endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(State(state): State<Arc<HealthState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        instance_id: state.instance_id.clone(),
        draining: state.is_draining(),
        session: state.session.status().await,
        host: state.host.sample().await,
    })
}
