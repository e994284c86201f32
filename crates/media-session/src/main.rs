//! PTT Media Session service
//!
//! Hosts the media workers for push-to-talk voice channels and serves the
//! health, status and metrics endpoints.
//!
//! # Startup Flow
//!
//! 1. Read `MS_*` configuration from the environment
//! 2. Install the Prometheus recorder
//! 3. Start the media session (worker pool + managers)
//! 4. Bind and spawn the HTTP server (liveness, readiness, status, metrics)
//! 5. On SIGTERM/Ctrl+C: report not-ready, wait, tear down, stop HTTP
//!
//! A media worker dying at any point terminates the process after
//! `MS_WORKER_DEATH_GRACE_MS`.

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use media_session::config::Config;
use media_session::managers::ExitProcess;
use media_session::observability::{health_router, init_metrics_recorder, HealthState};
use media_session::session::MediaSession;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time between reporting not-ready and tearing resources down.
const DRAIN_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_session=debug,mediasoup=warn,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting PTT Media Session service");

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Invalid media session configuration");
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        num_workers = config.num_workers,
        worker_log_level = ?config.worker_log_level,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        listen_ips = ?config.listen_ips,
        audio_codec = ?config.audio_codec.mime_type,
        health_bind_address = %config.health_bind_address,
        "Configuration loaded"
    );

    // Before the session starts, so worker and router gauges are captured.
    let prometheus = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Could not install Prometheus recorder");
        e
    })?;

    let death_handler = Arc::new(ExitProcess::new(config.worker_death_grace));
    let session = Arc::new(MediaSession::start(&config, death_handler).await.map_err(|e| {
        error!(error = %e, "Media session failed to start");
        e
    })?);

    let health_state = Arc::new(HealthState::new(
        config.instance_id.clone(),
        Arc::clone(&session),
    ));
    let shutdown_token = CancellationToken::new();
    let http_server = start_http_server(
        &config.health_bind_address,
        Arc::clone(&health_state),
        prometheus,
        shutdown_token.child_token(),
    )
    .await?;

    info!("PTT Media Session running");
    shutdown_signal().await;
    info!("Shutdown requested, draining");

    health_state.set_draining();
    tokio::time::sleep(DRAIN_DELAY).await;

    session.shutdown().await;

    shutdown_token.cancel();
    if let Err(e) = http_server.await {
        error!(error = %e, "HTTP server task panicked");
    }

    info!("PTT Media Session stopped");
    Ok(())
}

/// Bind the health/metrics listener and serve it until `stop` fires.
///
/// Binding happens here rather than in the spawned task so a taken port
/// fails startup.
async fn start_http_server(
    bind_address: &str,
    health_state: Arc<HealthState>,
    prometheus: PrometheusHandle,
    stop: CancellationToken,
) -> Result<JoinHandle<()>, String> {
    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %bind_address, "Unparseable health bind address");
        format!("invalid MS_HEALTH_BIND_ADDRESS {bind_address}: {e}")
    })?;

    let app = health_router(health_state)
        .merge(Router::new().route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        ))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Could not bind HTTP listener");
        format!("bind {addr}: {e}")
    })?;
    info!(addr = %addr, "HTTP listener bound");

    Ok(tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                stop.cancelled().await;
                info!("HTTP server stopping");
            })
            .await;
        if let Err(e) = served {
            error!(error = %e, "HTTP server exited with error");
        }
    }))
}

/// Resolve on Ctrl+C or, on unix, SIGTERM.
///
/// # Panics
///
/// If a signal handler cannot be installed; the service could not be stopped
/// cleanly without one.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "No way to shut down gracefully without the Ctrl+C handler"
        )]
        signal::ctrl_c().await.expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "No way to shut down gracefully without the SIGTERM handler"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
