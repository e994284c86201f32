//! Routing-domain manager: one router per voice channel.
//!
//! Creation is single-flight per channel. Concurrent first callers for the
//! same channel share one in-flight creation and all receive the same router.
//! A channel removed while its router is still being created does not come
//! back: the late router is dropped and the waiting callers get
//! `RouterNotFound`.
//!
//! A mediasoup router closes when its last handle is dropped. Transports hold
//! one, so a removed router stays up until the channel's transports close.

use crate::errors::SessionError;
use crate::managers::worker_pool::WorkerPool;
use crate::observability::metrics;
use common::types::ChannelId;
use mediasoup::router::{Router, RouterId, RouterOptions};
use mediasoup::rtp_parameters::{RtpCapabilitiesFinalized, RtpCodecCapability};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};

type RouterSlot = Arc<OnceCell<Router>>;

/// Channel-to-router registry.
pub struct RouterManager {
    pool: Arc<WorkerPool>,
    media_codecs: Vec<RtpCodecCapability>,
    routers: Mutex<HashMap<ChannelId, RouterSlot>>,
}

impl std::fmt::Debug for RouterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterManager")
            .field("media_codecs", &self.media_codecs.len())
            .finish_non_exhaustive()
    }
}

impl RouterManager {
    /// Every router is created with `media_codecs`.
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, media_codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            pool,
            media_codecs,
            routers: Mutex::new(HashMap::new()),
        }
    }

    /// Router for `channel_id`, created on a pool worker if absent.
    #[instrument(skip_all, name = "ms.router.get_or_create", fields(channel_id = %channel_id))]
    pub async fn get_or_create_router(&self, channel_id: &ChannelId) -> Result<Router, SessionError> {
        let slot = {
            let mut routers = self.routers.lock().await;
            Arc::clone(routers.entry(channel_id.clone()).or_default())
        };

        let router = slot
            .get_or_try_init(|| self.create_router(channel_id))
            .await?
            .clone();

        let still_registered = {
            let routers = self.routers.lock().await;
            routers
                .get(channel_id)
                .is_some_and(|current| Arc::ptr_eq(current, &slot))
        };
        if !still_registered {
            warn!(
                target: "ms.router",
                channel_id = %channel_id,
                router_id = %router.id(),
                "Channel removed during router creation, dropping router"
            );
            return Err(SessionError::RouterNotFound(channel_id.to_string()));
        }

        metrics::set_routers_active(self.router_count().await);
        Ok(router)
    }

    async fn create_router(&self, channel_id: &ChannelId) -> Result<Router, SessionError> {
        let worker = self.pool.get_next_worker().await?;
        let router = worker
            .create_router(RouterOptions::new(self.media_codecs.clone()))
            .await
            .map_err(|e| SessionError::Engine(format!("router creation failed: {e}")))?;

        info!(
            target: "ms.router",
            channel_id = %channel_id,
            router_id = %router.id(),
            worker_id = %worker.id(),
            "Router created"
        );
        Ok(router)
    }

    /// Existing router for the channel. Never creates one.
    pub async fn get_router(&self, channel_id: &ChannelId) -> Option<Router> {
        let routers = self.routers.lock().await;
        routers.get(channel_id).and_then(|slot| slot.get().cloned())
    }

    /// Alias of [`Self::get_router`], named for call sites that resolve a
    /// channel on behalf of some other resource.
    pub async fn get_router_for_channel(&self, channel_id: &ChannelId) -> Option<Router> {
        self.get_router(channel_id).await
    }

    /// Capabilities of the channel's existing router.
    pub async fn get_rtp_capabilities(
        &self,
        channel_id: &ChannelId,
    ) -> Result<RtpCapabilitiesFinalized, SessionError> {
        self.get_router(channel_id)
            .await
            .map(|router| router.rtp_capabilities().clone())
            .ok_or_else(|| SessionError::RouterNotFound(channel_id.to_string()))
    }

    /// Forget the channel's router. Returns whether one existed.
    ///
    /// Call after the channel's transports are closed; the router closes with
    /// its last handle.
    #[instrument(skip_all, name = "ms.router.remove", fields(channel_id = %channel_id))]
    pub async fn remove_router(&self, channel_id: &ChannelId) -> bool {
        let slot = self.routers.lock().await.remove(channel_id);

        let Some(router) = slot.and_then(|slot| slot.get().cloned()) else {
            debug!(target: "ms.router", channel_id = %channel_id, "No router to remove");
            return false;
        };

        metrics::set_routers_active(self.router_count().await);
        info!(
            target: "ms.router",
            channel_id = %channel_id,
            router_id = %router.id(),
            "Router removed"
        );
        true
    }

    /// Channel a router serves, if it is still registered.
    pub async fn channel_for_router(&self, router_id: RouterId) -> Option<ChannelId> {
        let routers = self.routers.lock().await;
        routers
            .iter()
            .find(|(_, slot)| slot.get().is_some_and(|router| router.id() == router_id))
            .map(|(channel_id, _)| channel_id.clone())
    }

    /// Channels that currently have a router.
    pub async fn channels(&self) -> Vec<ChannelId> {
        let routers = self.routers.lock().await;
        routers
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(channel_id, _)| channel_id.clone())
            .collect()
    }

    pub async fn router_count(&self) -> usize {
        let routers = self.routers.lock().await;
        routers.values().filter(|slot| slot.initialized()).count()
    }
}
