//! Media session facade.
//!
//! [`MediaSession`] owns one of each manager, wires the stream manager in as
//! the transport close observer, and maps signaling operations onto manager
//! calls. Failed operations are reported back to the issuing client only;
//! nothing is broadcast from here.

pub mod signaling;

pub use signaling::{SignalingError, SignalingRequest, SignalingResponse};

use crate::config::Config;
use crate::errors::SessionError;
use crate::managers::{RouterManager, StreamManager, TransportManager, WorkerDeathHandler, WorkerPool};
use crate::observability::metrics;
use common::types::ChannelId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Resource counts across the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub workers: usize,
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

#[derive(Debug)]
pub struct MediaSession {
    workers: Arc<WorkerPool>,
    routers: Arc<RouterManager>,
    transports: Arc<TransportManager>,
    streams: Arc<StreamManager>,
}

impl MediaSession {
    /// Start the worker pool and build the managers on top of it.
    #[instrument(skip_all, name = "ms.session.start", fields(instance_id = %config.instance_id))]
    pub async fn start(
        config: &Config,
        death_handler: Arc<dyn WorkerDeathHandler>,
    ) -> Result<Self, SessionError> {
        let workers = Arc::new(WorkerPool::new(
            config.num_workers,
            config.worker_settings(),
            death_handler,
        ));
        workers.init().await?;

        let routers = Arc::new(RouterManager::new(
            Arc::clone(&workers),
            config.media_codecs(),
        ));
        let options = config
            .transport_options()
            .map_err(|e| SessionError::Config(e.to_string()))?;
        let transports = TransportManager::new(Arc::clone(&routers), options);
        let streams = StreamManager::new(Arc::clone(&transports), Arc::clone(&routers)).await;

        info!(
            target: "ms.session",
            instance_id = %config.instance_id,
            num_workers = config.num_workers,
            audio_codec = ?config.audio_codec.mime_type,
            "Media session started"
        );

        Ok(Self {
            workers,
            routers,
            transports,
            streams,
        })
    }

    #[must_use]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    #[must_use]
    pub fn routers(&self) -> &Arc<RouterManager> {
        &self.routers
    }

    #[must_use]
    pub fn transports(&self) -> &Arc<TransportManager> {
        &self.transports
    }

    #[must_use]
    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    /// Run one signaling operation for the client that sent it.
    #[instrument(skip_all, name = "ms.session.handle", fields(operation = request.operation()))]
    pub async fn handle(
        &self,
        request: SignalingRequest,
    ) -> Result<SignalingResponse, SessionError> {
        let operation = request.operation();
        let started = Instant::now();

        let result = self.dispatch(request).await;

        metrics::record_operation_duration(operation, started.elapsed());
        if let Err(e) = &result {
            metrics::record_error(operation, e.error_type(), e.error_code());
            warn!(
                target: "ms.session",
                operation,
                error = %e,
                code = e.error_code(),
                "Signaling operation failed"
            );
        }
        result
    }

    async fn dispatch(&self, request: SignalingRequest) -> Result<SignalingResponse, SessionError> {
        match request {
            SignalingRequest::GetRouterCapabilities { channel_id } => {
                self.routers.get_or_create_router(&channel_id).await?;
                let rtp_capabilities = self.routers.get_rtp_capabilities(&channel_id).await?;
                Ok(SignalingResponse::RouterCapabilities { rtp_capabilities })
            }
            SignalingRequest::CreateTransport {
                channel_id,
                user_id,
                direction,
            } => {
                let info = self
                    .transports
                    .create_webrtc_transport(&channel_id, &user_id, direction)
                    .await?;
                Ok(SignalingResponse::TransportCreated(info))
            }
            SignalingRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.transports
                    .connect_transport(transport_id, dtls_parameters)
                    .await?;
                Ok(SignalingResponse::TransportConnected { transport_id })
            }
            SignalingRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                user_id,
                channel_id,
            } => {
                let producer_id = self
                    .streams
                    .create_producer(transport_id, kind, rtp_parameters, &user_id, &channel_id)
                    .await?;
                Ok(SignalingResponse::Produced { producer_id })
            }
            SignalingRequest::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
                user_id,
                channel_id,
            } => {
                let parameters = self
                    .streams
                    .create_consumer(
                        transport_id,
                        producer_id,
                        rtp_capabilities,
                        &user_id,
                        &channel_id,
                    )
                    .await?;
                if let Err(e) = self.streams.resume_consumer(parameters.id).await {
                    self.streams.close_consumer(parameters.id).await;
                    return Err(e);
                }
                Ok(SignalingResponse::Consumed(parameters))
            }
            SignalingRequest::PttStart { producer_id } => {
                self.streams.resume_producer(producer_id).await?;
                Ok(SignalingResponse::PttStarted { producer_id })
            }
            SignalingRequest::PttStop { producer_id } => {
                self.streams.pause_producer(producer_id).await?;
                Ok(SignalingResponse::PttStopped { producer_id })
            }
            SignalingRequest::LeaveChannel {
                user_id,
                channel_id,
            } => {
                let closed = self
                    .streams
                    .close_user_channel_producers_and_consumers(&user_id, &channel_id)
                    .await;
                Ok(SignalingResponse::ChannelLeft {
                    producers_closed: closed.producers,
                    consumers_closed: closed.consumers,
                })
            }
            SignalingRequest::Disconnect { user_id } => {
                let closed = self
                    .streams
                    .close_user_producers_and_consumers(&user_id)
                    .await;
                let transports_closed = self.transports.close_user_transports(&user_id).await;
                info!(
                    target: "ms.session",
                    user_id = %user_id,
                    transports_closed,
                    producers_closed = closed.producers,
                    consumers_closed = closed.consumers,
                    "User disconnected"
                );
                Ok(SignalingResponse::Disconnected {
                    transports_closed,
                    producers_closed: closed.producers,
                    consumers_closed: closed.consumers,
                })
            }
        }
    }

    /// Close every transport in the channel, then its router. Returns whether
    /// the channel had a router.
    #[instrument(skip_all, name = "ms.session.teardown_channel", fields(channel_id = %channel_id))]
    pub async fn teardown_channel(&self, channel_id: &ChannelId) -> bool {
        let transports_closed = self.transports.close_channel_transports(channel_id).await;
        let had_router = self.routers.remove_router(channel_id).await;
        info!(
            target: "ms.session",
            channel_id = %channel_id,
            transports_closed,
            had_router,
            "Channel torn down"
        );
        had_router
    }

    pub async fn status(&self) -> SessionStatus {
        SessionStatus {
            workers: self.workers.worker_count().await,
            routers: self.routers.router_count().await,
            transports: self.transports.transport_count().await,
            producers: self.streams.producer_count().await,
            consumers: self.streams.consumer_count().await,
        }
    }

    /// Tear down every channel and close the worker pool. Idempotent.
    #[instrument(skip_all, name = "ms.session.shutdown")]
    pub async fn shutdown(&self) {
        let channels = self.routers.channels().await;
        for channel_id in &channels {
            self.teardown_channel(channel_id).await;
        }
        self.workers.close().await;
        info!(target: "ms.session", channels = channels.len(), "Media session shut down");
    }
}
