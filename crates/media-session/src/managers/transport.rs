//! Transport manager.
//!
//! Tracks at most one WebRTC transport per (user, channel, direction). Each
//! transport is indexed by its composite key and by its id. Its mediasoup
//! event callbacks feed a monitor task:
//!
//! - DTLS `connected` marks the transport connected.
//! - DTLS `failed` or `closed` closes the transport.
//! - An engine-side close (the router or worker went away) drops the
//!   transport from the manager.
//! - ICE changes are only logged.
//!
//! Closing a transport means dropping the manager's handle. mediasoup closes
//! it once the producers and consumers on it are dropped as well.
//!
//! Whatever closes a transport, registered [`TransportObserver`]s are told
//! after it leaves both indexes and before the closing call returns. The
//! stream manager is the observer that drops dependent producers and
//! consumers.

use crate::errors::SessionError;
use crate::managers::router::RouterManager;
use crate::observability::metrics;
use common::types::{ChannelId, UserId};
use mediasoup::data_structures::{DtlsState, IceState};
use mediasoup::prelude::*;
use mediasoup::router::Router;
use mediasoup::transport::TransportId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Media flow direction, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client sends media (producer side).
    Send,
    /// Client receives media (consumer side).
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Recv => write!(f, "recv"),
        }
    }
}

/// Composite identity of a transport. Displays as `user:channel:direction`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportKey {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub direction: Direction,
}

impl TransportKey {
    #[must_use]
    pub fn new(user_id: UserId, channel_id: ChannelId, direction: Direction) -> Self {
        Self {
            user_id,
            channel_id,
            direction,
        }
    }
}

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.user_id, self.channel_id, self.direction)
    }
}

/// Where a live transport is in its handshake.
///
/// Closed and failed transports leave the manager, so they have no phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPhase {
    /// Waiting for the client's DTLS parameters.
    New,
    /// Remote DTLS parameters applied, handshake running.
    Connecting,
    Connected,
}

/// Parameters the client needs to set up its side of a new transport.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// A tracked transport plus the key it is registered under.
#[derive(Clone)]
pub struct ManagedTransport {
    pub transport: WebRtcTransport,
    pub key: TransportKey,
    pub phase: TransportPhase,
}

/// Notified after a transport has been removed from the manager.
#[async_trait::async_trait]
pub trait TransportObserver: Send + Sync {
    async fn on_transport_closed(&self, transport_id: TransportId);
}

/// Transport state change forwarded from a mediasoup callback.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TransportEvent {
    Dtls(DtlsState),
    Ice(IceState),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Explicit,
    UserDisconnect,
    ChannelTeardown,
    DtlsFailed,
    EngineClosed,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::Explicit => "explicit",
            CloseReason::UserDisconnect => "user_disconnect",
            CloseReason::ChannelTeardown => "channel_teardown",
            CloseReason::DtlsFailed => "dtls_failed",
            CloseReason::EngineClosed => "engine_closed",
        }
    }
}

#[derive(Default)]
struct TransportIndex {
    by_key: HashMap<TransportKey, ManagedTransport>,
    by_id: HashMap<TransportId, TransportKey>,
    /// Keys with a creation in flight, tagged with the attempt that owns
    /// them. Removing a key cancels its creation.
    pending: HashMap<TransportKey, u64>,
    next_attempt: u64,
}

impl TransportIndex {
    fn get(&self, transport_id: TransportId) -> Option<&ManagedTransport> {
        self.by_id
            .get(&transport_id)
            .and_then(|key| self.by_key.get(key))
    }

    fn remove(&mut self, transport_id: TransportId) -> Option<ManagedTransport> {
        let key = self.by_id.remove(&transport_id)?;
        self.by_key.remove(&key)
    }
}

/// Registry of live WebRTC transports.
pub struct TransportManager {
    routers: Arc<RouterManager>,
    options: WebRtcTransportOptions,
    index: Mutex<TransportIndex>,
    observers: RwLock<Vec<Weak<dyn TransportObserver>>>,
}

impl fmt::Debug for ManagedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedTransport")
            .field("id", &self.transport.id())
            .field("key", &self.key)
            .field("phase", &self.phase)
            .finish()
    }
}

impl fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportManager").finish_non_exhaustive()
    }
}

impl TransportManager {
    /// Every transport is created with `options`.
    #[must_use]
    pub fn new(routers: Arc<RouterManager>, options: WebRtcTransportOptions) -> Arc<Self> {
        Arc::new(Self {
            routers,
            options,
            index: Mutex::new(TransportIndex::default()),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Register a close observer. Observers run in registration order; dropped
    /// observers are skipped.
    pub async fn register_observer(&self, observer: Weak<dyn TransportObserver>) {
        self.observers.write().await.push(observer);
    }

    /// Create the transport for (user, channel, direction) on the channel's
    /// router, creating the router if needed.
    ///
    /// Fails with `Conflict` if that key already has a transport or a creation
    /// in flight. If the user or channel is closed while this call waits on
    /// the engine, the new transport is dropped and `TransportNotFound`
    /// returned; a newer creation for the same key is left alone.
    #[instrument(
        skip_all,
        name = "ms.transport.create",
        fields(channel_id = %channel_id, user_id = %user_id, direction = %direction)
    )]
    pub async fn create_webrtc_transport(
        self: &Arc<Self>,
        channel_id: &ChannelId,
        user_id: &UserId,
        direction: Direction,
    ) -> Result<TransportInfo, SessionError> {
        let key = TransportKey::new(user_id.clone(), channel_id.clone(), direction);
        let attempt = {
            let mut index = self.index.lock().await;
            if index.by_key.contains_key(&key) || index.pending.contains_key(&key) {
                return Err(SessionError::Conflict(format!(
                    "transport already exists for {key}"
                )));
            }
            let attempt = index.next_attempt;
            index.next_attempt += 1;
            index.pending.insert(key.clone(), attempt);
            attempt
        };

        let created = self.open_transport(channel_id).await;

        let mut index = self.index.lock().await;
        let still_wanted = index.pending.get(&key) == Some(&attempt);
        if still_wanted {
            index.pending.remove(&key);
        }
        let transport = created?;

        if !still_wanted {
            drop(index);
            warn!(
                target: "ms.transport",
                transport_id = %transport.id(),
                key = %key,
                "Transport creation cancelled, dropping transport"
            );
            return Err(SessionError::TransportNotFound(key.to_string()));
        }

        let transport_id = transport.id();
        let events = subscribe(&transport);
        index.by_id.insert(transport_id, key.clone());
        index.by_key.insert(
            key.clone(),
            ManagedTransport {
                transport: transport.clone(),
                key: key.clone(),
                phase: TransportPhase::New,
            },
        );
        let count = index.by_key.len();
        drop(index);

        metrics::set_transports_active(count);
        self.spawn_monitor(transport_id, events);

        info!(
            target: "ms.transport",
            transport_id = %transport_id,
            key = %key,
            "Transport created"
        );

        Ok(TransportInfo {
            id: transport_id,
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().to_vec(),
            dtls_parameters: transport.dtls_parameters().clone(),
        })
    }

    async fn open_transport(&self, channel_id: &ChannelId) -> Result<WebRtcTransport, SessionError> {
        let router = self.routers.get_or_create_router(channel_id).await?;
        router
            .create_webrtc_transport(self.options.clone())
            .await
            .map_err(|e| SessionError::Engine(format!("transport creation failed: {e}")))
    }

    /// Hand the client's DTLS parameters to the transport. Only the first
    /// call per transport is accepted.
    ///
    /// Parameters the engine rejects close the transport and fail with
    /// `HandshakeFailed`. A handshake that fails later is reported through
    /// the transport's DTLS state and also closes it.
    #[instrument(skip_all, name = "ms.transport.connect", fields(transport_id = %transport_id))]
    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SessionError> {
        let transport = {
            let mut index = self.index.lock().await;
            let key = index
                .by_id
                .get(&transport_id)
                .cloned()
                .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))?;
            let managed = index
                .by_key
                .get_mut(&key)
                .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))?;
            if managed.phase != TransportPhase::New {
                return Err(SessionError::Conflict(format!(
                    "transport {transport_id} is already connected"
                )));
            }
            managed.phase = TransportPhase::Connecting;
            managed.transport.clone()
        };

        let result = transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await;
        drop(transport);

        match result {
            Ok(()) => {
                debug!(target: "ms.transport", transport_id = %transport_id, "Remote DTLS parameters applied");
                Ok(())
            }
            Err(e) => {
                if !self.close_with_reason(transport_id, CloseReason::DtlsFailed).await {
                    return Err(SessionError::TransportNotFound(transport_id.to_string()));
                }
                warn!(
                    target: "ms.transport",
                    transport_id = %transport_id,
                    error = %e,
                    "DTLS parameters rejected, transport closed"
                );
                Err(SessionError::HandshakeFailed(e.to_string()))
            }
        }
    }

    pub async fn get_transport(&self, transport_id: TransportId) -> Option<ManagedTransport> {
        self.index.lock().await.get(transport_id).cloned()
    }

    /// Existing router of the channel, for callers holding a transport key.
    pub async fn get_router_for_channel(&self, channel_id: &ChannelId) -> Option<Router> {
        self.routers.get_router_for_channel(channel_id).await
    }

    /// Close a transport. Returns `false` if it was not tracked.
    #[instrument(skip_all, name = "ms.transport.close", fields(transport_id = %transport_id))]
    pub async fn close_transport(&self, transport_id: TransportId) -> bool {
        self.close_with_reason(transport_id, CloseReason::Explicit)
            .await
    }

    /// Close every transport of `user_id`, in any channel, and cancel the
    /// user's in-flight creations. Returns how many transports were closed.
    #[instrument(skip_all, name = "ms.transport.close_user", fields(user_id = %user_id))]
    pub async fn close_user_transports(&self, user_id: &UserId) -> usize {
        let transport_ids = {
            let mut index = self.index.lock().await;
            index.pending.retain(|key, _| key.user_id != *user_id);
            index
                .by_key
                .iter()
                .filter(|(key, _)| key.user_id == *user_id)
                .map(|(_, managed)| managed.transport.id())
                .collect::<Vec<_>>()
        };

        self.close_all(transport_ids, CloseReason::UserDisconnect)
            .await
    }

    /// Close every transport in `channel_id` and cancel in-flight creations
    /// there. Returns how many transports were closed.
    #[instrument(skip_all, name = "ms.transport.close_channel", fields(channel_id = %channel_id))]
    pub async fn close_channel_transports(&self, channel_id: &ChannelId) -> usize {
        let transport_ids = {
            let mut index = self.index.lock().await;
            index.pending.retain(|key, _| key.channel_id != *channel_id);
            index
                .by_key
                .iter()
                .filter(|(key, _)| key.channel_id == *channel_id)
                .map(|(_, managed)| managed.transport.id())
                .collect::<Vec<_>>()
        };

        self.close_all(transport_ids, CloseReason::ChannelTeardown)
            .await
    }

    pub async fn transport_count(&self) -> usize {
        self.index.lock().await.by_key.len()
    }

    async fn close_all(&self, transport_ids: Vec<TransportId>, reason: CloseReason) -> usize {
        let mut closed = 0;
        for transport_id in transport_ids {
            if self.close_with_reason(transport_id, reason).await {
                closed += 1;
            }
        }
        closed
    }

    async fn close_with_reason(&self, transport_id: TransportId, reason: CloseReason) -> bool {
        let (managed, count) = {
            let mut index = self.index.lock().await;
            let managed = index.remove(transport_id);
            (managed, index.by_key.len())
        };
        let Some(managed) = managed else {
            debug!(target: "ms.transport", transport_id = %transport_id, "Transport already closed");
            return false;
        };

        // Remaining handles belong to streams on the transport; the observers
        // below drop those.
        drop(managed.transport);

        metrics::set_transports_active(count);
        metrics::record_transport_closed(reason.as_str());
        self.notify_closed(transport_id).await;

        info!(
            target: "ms.transport",
            transport_id = %transport_id,
            key = %managed.key,
            reason = reason.as_str(),
            "Transport closed"
        );
        true
    }

    async fn notify_closed(&self, transport_id: TransportId) {
        let observers: Vec<Arc<dyn TransportObserver>> = self
            .observers
            .read()
            .await
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for observer in observers {
            observer.on_transport_closed(transport_id).await;
        }
    }

    async fn set_phase(&self, transport_id: TransportId, phase: TransportPhase) {
        let mut index = self.index.lock().await;
        let key = index.by_id.get(&transport_id).cloned();
        if let Some(managed) = key.and_then(|key| index.by_key.get_mut(&key)) {
            managed.phase = phase;
        }
    }

    /// React to one engine event. Returns `false` once the transport is gone
    /// and its monitor can stop.
    pub(crate) async fn handle_event(&self, transport_id: TransportId, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Dtls(DtlsState::Connected) => {
                debug!(target: "ms.transport", transport_id = %transport_id, "DTLS connected");
                self.set_phase(transport_id, TransportPhase::Connected).await;
                true
            }
            TransportEvent::Dtls(state @ (DtlsState::Failed | DtlsState::Closed)) => {
                warn!(target: "ms.transport", transport_id = %transport_id, dtls_state = ?state, "DTLS ended, closing transport");
                self.close_with_reason(transport_id, CloseReason::DtlsFailed)
                    .await;
                false
            }
            TransportEvent::Dtls(state) => {
                debug!(target: "ms.transport", transport_id = %transport_id, dtls_state = ?state, "DTLS state changed");
                true
            }
            TransportEvent::Ice(state) => {
                debug!(target: "ms.transport", transport_id = %transport_id, ice_state = ?state, "ICE state changed");
                true
            }
            TransportEvent::Closed => {
                self.close_with_reason(transport_id, CloseReason::EngineClosed)
                    .await;
                false
            }
        }
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        transport_id: TransportId,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if !manager.handle_event(transport_id, event).await {
                    break;
                }
            }
        });
    }
}

/// Forward the transport's mediasoup callbacks into a channel.
fn subscribe(transport: &WebRtcTransport) -> mpsc::UnboundedReceiver<TransportEvent> {
    let (sender, receiver) = mpsc::unbounded_channel();

    transport
        .on_dtls_state_change({
            let sender = sender.clone();
            move |state| {
                let _ = sender.send(TransportEvent::Dtls(state));
            }
        })
        .detach();
    transport
        .on_ice_state_change({
            let sender = sender.clone();
            move |state| {
                let _ = sender.send(TransportEvent::Ice(state));
            }
        })
        .detach();
    transport
        .on_close(Box::new(move || {
            let _ = sender.send(TransportEvent::Closed);
        }))
        .detach();

    receiver
}
