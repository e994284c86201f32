//! Producer/consumer manager.
//!
//! Producers are created paused; the PTT gate is [`StreamManager::resume_producer`]
//! on press and [`StreamManager::pause_producer`] on release. Consumers are
//! created paused and resumed by the caller once the client is ready.
//!
//! Engine-side cascades (transport closes its producers/consumers, producer
//! closes its consumers) are mirrored here so the indexes never hold a
//! resource the engine has already dropped. A transport close reaches this
//! manager through [`TransportObserver`]. Dropping an entry drops the
//! mediasoup handle, which closes the producer or consumer.
//!
//! A recv transport carries at most one consumer per producer.
//!
//! Lock order is stream index, then transport index. The transport manager
//! releases its index before notifying observers, so the two never wait on
//! each other.

use crate::errors::SessionError;
use crate::managers::router::RouterManager;
use crate::managers::transport::{Direction, ManagedTransport, TransportManager, TransportObserver};
use crate::observability::metrics;
use common::types::{ChannelId, UserId};
use mediasoup::prelude::*;
use mediasoup::transport::TransportId;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// How many stale ids are remembered for repeated pause/resume calls.
const STALE_ID_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// What a receiving client needs to set up a new consumer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParameters {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Producers and consumers removed by a bulk close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedStreams {
    pub producers: usize,
    pub consumers: usize,
}

struct ProducerEntry {
    producer: Producer,
    user_id: UserId,
    channel_id: ChannelId,
    transport_id: TransportId,
    paused: bool,
}

impl ProducerEntry {
    fn info(&self) -> ProducerInfo {
        ProducerInfo {
            id: self.producer.id(),
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
            transport_id: self.transport_id,
            kind: self.producer.kind(),
            paused: self.paused,
        }
    }
}

struct ConsumerEntry {
    consumer: Consumer,
    producer_id: ProducerId,
    user_id: UserId,
    channel_id: ChannelId,
    transport_id: TransportId,
    paused: bool,
}

impl ConsumerEntry {
    fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            id: self.consumer.id(),
            producer_id: self.producer_id,
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
            transport_id: self.transport_id,
            kind: self.consumer.kind(),
            paused: self.paused,
        }
    }
}

/// Bounded memory of ids that already got one `NotFound`.
struct StaleIds<T> {
    order: VecDeque<T>,
    seen: HashSet<T>,
}

impl<T: Copy + Eq + Hash> StaleIds<T> {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// True the first time `id` is reported.
    fn first_report(&mut self, id: T) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() >= STALE_ID_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.seen.insert(id);
        true
    }
}

struct StreamIndex {
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    /// Send transports with a producer creation in flight.
    producing: HashSet<TransportId>,
    /// (recv transport, producer) pairs with a consumer creation in flight.
    consuming: HashSet<(TransportId, ProducerId)>,
    stale_producers: StaleIds<ProducerId>,
    stale_consumers: StaleIds<ConsumerId>,
}

impl StreamIndex {
    fn publish_counts(&self) {
        metrics::set_producers_active(self.producers.len());
        metrics::set_consumers_active(self.consumers.len());
    }

    fn remove_consumers_where(&mut self, predicate: impl Fn(&ConsumerEntry) -> bool) -> usize {
        let before = self.consumers.len();
        self.consumers.retain(|_, entry| !predicate(entry));
        before - self.consumers.len()
    }
}

/// Registry of audio producers and consumers.
pub struct StreamManager {
    transports: Arc<TransportManager>,
    routers: Arc<RouterManager>,
    index: Mutex<StreamIndex>,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager").finish_non_exhaustive()
    }
}

impl StreamManager {
    /// Create the manager and register it as a close observer of `transports`.
    pub async fn new(transports: Arc<TransportManager>, routers: Arc<RouterManager>) -> Arc<Self> {
        let manager = Arc::new(Self {
            transports: Arc::clone(&transports),
            routers,
            index: Mutex::new(StreamIndex {
                producers: HashMap::new(),
                consumers: HashMap::new(),
                producing: HashSet::new(),
                consuming: HashSet::new(),
                stale_producers: StaleIds::new(),
                stale_consumers: StaleIds::new(),
            }),
        });

        let weak = Arc::downgrade(&manager);
        let observer: Weak<dyn TransportObserver> = weak;
        transports.register_observer(observer).await;
        manager
    }

    /// Create a paused producer on a send transport.
    ///
    /// A send transport carries at most one producer.
    #[instrument(
        skip_all,
        name = "ms.stream.create_producer",
        fields(transport_id = %transport_id, user_id = %user_id, channel_id = %channel_id)
    )]
    pub async fn create_producer(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        user_id: &UserId,
        channel_id: &ChannelId,
    ) -> Result<ProducerId, SessionError> {
        let managed = self.owned_transport(transport_id, user_id, channel_id, Direction::Send).await?;

        {
            let mut index = self.index.lock().await;
            let occupied = index.producing.contains(&transport_id)
                || index
                    .producers
                    .values()
                    .any(|entry| entry.transport_id == transport_id);
            if occupied {
                return Err(SessionError::Conflict(format!(
                    "transport {transport_id} already has a producer"
                )));
            }
            index.producing.insert(transport_id);
        }

        let mut options = ProducerOptions::new(kind, rtp_parameters);
        options.paused = true;
        let produced = managed.transport.produce(options).await;
        drop(managed);

        let mut index = self.index.lock().await;
        index.producing.remove(&transport_id);
        // The transport may have closed while the engine call was in flight.
        let transport_alive = self.transports.get_transport(transport_id).await.is_some();
        let producer = match produced {
            Ok(producer) if transport_alive => producer,
            Ok(producer) => {
                drop(index);
                warn!(
                    target: "ms.stream",
                    transport_id = %transport_id,
                    producer_id = %producer.id(),
                    "Transport closed during producer creation, dropping producer"
                );
                return Err(SessionError::TransportNotFound(transport_id.to_string()));
            }
            Err(_) if !transport_alive => {
                return Err(SessionError::TransportNotFound(transport_id.to_string()));
            }
            Err(e) => {
                return Err(SessionError::InvalidRequest(format!("producer rejected: {e}")));
            }
        };

        let producer_id = producer.id();
        index.producers.insert(
            producer_id,
            ProducerEntry {
                producer,
                user_id: user_id.clone(),
                channel_id: channel_id.clone(),
                transport_id,
                paused: true,
            },
        );
        index.publish_counts();
        drop(index);

        info!(
            target: "ms.stream",
            producer_id = %producer_id,
            transport_id = %transport_id,
            user_id = %user_id,
            channel_id = %channel_id,
            kind = ?kind,
            "Producer created (paused)"
        );
        Ok(producer_id)
    }

    /// Create a paused consumer of `producer_id` on a recv transport.
    ///
    /// Fails with `Conflict` if the transport already has a consumer of that
    /// producer or one is being created.
    #[instrument(
        skip_all,
        name = "ms.stream.create_consumer",
        fields(transport_id = %transport_id, producer_id = %producer_id, user_id = %user_id)
    )]
    pub async fn create_consumer(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        user_id: &UserId,
        channel_id: &ChannelId,
    ) -> Result<ConsumerParameters, SessionError> {
        let managed = self.owned_transport(transport_id, user_id, channel_id, Direction::Recv).await?;

        let producer_channel = {
            let index = self.index.lock().await;
            index
                .producers
                .get(&producer_id)
                .map(|entry| entry.channel_id.clone())
        }
        .ok_or_else(|| SessionError::ProducerNotFound(producer_id.to_string()))?;

        let router = self
            .routers
            .get_router(&producer_channel)
            .await
            .ok_or_else(|| SessionError::RouterNotFound(producer_channel.to_string()))?;
        if !router.can_consume(&producer_id, &rtp_capabilities) {
            return Err(SessionError::IncompatibleCapabilities(producer_id.to_string()));
        }

        let pair = (transport_id, producer_id);
        {
            let mut index = self.index.lock().await;
            let duplicate = index.consuming.contains(&pair)
                || index
                    .consumers
                    .values()
                    .any(|entry| entry.transport_id == transport_id && entry.producer_id == producer_id);
            if duplicate {
                return Err(SessionError::Conflict(format!(
                    "transport {transport_id} already consumes producer {producer_id}"
                )));
            }
            index.consuming.insert(pair);
        }

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = true;
        let consumed = managed.transport.consume(options).await;
        drop(managed);

        let mut index = self.index.lock().await;
        index.consuming.remove(&pair);
        let transport_alive = self.transports.get_transport(transport_id).await.is_some();
        let producer_alive = index.producers.contains_key(&producer_id);
        let source_gone = if transport_alive {
            SessionError::ProducerNotFound(producer_id.to_string())
        } else {
            SessionError::TransportNotFound(transport_id.to_string())
        };
        let consumer = match consumed {
            Ok(consumer) if transport_alive && producer_alive => consumer,
            Ok(consumer) => {
                drop(index);
                warn!(
                    target: "ms.stream",
                    consumer_id = %consumer.id(),
                    transport_alive,
                    producer_alive,
                    "Source closed during consumer creation, dropping consumer"
                );
                return Err(source_gone);
            }
            Err(_) if !transport_alive || !producer_alive => return Err(source_gone),
            Err(e) => return Err(SessionError::Engine(format!("consume failed: {e}"))),
        };

        let parameters = ConsumerParameters {
            id: consumer.id(),
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
        };
        index.consumers.insert(
            consumer.id(),
            ConsumerEntry {
                consumer,
                producer_id,
                user_id: user_id.clone(),
                channel_id: channel_id.clone(),
                transport_id,
                paused: true,
            },
        );
        index.publish_counts();
        drop(index);

        info!(
            target: "ms.stream",
            consumer_id = %parameters.id,
            producer_id = %producer_id,
            transport_id = %transport_id,
            user_id = %user_id,
            "Consumer created (paused)"
        );
        Ok(parameters)
    }

    /// PTT press: start forwarding the producer's audio.
    pub async fn resume_producer(&self, producer_id: ProducerId) -> Result<(), SessionError> {
        self.set_producer_paused(producer_id, false).await
    }

    /// PTT release: stop forwarding the producer's audio.
    pub async fn pause_producer(&self, producer_id: ProducerId) -> Result<(), SessionError> {
        self.set_producer_paused(producer_id, true).await
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), SessionError> {
        self.set_consumer_paused(consumer_id, false).await
    }

    pub async fn pause_consumer(&self, consumer_id: ConsumerId) -> Result<(), SessionError> {
        self.set_consumer_paused(consumer_id, true).await
    }

    /// The gate flips under the index lock before the engine call, so a
    /// concurrent duplicate is a no-op, and flips back if the engine fails.
    #[instrument(skip_all, name = "ms.stream.set_producer_paused", fields(producer_id = %producer_id, paused = paused))]
    async fn set_producer_paused(&self, producer_id: ProducerId, paused: bool) -> Result<(), SessionError> {
        let producer = {
            let mut index = self.index.lock().await;
            let Some(entry) = index.producers.get_mut(&producer_id) else {
                if index.stale_producers.first_report(producer_id) {
                    return Err(SessionError::ProducerNotFound(producer_id.to_string()));
                }
                debug!(target: "ms.stream", producer_id = %producer_id, "Repeated call on unknown producer ignored");
                return Ok(());
            };
            if entry.paused == paused {
                debug!(target: "ms.stream", producer_id = %producer_id, paused, "Producer already in requested state");
                return Ok(());
            }
            entry.paused = paused;
            entry.producer.clone()
        };

        let result = if paused {
            producer.pause().await
        } else {
            producer.resume().await
        };

        if let Err(e) = result {
            warn!(target: "ms.stream", producer_id = %producer_id, error = %e, "Producer gate change failed");
            let mut index = self.index.lock().await;
            let Some(entry) = index.producers.get_mut(&producer_id) else {
                return Err(SessionError::ProducerNotFound(producer_id.to_string()));
            };
            entry.paused = !paused;
            return Err(SessionError::Engine(format!("producer gate change failed: {e}")));
        }

        let direction = if paused { "pause" } else { "resume" };
        metrics::record_ptt_transition(direction);
        info!(target: "ms.stream", producer_id = %producer_id, paused, "PTT gate changed");
        Ok(())
    }

    #[instrument(skip_all, name = "ms.stream.set_consumer_paused", fields(consumer_id = %consumer_id, paused = paused))]
    async fn set_consumer_paused(&self, consumer_id: ConsumerId, paused: bool) -> Result<(), SessionError> {
        let consumer = {
            let mut index = self.index.lock().await;
            let Some(entry) = index.consumers.get_mut(&consumer_id) else {
                if index.stale_consumers.first_report(consumer_id) {
                    return Err(SessionError::ConsumerNotFound(consumer_id.to_string()));
                }
                debug!(target: "ms.stream", consumer_id = %consumer_id, "Repeated call on unknown consumer ignored");
                return Ok(());
            };
            if entry.paused == paused {
                debug!(target: "ms.stream", consumer_id = %consumer_id, paused, "Consumer already in requested state");
                return Ok(());
            }
            entry.paused = paused;
            entry.consumer.clone()
        };

        let result = if paused {
            consumer.pause().await
        } else {
            consumer.resume().await
        };

        if let Err(e) = result {
            warn!(target: "ms.stream", consumer_id = %consumer_id, error = %e, "Consumer pause state change failed");
            let mut index = self.index.lock().await;
            let Some(entry) = index.consumers.get_mut(&consumer_id) else {
                return Err(SessionError::ConsumerNotFound(consumer_id.to_string()));
            };
            entry.paused = !paused;
            return Err(SessionError::Engine(format!("consumer pause state change failed: {e}")));
        }

        debug!(target: "ms.stream", consumer_id = %consumer_id, paused, "Consumer pause state changed");
        Ok(())
    }

    /// Close a producer and every consumer of it. Returns `false` if unknown.
    #[instrument(skip_all, name = "ms.stream.close_producer", fields(producer_id = %producer_id))]
    pub async fn close_producer(&self, producer_id: ProducerId) -> bool {
        let (entry, consumers_closed) = {
            let mut index = self.index.lock().await;
            let Some(entry) = index.producers.remove(&producer_id) else {
                debug!(target: "ms.stream", producer_id = %producer_id, "Producer already closed");
                return false;
            };
            let consumers_closed =
                index.remove_consumers_where(|consumer| consumer.producer_id == producer_id);
            index.publish_counts();
            (entry, consumers_closed)
        };

        info!(
            target: "ms.stream",
            producer_id = %producer_id,
            user_id = %entry.user_id,
            consumers_closed,
            "Producer closed"
        );
        true
    }

    /// Close a consumer. Returns `false` if unknown.
    #[instrument(skip_all, name = "ms.stream.close_consumer", fields(consumer_id = %consumer_id))]
    pub async fn close_consumer(&self, consumer_id: ConsumerId) -> bool {
        {
            let mut index = self.index.lock().await;
            if index.consumers.remove(&consumer_id).is_none() {
                debug!(target: "ms.stream", consumer_id = %consumer_id, "Consumer already closed");
                return false;
            }
            index.publish_counts();
        }

        debug!(target: "ms.stream", consumer_id = %consumer_id, "Consumer closed");
        true
    }

    /// Close the user's producers in `channel_id` and every consumer the user
    /// holds, in any channel.
    #[instrument(skip_all, name = "ms.stream.close_user_channel", fields(user_id = %user_id, channel_id = %channel_id))]
    pub async fn close_user_channel_producers_and_consumers(
        &self,
        user_id: &UserId,
        channel_id: &ChannelId,
    ) -> ClosedStreams {
        let (producer_ids, consumer_ids) = {
            let index = self.index.lock().await;
            let producer_ids: Vec<ProducerId> = index
                .producers
                .iter()
                .filter(|(_, e)| e.user_id == *user_id && e.channel_id == *channel_id)
                .map(|(id, _)| *id)
                .collect();
            // A user's single recv path may carry consumers from any channel.
            let consumer_ids: Vec<ConsumerId> = index
                .consumers
                .iter()
                .filter(|(_, e)| e.user_id == *user_id)
                .map(|(id, _)| *id)
                .collect();
            (producer_ids, consumer_ids)
        };

        self.close_streams(producer_ids, consumer_ids).await
    }

    /// Close every producer and consumer of the user, in any channel.
    #[instrument(skip_all, name = "ms.stream.close_user", fields(user_id = %user_id))]
    pub async fn close_user_producers_and_consumers(&self, user_id: &UserId) -> ClosedStreams {
        let (producer_ids, consumer_ids) = {
            let index = self.index.lock().await;
            let producer_ids: Vec<ProducerId> = index
                .producers
                .iter()
                .filter(|(_, e)| e.user_id == *user_id)
                .map(|(id, _)| *id)
                .collect();
            let consumer_ids: Vec<ConsumerId> = index
                .consumers
                .iter()
                .filter(|(_, e)| e.user_id == *user_id)
                .map(|(id, _)| *id)
                .collect();
            (producer_ids, consumer_ids)
        };

        self.close_streams(producer_ids, consumer_ids).await
    }

    async fn close_streams(
        &self,
        producer_ids: Vec<ProducerId>,
        consumer_ids: Vec<ConsumerId>,
    ) -> ClosedStreams {
        let mut closed = ClosedStreams::default();
        for producer_id in producer_ids {
            if self.close_producer(producer_id).await {
                closed.producers += 1;
            }
        }
        // Some of these may already be gone with a producer closed above.
        for consumer_id in consumer_ids {
            if self.close_consumer(consumer_id).await {
                closed.consumers += 1;
            }
        }
        closed
    }

    /// Producers currently in `channel_id`.
    pub async fn get_producers_for_channel(&self, channel_id: &ChannelId) -> Vec<ProducerInfo> {
        let index = self.index.lock().await;
        index
            .producers
            .values()
            .filter(|entry| entry.channel_id == *channel_id)
            .map(ProducerEntry::info)
            .collect()
    }

    pub async fn get_producer(&self, producer_id: ProducerId) -> Option<ProducerInfo> {
        let index = self.index.lock().await;
        index.producers.get(&producer_id).map(ProducerEntry::info)
    }

    pub async fn get_consumer(&self, consumer_id: ConsumerId) -> Option<ConsumerInfo> {
        let index = self.index.lock().await;
        index.consumers.get(&consumer_id).map(ConsumerEntry::info)
    }

    pub async fn producer_count(&self) -> usize {
        self.index.lock().await.producers.len()
    }

    pub async fn consumer_count(&self) -> usize {
        self.index.lock().await.consumers.len()
    }

    async fn owned_transport(
        &self,
        transport_id: TransportId,
        user_id: &UserId,
        channel_id: &ChannelId,
        direction: Direction,
    ) -> Result<ManagedTransport, SessionError> {
        let managed = self
            .transports
            .get_transport(transport_id)
            .await
            .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))?;

        if managed.key.user_id != *user_id || managed.key.channel_id != *channel_id {
            return Err(SessionError::InvalidRequest(
                "transport belongs to another user or channel".to_string(),
            ));
        }
        if managed.key.direction != direction {
            return Err(SessionError::InvalidRequest(format!(
                "operation requires a {direction} transport"
            )));
        }
        Ok(managed)
    }
}

#[async_trait::async_trait]
impl TransportObserver for StreamManager {
    async fn on_transport_closed(&self, transport_id: TransportId) {
        let mut index = self.index.lock().await;

        let producer_ids: HashSet<ProducerId> = index
            .producers
            .iter()
            .filter(|(_, entry)| entry.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect();
        index.producers.retain(|id, _| !producer_ids.contains(id));

        let consumers_removed = index.remove_consumers_where(|entry| {
            entry.transport_id == transport_id || producer_ids.contains(&entry.producer_id)
        });

        if !producer_ids.is_empty() || consumers_removed > 0 {
            index.publish_counts();
            debug!(
                target: "ms.stream",
                transport_id = %transport_id,
                producers_removed = producer_ids.len(),
                consumers_removed,
                "Dropped streams of closed transport"
            );
        }
    }
}
