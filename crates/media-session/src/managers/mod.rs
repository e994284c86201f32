//! Resource managers.
//!
//! - [`worker_pool`] - Media workers, round-robin selection, death handling
//! - [`router`] - One routing domain per channel
//! - [`transport`] - One WebRTC transport per user, channel and direction
//! - [`stream`] - Audio producers (PTT gate) and consumers

pub mod router;
pub mod stream;
pub mod transport;
pub mod worker_pool;

pub use router::RouterManager;
pub use stream::{ClosedStreams, ConsumerInfo, ConsumerParameters, ProducerInfo, StreamManager};
pub use transport::{
    Direction, ManagedTransport, TransportInfo, TransportKey, TransportManager, TransportObserver,
    TransportPhase,
};
pub use worker_pool::{ExitProcess, WorkerDeathHandler, WorkerPool};
