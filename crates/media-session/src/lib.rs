//! PTT Media Session Library
//!
//! Server-side resource management for push-to-talk voice channels on top of
//! mediasoup workers:
//!
//! - A fixed pool of media workers, picked round-robin
//! - One routing domain (router) per voice channel
//! - One WebRTC transport per user, channel and direction
//! - Audio producers (start paused; PTT press resumes) and consumers
//!
//! # Architecture
//!
//! ```text
//! MediaSession (facade, signaling dispatch)
//! ├── WorkerPool
//! ├── RouterManager      (channel -> router)
//! ├── TransportManager   (user:channel:direction -> transport)
//! │   └── notifies TransportObservers when a transport closes
//! └── StreamManager      (producers, consumers; a TransportObserver)
//! ```
//!
//! Closing cascades downward: a closed transport takes its producers and
//! consumers with it, a closed producer takes its consumers.
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with signaling error codes
//! - [`managers`] - Worker pool, router, transport and stream managers
//! - [`session`] - Facade and signaling message types
//! - [`observability`] - Metrics and health endpoints

pub mod config;
pub mod errors;
pub mod managers;
pub mod observability;
pub mod session;
pub mod system_info;
