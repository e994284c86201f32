//! Media session error types.
//!
//! Error types map to signaling `ErrorCode` values returned to the client that
//! issued the operation. Internal details are logged server-side but not
//! exposed to clients.
//!
//! A dead media worker is not an error value: it goes to the worker pool's
//! death handler, which terminates the process.

use thiserror::Error;

/// Media session error type.
///
/// Maps to signaling `ErrorCode` values:
/// - `InvalidRequest`: `INVALID_REQUEST` (1)
/// - `*NotFound`: `NOT_FOUND` (4)
/// - `Conflict`: `CONFLICT` (5)
/// - Engine, Config, Internal, `PoolUninitialized`: `INTERNAL_ERROR` (6)
/// - `IncompatibleCapabilities`: `INCOMPATIBLE_CAPABILITIES` (8)
/// - `HandshakeFailed`: `HANDSHAKE_FAILED` (9)
#[derive(Debug, Error)]
pub enum SessionError {
    /// Request parameters are unusable (bad RTP parameters, wrong direction).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No routing domain exists for the channel.
    #[error("Router not found: {0}")]
    RouterNotFound(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Resource already exists (transport key taken, producer already on transport).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The consuming client cannot decode the producer's stream.
    #[error("Incompatible RTP capabilities for producer {0}")]
    IncompatibleCapabilities(String),

    /// DTLS parameters were rejected; the transport has been closed.
    #[error("DTLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// Worker pool used before `init()` or after `close()`.
    #[error("Worker pool not initialized")]
    PoolUninitialized,

    /// SFU worker request failed.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Returns the signaling `ErrorCode` value for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            SessionError::InvalidRequest(_) => 1, // INVALID_REQUEST
            SessionError::RouterNotFound(_)
            | SessionError::TransportNotFound(_)
            | SessionError::ProducerNotFound(_)
            | SessionError::ConsumerNotFound(_) => 4, // NOT_FOUND
            SessionError::Conflict(_) => 5,       // CONFLICT
            SessionError::Engine(_)
            | SessionError::Config(_)
            | SessionError::Internal(_)
            | SessionError::PoolUninitialized => 6, // INTERNAL_ERROR
            SessionError::IncompatibleCapabilities(_) => 8, // INCOMPATIBLE_CAPABILITIES
            SessionError::HandshakeFailed(_) => 9, // HANDSHAKE_FAILED
        }
    }

    /// Short label for the `error_type` metric dimension.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            SessionError::InvalidRequest(_) => "invalid_request",
            SessionError::RouterNotFound(_)
            | SessionError::TransportNotFound(_)
            | SessionError::ProducerNotFound(_)
            | SessionError::ConsumerNotFound(_) => "not_found",
            SessionError::Conflict(_) => "conflict",
            SessionError::IncompatibleCapabilities(_) => "incompatible_capabilities",
            SessionError::HandshakeFailed(_) => "handshake_failed",
            SessionError::PoolUninitialized
            | SessionError::Engine(_)
            | SessionError::Config(_)
            | SessionError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SessionError::Engine(_)
            | SessionError::Config(_)
            | SessionError::Internal(_)
            | SessionError::PoolUninitialized => "An internal error occurred".to_string(),
            SessionError::RouterNotFound(_) => "Channel not found".to_string(),
            SessionError::TransportNotFound(_) => "Transport not found".to_string(),
            SessionError::ProducerNotFound(_) => "Producer not found".to_string(),
            SessionError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            SessionError::IncompatibleCapabilities(_) => {
                "Client cannot decode this stream".to_string()
            }
            SessionError::HandshakeFailed(_) => {
                "Transport handshake failed, please create a new transport".to_string()
            }
            SessionError::InvalidRequest(msg) | SessionError::Conflict(msg) => msg.clone(),
        }
    }
}
