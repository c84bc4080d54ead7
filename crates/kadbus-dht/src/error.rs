//! DHT error types

use thiserror::Error;

/// Errors surfaced by a peer transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Operation not supported by peer")]
    Unsupported,
}

impl TransportError {
    /// Transient failures are retried rather than reported as errors
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Timeout)
    }
}

/// DHT-specific errors
#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    #[error("Too many keys (max {0})")]
    TooManyKeys(usize),

    #[error("Node not initialized")]
    NotInitialized,

    #[error("Bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("Replication failed: {failed} of {attempted} replica stores failed")]
    ReplicationFailed { failed: usize, attempted: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] kadbus_protocol::ProtocolError),
}

/// Result type for DHT operations
pub type Result<T> = std::result::Result<T, DhtError>;
