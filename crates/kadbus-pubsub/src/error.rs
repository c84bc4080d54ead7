//! Publish/subscribe error types

use kadbus_dht::{DhtError, TransportError};
use kadbus_protocol::ProtocolError;
use kadbus_runtime::RuntimeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No callback registered as {0}")]
    UnknownCallback(String),

    #[error("No data source registered for entity set {0}")]
    UnknownDataSource(String),

    #[error("Not subscribed to {0}")]
    NotSubscribed(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Peer has been dropped")]
    PeerGone,
}

/// Result type for publish/subscribe operations
pub type Result<T> = std::result::Result<T, PubSubError>;
