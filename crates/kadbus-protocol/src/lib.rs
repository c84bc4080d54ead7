//! kadbus Protocol Module
//!
//! This module defines the data structures shared by the DHT and the
//! publish/subscribe layer: identifiers, contacts, DHT entries,
//! subscriptions and publish messages.

pub mod entry;
pub mod error;
pub mod message;
pub mod subscription;
pub mod time;
pub mod types;

pub use entry::{DhtEntry, FindValueResult};
pub use error::{ProtocolError, Result};
pub use message::{
    CallbackMessage, DataRequest, DataResponse, MessageKind, PublishMessage,
    CORRELATION_HEADER,
};
pub use subscription::{CachingOptions, Filter, Subscription};
pub use types::{Contact, Distance, NodeId, NODE_ID_SIZE};
