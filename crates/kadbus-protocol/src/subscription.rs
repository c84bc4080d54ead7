//! Subscriptions as published into the DHT

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::message::{PublishMessage, CORRELATION_HEADER};
use crate::types::Contact;

/// Request/response caching options of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachingOptions {
    pub enabled: bool,

    /// How long cached requests and callbacks are kept
    pub ttl_secs: u64,

    /// Header the correlation key is extracted from
    pub correlation_header: Option<String>,
}

impl CachingOptions {
    /// Caching keyed by the standard correlation header
    pub fn correlated(ttl_secs: u64) -> Self {
        CachingOptions {
            enabled: true,
            ttl_secs,
            correlation_header: Some(CORRELATION_HEADER.to_string()),
        }
    }

    /// Correlation key extracted from `message`, when caching applies
    pub fn extract<'a>(&self, message: &'a PublishMessage) -> Option<&'a str> {
        if !self.enabled {
            return None;
        }
        self.correlation_header
            .as_deref()
            .and_then(|header| message.header(header))
    }
}

impl Default for CachingOptions {
    fn default() -> Self {
        CachingOptions {
            enabled: false,
            ttl_secs: 300,
            correlation_header: None,
        }
    }
}

/// Predicate a subscription applies to incoming messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    HeaderEquals { name: String, value: String },
    HeaderPresent(String),
    PayloadContains(Vec<u8>),
    All(Vec<Filter>),
    Any(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn matches(&self, message: &PublishMessage) -> bool {
        match self {
            Filter::HeaderEquals { name, value } => message.header(name) == Some(value.as_str()),
            Filter::HeaderPresent(name) => message.headers.contains_key(name),
            Filter::PayloadContains(needle) => {
                needle.is_empty()
                    || message
                        .payload
                        .windows(needle.len())
                        .any(|window| window == needle.as_slice())
            }
            Filter::All(filters) => filters.iter().all(|f| f.matches(message)),
            Filter::Any(filters) => filters.iter().any(|f| f.matches(message)),
            Filter::Not(filter) => !filter.matches(message),
        }
    }
}

/// A subscriber's interest in a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,

    /// Where deliveries go
    pub subscriber: Contact,

    /// Name of the callback registered on the subscriber
    pub callback: String,

    pub caching: CachingOptions,

    pub filter: Option<Filter>,

    /// Entity set served for data requests
    pub entity_set: Option<String>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, subscriber: Contact, callback: impl Into<String>) -> Self {
        Subscription {
            topic: topic.into(),
            subscriber,
            callback: callback.into(),
            caching: CachingOptions::default(),
            filter: None,
            entity_set: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_caching(mut self, caching: CachingOptions) -> Self {
        self.caching = caching;
        self
    }

    pub fn with_entity_set(mut self, entity_set: impl Into<String>) -> Self {
        self.entity_set = Some(entity_set.into());
        self
    }

    /// Whether the message passes this subscription's filter
    pub fn accepts(&self, message: &PublishMessage) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(message))
    }

    /// Encode for storage as a DHT value
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
    }
}
