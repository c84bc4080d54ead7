//! DHT entries as exchanged between peers

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::time::now_millis;
use crate::types::{Contact, NodeId};

/// A value stored in the DHT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtEntry {
    /// String key the entry is published under
    pub key: String,

    /// Opaque value
    pub value: Vec<u8>,

    /// Node that originally published the entry
    pub publisher: NodeId,

    /// Publisher wall-clock millis at write time (last-write-wins)
    pub version: u64,

    /// Expiration (Unix millis)
    pub expires_at: u64,
}

impl DhtEntry {
    /// Create a fresh entry expiring `ttl` from now
    pub fn new(key: impl Into<String>, value: Vec<u8>, publisher: NodeId, ttl: Duration) -> Self {
        let now = now_millis();
        DhtEntry {
            key: key.into(),
            value,
            publisher,
            version: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
        }
    }

    /// DHT address of this entry's key
    pub fn key_id(&self) -> NodeId {
        NodeId::for_key(&self.key)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime in millis
    pub fn ttl_remaining(&self) -> u64 {
        self.expires_at.saturating_sub(now_millis())
    }

    /// Same entry with its expiration pushed `ttl` past now
    pub fn refreshed(&self, ttl: Duration) -> Self {
        DhtEntry {
            expires_at: now_millis().saturating_add(ttl.as_millis() as u64),
            ..self.clone()
        }
    }
}

/// Reply to a FindValue RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindValueResult {
    /// The peer holds live entries under the key
    Found(Vec<DhtEntry>),

    /// The peer does not hold the key; these are its closest contacts
    Closer(Vec<Contact>),
}
