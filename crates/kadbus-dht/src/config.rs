//! DHT tuning parameters

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DhtError, Result};
use crate::{ALPHA, K, MAX_DHT_KEYS, MAX_VALUE_SIZE};
use kadbus_protocol::types::NODE_ID_BITS;

/// Lookup concurrency policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parallelism {
    /// Rounds of exactly `alpha` requests, each round fully awaited
    Strict,
    /// At most `alpha` requests in flight, refilled as replies arrive
    #[default]
    Bounded,
    /// Every unqueried shortlist contact at once, per round
    Loose,
}

/// How a node behaves when no seed answers during bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// First node of a network: initializes alone after the grace period
    #[default]
    Seed,
    /// Must reach at least one seed
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Contacts per bucket (k)
    pub bucketsize: usize,
    /// Number of buckets in the routing table
    pub buckets: usize,
    /// Lookup parallelism (alpha)
    pub concurrency: usize,
    pub parallelism: Parallelism,
    pub max_rounds: usize,
    pub request_timeout_ms: u64,
    pub expiration_secs: u64,
    /// Expected replica count checked by the integrity pass
    pub replicas: usize,
    pub stale_bucket_secs: u64,
    pub max_keys: usize,
    pub max_value_size: usize,
    pub role: NodeRole,
    pub bootstrap_grace_secs: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            bucketsize: K,
            buckets: NODE_ID_BITS,
            concurrency: ALPHA,
            parallelism: Parallelism::default(),
            max_rounds: 8,
            request_timeout_ms: 2_000,
            expiration_secs: 24 * 3600,
            replicas: 3,
            stale_bucket_secs: 3600,
            max_keys: MAX_DHT_KEYS,
            max_value_size: MAX_VALUE_SIZE,
            role: NodeRole::default(),
            bootstrap_grace_secs: 2,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucketsize == 0 {
            return Err(DhtError::InvalidConfig("bucketsize must be > 0".into()));
        }
        if self.buckets == 0 || self.buckets > NODE_ID_BITS {
            return Err(DhtError::InvalidConfig(format!(
                "buckets must be in 1..={}",
                NODE_ID_BITS
            )));
        }
        if self.concurrency == 0 {
            return Err(DhtError::InvalidConfig("concurrency must be > 0".into()));
        }
        if self.max_rounds == 0 {
            return Err(DhtError::InvalidConfig("max_rounds must be > 0".into()));
        }
        Ok(())
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stale_bucket_age(&self) -> Duration {
        Duration::from_secs(self.stale_bucket_secs)
    }

    pub fn bootstrap_grace(&self) -> Duration {
        Duration::from_secs(self.bootstrap_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(DhtConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_bucket_count() {
        let config = DhtConfig {
            buckets: 161,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DhtError::InvalidConfig(_))));
    }
}
