//! Kademlia routing table

use kadbus_protocol::types::NODE_ID_BITS;
use kadbus_protocol::{Contact, NodeId};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::kbucket::{Admission, KBucket, PendingProbe, ProbeState};
use crate::transport::PeerTransport;

/// What happened to a contact offered to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The local node itself; never stored
    Ignored,
    /// Already known; refreshed
    Updated,
    /// Stored in a bucket with free space
    Inserted,
    /// Stored after the returned head failed its liveness probe
    Evicted(Contact),
    /// Bucket full and its head answered the probe
    Discarded,
}

/// Kademlia routing table
///
/// Each bucket sits behind its own lock so unrelated buckets never contend.
#[derive(Debug)]
pub struct RoutingTable {
    /// Our local node ID
    local_node_id: NodeId,

    /// Contacts per bucket
    bucket_size: usize,

    /// Buckets indexed by common prefix length with the local id
    buckets: Vec<RwLock<KBucket>>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(local_node_id: NodeId, bucket_count: usize, bucket_size: usize) -> Self {
        let bucket_count = bucket_count.clamp(1, NODE_ID_BITS);
        let buckets = (0..bucket_count)
            .map(|i| RwLock::new(KBucket::new(i, bucket_size)))
            .collect();

        RoutingTable {
            local_node_id,
            bucket_size,
            buckets,
        }
    }

    /// Get our local node ID
    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Bucket a node id falls into
    ///
    /// The index is the common prefix length with the local id; the last
    /// bucket absorbs every longer prefix. `None` for the local id itself.
    pub fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        if node_id == &self.local_node_id {
            return None;
        }
        Some(self.prefix_bucket(node_id))
    }

    fn prefix_bucket(&self, id: &NodeId) -> usize {
        self.local_node_id
            .common_prefix_len(id)
            .min(self.buckets.len() - 1)
    }

    /// Offer a contact without probing. Exposed for callers that run
    /// the probe themselves.
    pub async fn offer(&self, contact: Contact) -> Option<Admission> {
        let index = self.bucket_index(&contact.node_id)?;
        Some(self.buckets[index].write().await.offer(contact))
    }

    /// Apply a probe result to the bucket the probe came from
    pub async fn resolve(&self, probe: PendingProbe, head_alive: bool) -> ProbeState {
        let index = self.prefix_bucket(&probe.head().node_id);
        self.buckets[index].write().await.resolve(probe, head_alive)
    }

    /// Add or refresh a contact, probing the bucket head when full
    ///
    /// No bucket lock is held while the probe is in flight.
    pub async fn add_contact(
        &self,
        contact: Contact,
        transport: &dyn PeerTransport,
        probe_timeout: Duration,
    ) -> AddOutcome {
        let candidate = contact.node_id;
        let Some(admission) = self.offer(contact).await else {
            return AddOutcome::Ignored;
        };

        match admission {
            Admission::Updated => AddOutcome::Updated,
            Admission::Inserted => {
                trace!(node = %candidate, "contact inserted");
                AddOutcome::Inserted
            }
            Admission::NeedsProbe(mut probe) => {
                probe.mark_probed();
                let head = probe.head().clone();
                let alive = matches!(
                    tokio::time::timeout(probe_timeout, transport.ping(&head)).await,
                    Ok(Ok(()))
                );

                match self.resolve(probe, alive).await {
                    ProbeState::Evicted => {
                        debug!(evicted = %head.node_id, admitted = %candidate, "bucket head evicted");
                        AddOutcome::Evicted(head)
                    }
                    _ => AddOutcome::Discarded,
                }
            }
        }
    }

    /// Remove a contact from the routing table
    pub async fn remove(&self, node_id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(node_id)?;
        self.buckets[index].write().await.remove(node_id)
    }

    pub async fn contains(&self, node_id: &NodeId) -> bool {
        match self.bucket_index(node_id) {
            Some(index) => self.buckets[index].read().await.contains(node_id),
            None => false,
        }
    }

    /// Total contacts across all buckets
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.read().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn bucket_len(&self, index: usize) -> usize {
        match self.buckets.get(index) {
            Some(bucket) => bucket.read().await.len(),
            None => 0,
        }
    }

    /// Get all contacts in routing table
    pub async fn all_contacts(&self) -> Vec<Contact> {
        let mut all = Vec::new();
        for bucket in &self.buckets {
            all.extend(bucket.read().await.contacts().iter().cloned());
        }
        all
    }

    /// Up to `k` contacts ordered by ascending distance to `target`
    ///
    /// Buckets are visited in distance tiers: the bucket `target` falls
    /// into, then every deeper bucket (their distances share one top bit),
    /// then shallower buckets one at a time. Collection stops at the first
    /// tier boundary with at least `k` candidates, since every later tier
    /// is strictly farther.
    pub async fn find_closest(&self, target: &NodeId, k: usize) -> Vec<Contact> {
        if k == 0 {
            return Vec::new();
        }

        let home = self.prefix_bucket(target);
        let mut tiers: Vec<Vec<usize>> = vec![vec![home]];
        if home + 1 < self.buckets.len() {
            tiers.push((home + 1..self.buckets.len()).collect());
        }
        for index in (0..home).rev() {
            tiers.push(vec![index]);
        }

        let mut found = Vec::new();
        for tier in tiers {
            for index in tier {
                found.extend(self.buckets[index].read().await.contacts().iter().cloned());
            }
            if found.len() >= k {
                break;
            }
        }

        found.sort_by(|a: &Contact, b: &Contact| target.cmp_distance(&a.node_id, &b.node_id));
        found.truncate(k);
        found
    }

    /// Non-empty buckets not updated for longer than `max_age`
    pub async fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        let mut stale = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            if !bucket.is_empty() && bucket.last_updated.elapsed() > max_age {
                stale.push(bucket.index);
            }
        }
        stale
    }

    /// Mark a bucket as refreshed
    pub async fn mark_refreshed(&self, index: usize) {
        if let Some(bucket) = self.buckets.get(index) {
            bucket.write().await.last_updated = tokio::time::Instant::now();
        }
    }

    #[cfg(test)]
    pub(crate) async fn age_bucket(&self, index: usize, by: Duration) {
        let mut bucket = self.buckets[index].write().await;
        if let Some(past) = bucket.last_updated.checked_sub(by) {
            bucket.last_updated = past;
        }
    }
}
