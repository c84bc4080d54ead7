//! A DHT node
//!
//! Ties the routing table, local storage and a peer transport together:
//! bootstrap, iterative lookup, put/get, and the maintenance passes run by
//! the scheduler (replicate, republish, integrity, bucket refresh).

use async_trait::async_trait;
use futures::future::join_all;
use kadbus_protocol::{Contact, DhtEntry, FindValueResult, NodeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{DhtConfig, NodeRole};
use crate::error::{DhtError, Result, TransportError};
use crate::lookup::{Lookup, LookupParams};
use crate::routing_table::RoutingTable;
use crate::storage::DhtStorage;
use crate::transport::{PeerTransport, RpcHandler, RpcResult};

/// Node lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    Bootstrapping,
    Initialized,
}

/// Replica store results of a put or maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutReport {
    pub replicas_ok: usize,
    pub replicas_failed: usize,
}

impl PutReport {
    pub fn attempted(&self) -> usize {
        self.replicas_ok + self.replicas_failed
    }

    /// More than half of the attempted replica stores failed
    pub fn majority_failed(&self) -> bool {
        self.replicas_failed * 2 > self.attempted()
    }

    fn merge(&mut self, other: PutReport) {
        self.replicas_ok += other.replicas_ok;
        self.replicas_failed += other.replicas_failed;
    }
}

/// Outcome of an integrity pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Entries examined
    pub checked: usize,
    /// Entries found under-replicated
    pub repaired: usize,
    /// Successful repair stores
    pub stores: usize,
}

/// A Kademlia node
pub struct Node {
    contact: Contact,
    config: DhtConfig,
    routing_table: RoutingTable,
    storage: DhtStorage,
    transport: Arc<dyn PeerTransport>,
    state: watch::Sender<NodeState>,
}

impl Node {
    /// Create a node reachable at `contact`
    pub fn new(contact: Contact, config: DhtConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        config.validate()?;

        let routing_table = RoutingTable::new(contact.node_id, config.buckets, config.bucketsize);
        let storage = DhtStorage::with_limits(config.max_keys, config.max_value_size);
        let (state, _) = watch::channel(NodeState::Uninitialized);

        Ok(Node {
            contact,
            config,
            routing_table,
            storage,
            transport,
            state,
        })
    }

    pub fn id(&self) -> NodeId {
        self.contact.node_id
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn storage(&self) -> &DhtStorage {
        &self.storage
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == NodeState::Initialized
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: NodeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(node = %self.id(), from = ?previous, to = ?state, "node state changed");
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(DhtError::NotInitialized)
        }
    }

    fn lookup_params(&self) -> LookupParams {
        LookupParams {
            k: self.config.bucketsize,
            alpha: self.config.concurrency,
            max_rounds: self.config.max_rounds,
            request_timeout: self.config.request_timeout(),
            parallelism: self.config.parallelism,
        }
    }

    /// Join the network through `seeds`
    ///
    /// Reachable seeds are added to the routing table, then a lookup for the
    /// local id fills nearby buckets. With no reachable seed a `Seed` node
    /// initializes alone after the grace period and a `Member` node fails.
    pub async fn bootstrap(&self, seeds: &[Contact]) -> Result<()> {
        self.set_state(NodeState::Bootstrapping);
        info!(node = %self.id(), seeds = seeds.len(), "bootstrapping");

        let mut reachable = 0;
        for seed in seeds.iter().filter(|s| s.node_id != self.id()) {
            match timeout(self.config.request_timeout(), self.transport.ping(seed)).await {
                Ok(Ok(())) => {
                    self.observe(seed).await;
                    reachable += 1;
                }
                Ok(Err(e)) => debug!(seed = %seed, error = %e, "seed unavailable"),
                Err(_) => debug!(seed = %seed, "seed ping timed out"),
            }
        }

        if reachable > 0 {
            self.lookup_nodes(&self.id()).await;
            self.set_state(NodeState::Initialized);
            info!(
                node = %self.id(),
                seeds = reachable,
                contacts = self.routing_table.len().await,
                "bootstrap complete"
            );
            return Ok(());
        }

        match self.config.role {
            NodeRole::Seed => {
                tokio::time::sleep(self.config.bootstrap_grace()).await;
                self.set_state(NodeState::Initialized);
                info!(node = %self.id(), "no seed answered, initialized as seed");
                Ok(())
            }
            NodeRole::Member => {
                self.set_state(NodeState::Uninitialized);
                warn!(node = %self.id(), "no seed answered");
                Err(DhtError::BootstrapFailed(format!(
                    "none of {} seeds answered",
                    seeds.len()
                )))
            }
        }
    }

    /// Stop serving; the node must bootstrap again before use
    pub fn shutdown(&self) {
        self.set_state(NodeState::Uninitialized);
        info!(node = %self.id(), "node shut down");
    }

    /// The `k` closest live contacts to `target`
    pub async fn lookup(&self, target: &NodeId) -> Result<Vec<Contact>> {
        self.ensure_initialized()?;
        Ok(self.lookup_nodes(target).await)
    }

    async fn lookup_nodes(&self, target: &NodeId) -> Vec<Contact> {
        let seeds = self
            .routing_table
            .find_closest(target, self.config.bucketsize)
            .await;
        let outcome = Lookup::for_node(
            self.transport.as_ref(),
            self.id(),
            *target,
            seeds,
            self.lookup_params(),
        )
        .run()
        .await;

        self.learn(outcome.responded).await;
        outcome.closest
    }

    /// Every live entry under `key`, local and remote, newest first
    pub async fn get_entries(&self, key: &str) -> Result<Vec<DhtEntry>> {
        self.ensure_initialized()?;

        let mut merged: HashMap<NodeId, DhtEntry> = HashMap::new();
        let mut keep_newest = |entry: DhtEntry| match merged.get(&entry.publisher) {
            Some(held) if held.version >= entry.version => {}
            _ => {
                merged.insert(entry.publisher, entry);
            }
        };

        for entry in self.storage.get_entries(key) {
            keep_newest(entry);
        }

        let seeds = self
            .routing_table
            .find_closest(&NodeId::for_key(key), self.config.bucketsize)
            .await;
        let outcome = Lookup::for_value(
            self.transport.as_ref(),
            self.id(),
            key,
            seeds,
            self.lookup_params(),
        )
        .run()
        .await;
        self.learn(outcome.responded).await;

        for entry in outcome.entries {
            keep_newest(entry);
        }

        let mut entries: Vec<DhtEntry> = merged
            .into_values()
            .filter(|entry| !entry.is_expired())
            .collect();
        entries.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(entries)
    }

    /// Newest value under `key`, `None` when nobody holds it
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get_entries(key)
            .await?
            .into_iter()
            .next()
            .map(|entry| entry.value))
    }

    /// Like [`Node::get`], but a missing key is an error
    pub async fn get_required(&self, key: &str) -> Result<Vec<u8>> {
        self.get(key)
            .await?
            .ok_or_else(|| DhtError::KeyNotFound(key.to_string()))
    }

    /// Store locally as publisher, then replicate to the `k` closest
    ///
    /// Fails only when most replica stores failed.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<PutReport> {
        self.ensure_initialized()?;

        let entry = DhtEntry::new(key, value, self.id(), self.config.expiration());
        self.storage.store(entry.clone(), true)?;

        let report = self.replicate_entry(entry).await;
        if report.majority_failed() {
            return Err(DhtError::ReplicationFailed {
                failed: report.replicas_failed,
                attempted: report.attempted(),
            });
        }

        debug!(node = %self.id(), key, ok = report.replicas_ok, failed = report.replicas_failed, "put");
        Ok(report)
    }

    /// Stop publishing our entry under `key`. Replicas elsewhere expire.
    pub fn unpublish(&self, key: &str) -> Option<DhtEntry> {
        self.storage.remove_entry(key, &self.id())
    }

    async fn replicate_entry(&self, entry: DhtEntry) -> PutReport {
        let closest = self.lookup_nodes(&entry.key_id()).await;
        self.store_to(&closest, &entry).await
    }

    async fn store_to(&self, contacts: &[Contact], entry: &DhtEntry) -> PutReport {
        let limit = self.config.request_timeout();
        let results = join_all(contacts.iter().map(|contact| async move {
            let result = match timeout(limit, self.transport.store(contact, entry.clone())).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            (contact, result)
        }))
        .await;

        let mut report = PutReport::default();
        for (contact, result) in results {
            match result {
                Ok(()) => report.replicas_ok += 1,
                Err(e) => {
                    warn!(peer = %contact, key = %entry.key, error = %e, "replica store failed");
                    report.replicas_failed += 1;
                }
            }
        }
        report
    }

    /// Re-push originated entries to the current `k` closest without
    /// touching their expiration
    pub async fn replicate(&self) -> Result<PutReport> {
        self.ensure_initialized()?;

        let mut report = PutReport::default();
        let entries = self.storage.originated_entries();
        let count = entries.len();
        for entry in entries {
            report.merge(self.replicate_entry(entry).await);
        }

        info!(node = %self.id(), entries = count, ok = report.replicas_ok, failed = report.replicas_failed, "replicate pass");
        Ok(report)
    }

    /// Refresh the expiration of originated entries and re-push them
    pub async fn republish(&self) -> Result<PutReport> {
        self.ensure_initialized()?;

        let mut report = PutReport::default();
        let entries = self.storage.refresh_originated(self.config.expiration());
        let count = entries.len();
        for entry in entries {
            report.merge(self.replicate_entry(entry).await);
        }

        info!(node = %self.id(), entries = count, ok = report.replicas_ok, failed = report.replicas_failed, "republish pass");
        Ok(report)
    }

    /// Re-replicate held entries that fewer than the expected number of
    /// closest contacts still hold
    ///
    /// Each closest contact is asked directly; only those that answer
    /// without the entry receive a store.
    pub async fn ensure_integrity(&self) -> Result<IntegrityReport> {
        self.ensure_initialized()?;

        let mut report = IntegrityReport::default();
        for entry in self.storage.all_entries() {
            report.checked += 1;

            let closest = self.lookup_nodes(&entry.key_id()).await;
            let expected = self.config.replicas.min(closest.len());

            let (holders, lacking) = self.probe_holders(&closest, &entry).await;
            if holders >= expected {
                continue;
            }

            debug!(
                key = %entry.key,
                holders,
                expected,
                "entry under-replicated"
            );
            report.repaired += 1;
            report.stores += self.store_to(&lacking, &entry).await.replicas_ok;
        }

        if report.repaired > 0 {
            info!(node = %self.id(), checked = report.checked, repaired = report.repaired, "integrity pass");
        }
        Ok(report)
    }

    /// Count contacts holding `entry` (same publisher, same or newer
    /// version) and collect those that answered without it
    async fn probe_holders(&self, contacts: &[Contact], entry: &DhtEntry) -> (usize, Vec<Contact>) {
        let limit = self.config.request_timeout();
        let results = join_all(contacts.iter().map(|contact| async move {
            let result = timeout(limit, self.transport.find_value(contact, &entry.key)).await;
            (contact, result)
        }))
        .await;

        let mut holders = 0;
        let mut lacking = Vec::new();
        for (contact, result) in results {
            match result {
                Ok(Ok(FindValueResult::Found(entries)))
                    if entries
                        .iter()
                        .any(|e| e.publisher == entry.publisher && e.version >= entry.version) =>
                {
                    holders += 1
                }
                Ok(Ok(_)) => lacking.push(contact.clone()),
                Ok(Err(e)) => debug!(peer = %contact, error = %e, "integrity probe failed"),
                Err(_) => debug!(peer = %contact, "integrity probe timed out"),
            }
        }
        (holders, lacking)
    }

    /// Look up a random id in every stale bucket
    pub async fn refresh_buckets(&self) -> Result<usize> {
        self.ensure_initialized()?;

        let stale = self
            .routing_table
            .stale_buckets(self.config.stale_bucket_age())
            .await;
        for index in &stale {
            let target = NodeId::random_in_bucket(&self.id(), *index);
            self.lookup_nodes(&target).await;
            self.routing_table.mark_refreshed(*index).await;
        }

        if !stale.is_empty() {
            debug!(node = %self.id(), buckets = stale.len(), "refreshed stale buckets");
        }
        Ok(stale.len())
    }

    /// Drop expired entries from local storage
    pub fn purge_expired(&self) -> usize {
        let removed = self.storage.purge_expired();
        if removed > 0 {
            debug!(node = %self.id(), removed, "purged expired entries");
        }
        removed
    }

    /// Offer a contact we heard from to the routing table
    async fn observe(&self, contact: &Contact) {
        if contact.node_id != self.id() {
            self.routing_table
                .add_contact(
                    contact.clone(),
                    self.transport.as_ref(),
                    self.config.request_timeout(),
                )
                .await;
        }
    }

    async fn learn(&self, contacts: Vec<Contact>) {
        for contact in &contacts {
            self.observe(contact).await;
        }
    }
}

#[async_trait]
impl RpcHandler for Node {
    async fn handle_ping(&self, from: &Contact) -> RpcResult<()> {
        self.observe(from).await;
        Ok(())
    }

    async fn handle_find_node(&self, from: &Contact, target: &NodeId) -> RpcResult<Vec<Contact>> {
        self.observe(from).await;
        let mut closest = self
            .routing_table
            .find_closest(target, self.config.bucketsize)
            .await;
        closest.retain(|c| c.node_id != from.node_id);
        Ok(closest)
    }

    async fn handle_find_value(&self, from: &Contact, key: &str) -> RpcResult<FindValueResult> {
        self.observe(from).await;
        let entries = self.storage.get_entries(key);
        if !entries.is_empty() {
            return Ok(FindValueResult::Found(entries));
        }

        let mut closest = self
            .routing_table
            .find_closest(&NodeId::for_key(key), self.config.bucketsize)
            .await;
        closest.retain(|c| c.node_id != from.node_id);
        Ok(FindValueResult::Closer(closest))
    }

    async fn handle_store(&self, from: &Contact, entry: DhtEntry) -> RpcResult<()> {
        self.observe(from).await;
        let key = entry.key.clone();
        match self.storage.store(entry, false) {
            Ok(outcome) => {
                debug!(node = %self.id(), key = %key, from = %from.node_id, ?outcome, "stored replica");
                Ok(())
            }
            Err(e) => Err(TransportError::Remote(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Parallelism;
    use crate::memory::MemoryNetwork;
    use std::time::Duration;

    fn test_config() -> DhtConfig {
        DhtConfig {
            bootstrap_grace_secs: 0,
            request_timeout_ms: 500,
            parallelism: Parallelism::Loose,
            ..Default::default()
        }
    }

    fn create_test_node(network: &Arc<MemoryNetwork>, index: usize, config: DhtConfig) -> Arc<Node> {
        let contact = Contact::new(NodeId::random(), format!("mem://node-{}", index));
        let transport = Arc::new(network.transport(contact.clone()));
        let node = Arc::new(Node::new(contact.clone(), config, transport).unwrap());
        network.register(&contact.address, node.clone());
        node
    }

    async fn create_test_network(size: usize, config: DhtConfig) -> (Arc<MemoryNetwork>, Vec<Arc<Node>>) {
        let network = MemoryNetwork::new();
        let nodes: Vec<_> = (0..size)
            .map(|i| create_test_node(&network, i, config.clone()))
            .collect();

        nodes[0].bootstrap(&[]).await.unwrap();
        let seed = nodes[0].contact().clone();
        for node in &nodes[1..] {
            node.bootstrap(&[seed.clone()]).await.unwrap();
        }
        (network, nodes)
    }

    #[tokio::test]
    async fn test_new_node_is_uninitialized() {
        let network = MemoryNetwork::new();
        let node = create_test_node(&network, 0, test_config());

        assert_eq!(node.state(), NodeState::Uninitialized);
        assert!(matches!(
            node.put("k", b"v".to_vec()).await,
            Err(DhtError::NotInitialized)
        ));
        assert!(matches!(node.get("k").await, Err(DhtError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = MemoryNetwork::new();
        let contact = Contact::new(NodeId::random(), "mem://bad");
        let config = DhtConfig {
            concurrency: 0,
            ..Default::default()
        };
        let result = Node::new(contact.clone(), config, Arc::new(network.transport(contact)));
        assert!(matches!(result, Err(DhtError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_seed_initializes_alone() {
        let network = MemoryNetwork::new();
        let node = create_test_node(&network, 0, test_config());

        node.bootstrap(&[]).await.unwrap();
        assert!(node.is_initialized());
    }

    #[tokio::test]
    async fn test_member_without_seeds_fails() {
        let network = MemoryNetwork::new();
        let config = DhtConfig {
            role: NodeRole::Member,
            ..test_config()
        };
        let node = create_test_node(&network, 0, config);
        let ghost = Contact::new(NodeId::random(), "mem://nowhere");

        let result = node.bootstrap(&[ghost]).await;
        assert!(matches!(result, Err(DhtError::BootstrapFailed(_))));
        assert_eq!(node.state(), NodeState::Uninitialized);
    }

    #[tokio::test]
    async fn test_bootstrap_populates_routing_tables() {
        let (_network, nodes) = create_test_network(6, test_config()).await;

        for node in &nodes {
            assert!(node.is_initialized());
            assert!(!node.routing_table().is_empty().await);
        }
        // The seed heard from everyone
        assert_eq!(nodes[0].routing_table().len().await, 5);
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let (_network, nodes) = create_test_network(5, test_config()).await;

        let report = nodes[1].put("topic", b"hello".to_vec()).await.unwrap();
        assert!(report.replicas_ok > 0);
        assert_eq!(report.replicas_failed, 0);

        let value = nodes[4].get("topic").await.unwrap();
        assert_eq!(value, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let (_network, nodes) = create_test_network(3, test_config()).await;

        assert_eq!(nodes[2].get("absent").await.unwrap(), None);
        assert!(matches!(
            nodes[2].get_required("absent").await,
            Err(DhtError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_entries_from_several_publishers() {
        let (_network, nodes) = create_test_network(4, test_config()).await;

        nodes[1].put("topic", b"one".to_vec()).await.unwrap();
        nodes[2].put("topic", b"two".to_vec()).await.unwrap();

        let entries = nodes[3].get_entries("topic").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_store_to_reports_majority_failure() {
        let (network, nodes) = create_test_network(4, test_config()).await;

        for node in &nodes[1..] {
            network.set_online(&node.contact().address, false);
        }
        // The lookup drops unreachable peers, so nothing is attempted
        let report = nodes[0].put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(report.attempted(), 0);

        let entry = DhtEntry::new("k2", b"v".to_vec(), nodes[0].id(), Duration::from_secs(60));
        let contacts: Vec<Contact> = nodes[1..].iter().map(|n| n.contact().clone()).collect();
        let report = nodes[0].store_to(&contacts, &entry).await;
        assert_eq!(report.replicas_failed, 3);
        assert!(report.majority_failed());
    }

    #[tokio::test]
    async fn test_store_handler_rejects_oversized_value() {
        let network = MemoryNetwork::new();
        let config = DhtConfig {
            max_value_size: 4,
            ..test_config()
        };
        let node = create_test_node(&network, 0, config);
        let from = Contact::new(NodeId::random(), "mem://peer");

        let entry = DhtEntry::new("k", b"too large".to_vec(), from.node_id, Duration::from_secs(60));
        let result = node.handle_store(&from, entry).await;
        assert!(matches!(result, Err(TransportError::Remote(_))));
    }

    #[tokio::test]
    async fn test_find_value_returns_closer_when_missing() {
        let (_network, nodes) = create_test_network(4, test_config()).await;
        let from = nodes[1].contact().clone();

        match nodes[0].handle_find_value(&from, "nothing").await.unwrap() {
            FindValueResult::Closer(contacts) => {
                assert!(!contacts.is_empty());
                assert!(contacts.iter().all(|c| c.node_id != from.node_id));
            }
            other => panic!("expected contacts, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_buckets_touches_stale_buckets() {
        let config = DhtConfig {
            stale_bucket_secs: 1,
            ..test_config()
        };
        let (_network, nodes) = create_test_network(4, config).await;
        let node = &nodes[0];

        let index = node
            .routing_table()
            .bucket_index(&nodes[1].id())
            .unwrap();
        node.routing_table()
            .age_bucket(index, Duration::from_secs(5))
            .await;

        assert!(node.refresh_buckets().await.unwrap() >= 1);
        assert!(node
            .routing_table()
            .stale_buckets(node.config().stale_bucket_age())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_every_parallelism_policy_round_trips() {
        for parallelism in [Parallelism::Strict, Parallelism::Bounded, Parallelism::Loose] {
            let config = DhtConfig {
                parallelism,
                ..test_config()
            };
            let (_network, nodes) = create_test_network(5, config).await;
            nodes[2].put("k", b"v".to_vec()).await.unwrap();
            assert_eq!(nodes[3].get("k").await.unwrap(), Some(b"v".to_vec()));
        }
    }

    #[tokio::test]
    async fn test_shutdown_resets_state() {
        let network = MemoryNetwork::new();
        let node = create_test_node(&network, 0, test_config());
        let mut state = node.subscribe_state();

        node.bootstrap(&[]).await.unwrap();
        assert_eq!(*state.borrow_and_update(), NodeState::Initialized);

        node.shutdown();
        assert_eq!(node.state(), NodeState::Uninitialized);
        assert!(state.has_changed().unwrap());
    }
}
