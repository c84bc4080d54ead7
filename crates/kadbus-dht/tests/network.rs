//! Multi-node scenarios over the in-process transport

use async_trait::async_trait;
use kadbus_dht::{
    DhtConfig, MemoryNetwork, MemoryTransport, Node, Parallelism, PeerTransport, RpcResult,
};
use kadbus_protocol::{
    CallbackMessage, Contact, DataRequest, DataResponse, DhtEntry, FindValueResult, NodeId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Loose lookups query every shortlist contact, which keeps small
/// networks fully connected after bootstrap
fn test_config() -> DhtConfig {
    DhtConfig {
        bootstrap_grace_secs: 0,
        request_timeout_ms: 500,
        parallelism: Parallelism::Loose,
        ..Default::default()
    }
}

fn add_node(
    network: &Arc<MemoryNetwork>,
    index: usize,
    config: DhtConfig,
    wrap: impl FnOnce(MemoryTransport) -> Arc<dyn PeerTransport>,
) -> Arc<Node> {
    let contact = Contact::new(NodeId::random(), format!("mem://node-{}", index));
    let transport = wrap(network.transport(contact.clone()));
    let node = Arc::new(Node::new(contact.clone(), config, transport).unwrap());
    network.register(&contact.address, node.clone());
    node
}

fn plain(transport: MemoryTransport) -> Arc<dyn PeerTransport> {
    Arc::new(transport)
}

async fn build_network(size: usize, config: DhtConfig) -> (Arc<MemoryNetwork>, Vec<Arc<Node>>) {
    let network = MemoryNetwork::new();
    let nodes: Vec<_> = (0..size)
        .map(|i| add_node(&network, i, config.clone(), plain))
        .collect();

    nodes[0].bootstrap(&[]).await.unwrap();
    let seed = nodes[0].contact().clone();
    for node in &nodes[1..] {
        node.bootstrap(&[seed.clone()]).await.unwrap();
    }
    (network, nodes)
}

/// Counts concurrent `find_node` calls passing through
struct Instrumented {
    inner: MemoryTransport,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    find_nodes: AtomicUsize,
    stores: AtomicUsize,
}

impl Instrumented {
    fn new(inner: MemoryTransport) -> Self {
        Instrumented {
            inner,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            find_nodes: AtomicUsize::new(0),
            stores: AtomicUsize::new(0),
        }
    }

    fn reset(&self) {
        self.max_in_flight.store(0, Ordering::SeqCst);
        self.find_nodes.store(0, Ordering::SeqCst);
        self.stores.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerTransport for Instrumented {
    async fn ping(&self, to: &Contact) -> RpcResult<()> {
        self.inner.ping(to).await
    }

    async fn find_node(&self, to: &Contact, target: &NodeId) -> RpcResult<Vec<Contact>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.find_nodes.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = self.inner.find_node(to, target).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn find_value(&self, to: &Contact, key: &str) -> RpcResult<FindValueResult> {
        self.inner.find_value(to, key).await
    }

    async fn store(&self, to: &Contact, entry: DhtEntry) -> RpcResult<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store(to, entry).await
    }

    async fn callback(&self, to: &Contact, message: CallbackMessage) -> RpcResult<()> {
        self.inner.callback(to, message).await
    }

    async fn execute_data_request(
        &self,
        to: &Contact,
        request: DataRequest,
    ) -> RpcResult<DataResponse> {
        self.inner.execute_data_request(to, request).await
    }
}

#[tokio::test]
async fn put_then_get_round_trips_across_the_network() {
    let (_network, nodes) = build_network(8, test_config()).await;

    let value = b"payload bytes \x00\xff".to_vec();
    nodes[3].put("orders", value.clone()).await.unwrap();

    for node in &nodes {
        assert_eq!(node.get("orders").await.unwrap(), Some(value.clone()));
    }
}

#[tokio::test]
async fn get_survives_loss_of_some_replicas() {
    let (network, nodes) = build_network(8, test_config()).await;
    nodes[1].put("k", b"v".to_vec()).await.unwrap();

    for node in &nodes[2..5] {
        network.set_online(&node.contact().address, false);
    }

    assert_eq!(nodes[7].get("k").await.unwrap(), Some(b"v".to_vec()));
}

/// An id at XOR distance `distance` from `target`, by flipping low bits
fn id_near(target: &NodeId, distance: u8) -> NodeId {
    let mut bytes = *target.as_bytes();
    bytes[19] ^= distance;
    NodeId::from_bytes(bytes)
}

#[tokio::test]
async fn get_reaches_remote_holder_past_offline_closest() {
    let config = DhtConfig {
        bucketsize: 3,
        concurrency: 2,
        parallelism: Parallelism::Strict,
        ..test_config()
    };
    let network = MemoryNetwork::new();
    let target = NodeId::for_key("k");

    let holders: Vec<_> = [1u8, 2, 4]
        .iter()
        .enumerate()
        .map(|(i, distance)| {
            let contact = Contact::new(id_near(&target, *distance), format!("mem://holder-{}", i));
            let transport = Arc::new(network.transport(contact.clone()));
            let node = Arc::new(Node::new(contact.clone(), config.clone(), transport).unwrap());
            network.register(&contact.address, node.clone());
            node
        })
        .collect();

    let mut far = *target.as_bytes();
    far[0] ^= 0x80;
    let reader_contact = Contact::new(NodeId::from_bytes(far), "mem://reader");
    let reader = Arc::new(
        Node::new(
            reader_contact.clone(),
            config.clone(),
            Arc::new(network.transport(reader_contact.clone())),
        )
        .unwrap(),
    );
    network.register(&reader_contact.address, reader.clone());

    for holder in &holders {
        holder.bootstrap(&[]).await.unwrap();
        let entry = DhtEntry::new("k", b"v".to_vec(), holder.id(), Duration::from_secs(60));
        holder.storage().store(entry, true).unwrap();
    }
    let seeds: Vec<_> = holders.iter().map(|h| h.contact().clone()).collect();
    reader.bootstrap(&seeds).await.unwrap();
    assert_eq!(reader.routing_table().len().await, 3);
    assert!(reader.storage().get("k").is_none());

    network.set_online(&holders[0].contact().address, false);
    network.set_online(&holders[1].contact().address, false);

    let entries = reader.get_entries("k").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].publisher, holders[2].id());
    assert_eq!(reader.get("k").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn strict_lookup_never_exceeds_alpha_in_flight() {
    let config = DhtConfig {
        concurrency: 2,
        parallelism: Parallelism::Strict,
        ..test_config()
    };
    let network = MemoryNetwork::new();

    let mut probe = None;
    let observer = add_node(&network, 0, config.clone(), |inner| {
        let instrumented = Arc::new(Instrumented::new(inner));
        probe = Some(instrumented.clone());
        instrumented as Arc<dyn PeerTransport>
    });
    let probe = probe.unwrap();

    let peers: Vec<_> = (1..=5)
        .map(|i| add_node(&network, i, config.clone(), plain))
        .collect();

    observer.bootstrap(&[]).await.unwrap();
    for peer in &peers {
        peer.bootstrap(&[observer.contact().clone()]).await.unwrap();
    }
    assert_eq!(observer.routing_table().len().await, 5);

    probe.reset();
    observer.lookup(&NodeId::random()).await.unwrap();

    assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 2);
    assert!(probe.find_nodes.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn integrity_leaves_replicated_entries_untouched() {
    let network = MemoryNetwork::new();
    let config = DhtConfig {
        replicas: 3,
        ..test_config()
    };

    let mut probe = None;
    let publisher = add_node(&network, 0, config.clone(), |inner| {
        let instrumented = Arc::new(Instrumented::new(inner));
        probe = Some(instrumented.clone());
        instrumented as Arc<dyn PeerTransport>
    });
    let probe = probe.unwrap();
    let others: Vec<_> = (1..6)
        .map(|i| add_node(&network, i, config.clone(), plain))
        .collect();

    publisher.bootstrap(&[]).await.unwrap();
    for node in &others {
        node.bootstrap(&[publisher.contact().clone()]).await.unwrap();
    }

    publisher.put("topic", b"subscription".to_vec()).await.unwrap();
    probe.reset();

    let report = publisher.ensure_integrity().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.repaired, 0);
    assert_eq!(probe.stores.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn integrity_re_replicates_under_replicated_entries() {
    let config = DhtConfig {
        replicas: 3,
        ..test_config()
    };
    let (_network, nodes) = build_network(6, config).await;

    nodes[1].put("topic", b"subscription".to_vec()).await.unwrap();

    // Only nodes[0] keeps a replica
    for node in &nodes[2..] {
        node.storage().remove("topic");
    }

    let report = nodes[1].ensure_integrity().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.stores, 4);

    for node in &nodes {
        assert!(node.storage().contains("topic", &nodes[1].id()));
    }
}

#[tokio::test]
async fn republish_refreshes_remote_expiration() {
    let (_network, nodes) = build_network(4, test_config()).await;
    nodes[0].put("k", b"v".to_vec()).await.unwrap();

    let before = nodes[2].storage().get("k").unwrap().expires_at;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = nodes[0].republish().await.unwrap();
    assert_eq!(report.replicas_failed, 0);
    assert!(report.replicas_ok >= 3);

    let after = nodes[2].storage().get("k").unwrap().expires_at;
    assert!(after > before);
}

#[tokio::test]
async fn replicate_reaches_late_joiners_without_refreshing() {
    let config = test_config();
    let (network, nodes) = build_network(4, config.clone()).await;
    nodes[0].put("k", b"v".to_vec()).await.unwrap();
    let original = nodes[0].storage().get("k").unwrap();

    let late = add_node(&network, 99, config, plain);
    late.bootstrap(&[nodes[1].contact().clone()]).await.unwrap();
    assert!(late.storage().get("k").is_none());

    nodes[0].replicate().await.unwrap();

    let copy = late.storage().get("k").unwrap();
    assert_eq!(copy.value, b"v".to_vec());
    assert_eq!(copy.expires_at, original.expires_at);
}

#[tokio::test]
async fn replicas_are_not_republished_by_holders() {
    let (_network, nodes) = build_network(4, test_config()).await;
    nodes[0].put("k", b"v".to_vec()).await.unwrap();

    assert!(nodes[1].storage().originated_entries().is_empty());
    let report = nodes[1].republish().await.unwrap();
    assert_eq!(report.attempted(), 0);
}
