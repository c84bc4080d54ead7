//! Scheduled maintenance agents

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use kadbus_dht::Node;
use kadbus_pubsub::{drain_republish, MessageCache};
use kadbus_runtime::{Agent, AgentRegistry, QueueManager};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DHT_AGENT: &str = "dht";
pub const REPUBLISH_QUEUE_AGENT: &str = "republish-queue";
pub const CACHE_AGENT: &str = "cache";

/// Default batch of a republish drain
const DEFAULT_MAX_EVENTS: usize = 100;

/// Runs DHT maintenance on every initialized local node
pub struct DhtAgent {
    nodes: Vec<Arc<Node>>,
}

impl DhtAgent {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self { nodes }
    }

    async fn run_on(&self, node: &Node, method: &str) -> Result<()> {
        match method {
            "refresh_buckets" => {
                let refreshed = node.refresh_buckets().await?;
                debug!(node = %node.id(), refreshed, "buckets refreshed");
            }
            "replicate" => {
                let report = node.replicate().await?;
                debug!(node = %node.id(), ok = report.replicas_ok, failed = report.replicas_failed, "replicated");
            }
            "republish" => {
                let report = node.republish().await?;
                debug!(node = %node.id(), ok = report.replicas_ok, failed = report.replicas_failed, "republished");
            }
            "ensure_integrity" => {
                let report = node.ensure_integrity().await?;
                debug!(node = %node.id(), checked = report.checked, repaired = report.repaired, "integrity checked");
            }
            "purge_expired" => {
                let purged = node.purge_expired();
                debug!(node = %node.id(), purged, "expired entries purged");
            }
            other => bail!("dht agent has no method {}", other),
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for DhtAgent {
    fn methods(&self) -> &[&'static str] {
        &[
            "refresh_buckets",
            "replicate",
            "republish",
            "ensure_integrity",
            "purge_expired",
        ]
    }

    async fn invoke(&self, method: &str, _params: &BTreeMap<String, String>) -> Result<()> {
        let mut failed = 0;
        let mut ran = 0;
        for node in self.nodes.iter().filter(|n| n.is_initialized()) {
            ran += 1;
            if let Err(e) = self.run_on(node, method).await {
                warn!(node = %node.id(), method, error = ?e, "maintenance failed");
                failed += 1;
            }
        }

        if failed > 0 {
            bail!("{} failed on {} of {} nodes", method, failed, ran);
        }
        Ok(())
    }
}

/// Re-raises failed publishes through the publish pipeline
pub struct RepublishQueueAgent {
    queues: Arc<QueueManager>,
}

impl RepublishQueueAgent {
    pub fn new(queues: Arc<QueueManager>) -> Self {
        Self { queues }
    }
}

#[async_trait]
impl Agent for RepublishQueueAgent {
    fn methods(&self) -> &[&'static str] {
        &["drain"]
    }

    async fn invoke(&self, method: &str, params: &BTreeMap<String, String>) -> Result<()> {
        if method != "drain" {
            bail!("republish-queue agent has no method {}", method);
        }

        let max_events = match params.get("max_events") {
            Some(value) => value
                .parse()
                .with_context(|| format!("Invalid max_events {}", value))?,
            None => DEFAULT_MAX_EVENTS,
        };

        let drained = drain_republish(&self.queues, max_events).await?;
        debug!(drained, "republish queue drained");
        Ok(())
    }
}

/// Sweeps expired entries out of the shared message cache
pub struct CacheAgent {
    cache: Arc<MessageCache>,
}

impl CacheAgent {
    pub fn new(cache: Arc<MessageCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Agent for CacheAgent {
    fn methods(&self) -> &[&'static str] {
        &["purge_expired"]
    }

    async fn invoke(&self, method: &str, _params: &BTreeMap<String, String>) -> Result<()> {
        if method != "purge_expired" {
            bail!("cache agent has no method {}", method);
        }

        let purged = self.cache.purge_expired();
        debug!(purged, remaining = self.cache.len(), "message cache purged");
        Ok(())
    }
}

/// Agents available to the scheduler
///
/// The republish drain is only offered when the event queues are running.
pub fn registry(
    nodes: Vec<Arc<Node>>,
    queues: Option<Arc<QueueManager>>,
    cache: Arc<MessageCache>,
) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register(DHT_AGENT, Arc::new(DhtAgent::new(nodes)));
    registry.register(CACHE_AGENT, Arc::new(CacheAgent::new(cache)));
    if let Some(queues) = queues {
        registry.register(REPUBLISH_QUEUE_AGENT, Arc::new(RepublishQueueAgent::new(queues)));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use kadbus_dht::{DhtConfig, MemoryNetwork};
    use kadbus_protocol::{Contact, NodeId, PublishMessage};
    use kadbus_runtime::CacheKey;
    use std::time::Duration;

    fn node(network: &Arc<MemoryNetwork>) -> Arc<Node> {
        let contact = Contact::new(NodeId::random(), "mem://agent-test");
        let transport = Arc::new(network.transport(contact.clone()));
        let node = Arc::new(Node::new(contact.clone(), DhtConfig::default(), transport).unwrap());
        network.register(&contact.address, node.clone());
        node
    }

    #[tokio::test]
    async fn test_uninitialized_nodes_are_skipped() {
        let network = MemoryNetwork::new();
        let agent = DhtAgent::new(vec![node(&network)]);

        agent.invoke("republish", &BTreeMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_method_fails_on_initialized_node() {
        let network = MemoryNetwork::new();
        let config = DhtConfig {
            bootstrap_grace_secs: 0,
            ..Default::default()
        };
        let contact = Contact::new(NodeId::random(), "mem://solo");
        let transport = Arc::new(network.transport(contact.clone()));
        let solo = Arc::new(Node::new(contact.clone(), config, transport).unwrap());
        network.register(&contact.address, solo.clone());
        solo.bootstrap(&[]).await.unwrap();

        let agent = DhtAgent::new(vec![solo]);
        agent.invoke("purge_expired", &BTreeMap::new()).await.unwrap();
        assert!(agent.invoke("fly", &BTreeMap::new()).await.is_err());
    }

    #[test]
    fn test_registry_without_queues() {
        let registry = registry(Vec::new(), None, Arc::new(MessageCache::new()));
        assert!(registry.get(DHT_AGENT).is_some());
        assert!(registry.get(CACHE_AGENT).is_some());
        assert!(registry.get(REPUBLISH_QUEUE_AGENT).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_purge_drops_expired_without_reads() {
        let cache = Arc::new(MessageCache::new());
        let message = PublishMessage::new("orders", vec![1]);
        cache.insert(CacheKey::new("request", "n1", "orders"), message.clone(), Duration::from_secs(1));
        cache.insert(CacheKey::new("callback", "n1", "orders"), message, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.len(), 2);

        let agent = CacheAgent::new(cache.clone());
        agent.invoke("purge_expired", &BTreeMap::new()).await.unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&CacheKey::new("callback", "n1", "orders")));
        assert!(agent.invoke("flush", &BTreeMap::new()).await.is_err());
    }
}
