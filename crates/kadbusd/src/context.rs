//! Process lifecycle: nodes, event queues and the scheduler

use anyhow::{Context, Result};
use kadbus_dht::{MemoryNetwork, Node};
use kadbus_protocol::Contact;
use kadbus_pubsub::{build_queues, MessageCache, Peer, RepublishPolicy};
use kadbus_runtime::{QueueManager, Scheduler};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agents;
use crate::config::Config;

/// Everything the daemon runs
///
/// Event queues and the scheduler start independently: either failing is
/// logged and the rest keeps running.
pub struct AppContext {
    config: Config,
    token: CancellationToken,
    network: Arc<MemoryNetwork>,
    cache: Arc<MessageCache>,
    nodes: Vec<Arc<Node>>,
    peers: Vec<Arc<Peer>>,
    queues: Option<Arc<QueueManager>>,
    scheduler: Option<JoinHandle<()>>,
}

impl AppContext {
    pub async fn start(config: Config) -> Result<Self> {
        info!("Initializing kadbus components...");
        let token = CancellationToken::new();
        let network = MemoryNetwork::new();
        let cache = Arc::new(MessageCache::new());

        let queues = match build_queues(&config.pipelines, RepublishPolicy::default(), token.child_token()) {
            Ok(queues) => {
                let queues = Arc::new(queues);
                queues.start().await;
                info!("✓ Event queues started");
                Some(queues)
            }
            Err(e) => {
                error!(error = %e, "event queues failed to start; pub/sub disabled");
                None
            }
        };

        let dht_config = config.dht_config();
        let mut nodes = Vec::with_capacity(config.node.instances);
        let mut peers = Vec::new();
        for index in 0..config.node.instances {
            let contact = Contact::new(config.node_id(index)?, format!("mem://kadbusd-{}", index));
            let transport = Arc::new(network.transport(contact.clone()));
            let node = Arc::new(
                Node::new(contact.clone(), dht_config.clone(), transport)
                    .context("Failed to create DHT node")?,
            );

            match &queues {
                Some(queues) => {
                    let peer = Peer::new(node.clone(), queues.clone(), cache.clone());
                    network.register(&contact.address, peer.clone());
                    peers.push(peer);
                }
                None => network.register(&contact.address, node.clone()),
            }
            nodes.push(node);
        }
        info!(instances = nodes.len(), "✓ DHT nodes created");

        bootstrap(&config, &nodes).await?;

        let scheduler = {
            let registry = agents::registry(nodes.clone(), queues.clone(), cache.clone());
            match Scheduler::new(&config.scheduling, &registry, token.child_token()) {
                Ok(scheduler) => {
                    info!(agents = scheduler.len(), "✓ Scheduler started");
                    Some(scheduler.spawn())
                }
                Err(e) => {
                    error!(error = %e, "scheduler failed to start; maintenance disabled");
                    None
                }
            }
        };

        for node in &nodes {
            info!(node = %node.id(), address = %node.contact().address, state = ?node.state(), "node ready");
        }

        Ok(Self {
            config,
            token,
            network,
            cache,
            nodes,
            peers,
            queues,
            scheduler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Empty when the event queues failed to start
    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    pub fn queues(&self) -> Option<&Arc<QueueManager>> {
        self.queues.as_ref()
    }

    pub fn is_scheduling(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Wait for Ctrl+C or cancellation of the context token
    pub async fn wait_for_shutdown(&self) {
        tokio::select! {
            result = signal::ctrl_c() => match result {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
            },
            _ = self.token.cancelled() => info!("Received shutdown signal"),
        }
    }

    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down kadbus...");
        self.token.cancel();

        if let Some(scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.await {
                warn!(error = %e, "scheduler ended abnormally");
            }
        }
        if let Some(queues) = &self.queues {
            queues.shutdown().await;
        }
        for node in &self.nodes {
            self.network.unregister(&node.contact().address);
            node.shutdown();
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// The first instance joins the configured seeds, the others join it
async fn bootstrap(config: &Config, nodes: &[Arc<Node>]) -> Result<()> {
    let Some((first, rest)) = nodes.split_first() else {
        return Ok(());
    };

    let seeds = config.bootstrap_contacts()?;
    if let Err(e) = first.bootstrap(&seeds).await {
        error!(node = %first.id(), error = %e, "bootstrap failed");
        return Ok(());
    }

    let local_seed = [first.contact().clone()];
    for node in rest {
        if let Err(e) = node.bootstrap(&local_seed).await {
            error!(node = %node.id(), error = %e, "bootstrap failed");
        }
    }
    Ok(())
}
