//! Publish pipeline processors

use async_trait::async_trait;
use futures::future::join_all;
use kadbus_dht::{RpcResult, TransportError};
use kadbus_protocol::{CallbackMessage, DataRequest, NodeId, PublishMessage, Subscription};
use kadbus_runtime::{CacheKey, Event, Outcome, Processor};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use super::REQUEST_NAMESPACE;
use crate::peer::Peer;
use crate::pipelines::{PUBLISH, REPUBLISH};
use crate::waiters::SyncResponse;

pub struct PublishArgs {
    pub peer: Arc<Peer>,
    pub message: PublishMessage,
    /// Deliver only to these subscribers when set
    pub targets: Option<HashSet<NodeId>>,
    pub subscribers: Vec<Subscription>,
    pub failed: Vec<Subscription>,
    /// Deliveries already made for this message
    pub attempt: u32,
}

impl PublishArgs {
    pub fn new(peer: Arc<Peer>, message: PublishMessage) -> Self {
        PublishArgs {
            peer,
            message,
            targets: None,
            subscribers: Vec::new(),
            failed: Vec::new(),
            attempt: 0,
        }
    }

    /// Fresh arguments retrying the subscribers that failed
    fn retry(&self) -> Self {
        PublishArgs {
            targets: Some(self.failed.iter().map(|s| s.subscriber.node_id).collect()),
            attempt: self.attempt + 1,
            ..PublishArgs::new(Arc::clone(&self.peer), self.message.clone())
        }
    }
}

/// When failed deliveries go to the republish queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepublishPolicy {
    /// Only if the message asks for it
    #[default]
    OnFlag,
    Always,
    Never,
}

impl RepublishPolicy {
    pub fn should_republish(&self, message: &PublishMessage) -> bool {
        match self {
            RepublishPolicy::OnFlag => message.republish,
            RepublishPolicy::Always => true,
            RepublishPolicy::Never => false,
        }
    }
}

/// Resolve the subscribers of the message key
pub struct FindSubscriptions;

#[async_trait]
impl Processor<PublishArgs> for FindSubscriptions {
    fn name(&self) -> &str {
        "find-subscriptions"
    }

    async fn process(&self, args: &mut PublishArgs) -> Outcome {
        let key = &args.message.key;
        let entries = match args.peer.node().get_entries(key).await {
            Ok(entries) => entries,
            Err(e) => return Outcome::Fail(e.into()),
        };

        let mut subscribers = Vec::new();
        for entry in entries {
            let subscription = match Subscription::decode(&entry.value) {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(key = %key, publisher = %entry.publisher, error = %e, "skipping undecodable subscription");
                    continue;
                }
            };
            if subscription.subscriber.node_id != entry.publisher {
                warn!(key = %key, publisher = %entry.publisher, "subscription published on behalf of another node");
                continue;
            }
            if let Some(targets) = &args.targets {
                if !targets.contains(&subscription.subscriber.node_id) {
                    continue;
                }
            }
            if !subscription.accepts(&args.message) {
                trace!(key = %key, subscriber = %subscription.subscriber.node_id, "filtered out");
                continue;
            }
            subscribers.push(subscription);
        }

        if subscribers.is_empty() {
            return Outcome::abort(format!("no subscribers for {}", key));
        }
        args.subscribers = subscribers;
        Outcome::Continue
    }
}

/// Cache outbound requests that subscribers will answer
pub struct DetectRequestResponse;

#[async_trait]
impl Processor<PublishArgs> for DetectRequestResponse {
    fn name(&self) -> &str {
        "detect-request-response"
    }

    async fn process(&self, args: &mut PublishArgs) -> Outcome {
        let ttl = args
            .subscribers
            .iter()
            .filter(|s| s.caching.extract(&args.message).is_some())
            .map(|s| s.caching.ttl_secs)
            .max();

        let correlation = args.message.correlation_id();
        if let (Some(ttl), Some(correlation)) = (ttl, correlation) {
            let key = CacheKey::new(REQUEST_NAMESPACE, args.peer.id().to_hex(), &args.message.key)
                .with_correlation(correlation);
            args.peer
                .cache()
                .insert(key, args.message.clone(), Duration::from_secs(ttl));
            debug!(key = %args.message.key, correlation, "cached outbound request");
        }
        Outcome::Continue
    }
}

/// Deliver to every resolved subscriber and queue failures for retry
pub struct PublishMessageProcessor {
    policy: RepublishPolicy,
    max_attempts: u32,
}

impl PublishMessageProcessor {
    pub fn new(policy: RepublishPolicy, max_attempts: u32) -> Self {
        PublishMessageProcessor {
            policy,
            max_attempts,
        }
    }

    fn requeue(&self, args: &PublishArgs) {
        if !self.policy.should_republish(&args.message) {
            debug!(key = %args.message.key, failed = args.failed.len(), "republish disabled; dropping failures");
            return;
        }
        if args.attempt + 1 >= self.max_attempts {
            warn!(
                key = %args.message.key,
                id = %args.message.id,
                attempts = args.attempt + 1,
                "giving up on delivery"
            );
            return;
        }

        let event = Event::new(PUBLISH, args.retry());
        if let Err(e) = args.peer.queues().enqueue(REPUBLISH, event) {
            error!(key = %args.message.key, error = %e, "failed to queue republish");
        }
    }
}

#[async_trait]
impl Processor<PublishArgs> for PublishMessageProcessor {
    fn name(&self) -> &str {
        "publish-message"
    }

    async fn process(&self, args: &mut PublishArgs) -> Outcome {
        let peer = &args.peer;
        let message = &args.message;
        let results = join_all(
            args.subscribers
                .iter()
                .map(|subscription| async move { (subscription, deliver(peer, subscription, message).await) }),
        )
        .await;

        let mut failed = Vec::new();
        for (subscription, result) in results {
            let subscriber = &subscription.subscriber;
            match result {
                Ok(()) => trace!(key = %message.key, subscriber = %subscriber.node_id, "delivered"),
                Err(e) if e.is_transient() => {
                    debug!(key = %message.key, subscriber = %subscriber.node_id, error = %e, "subscriber unavailable");
                    failed.push(subscription.clone());
                }
                Err(e) => {
                    error!(key = %message.key, subscriber = %subscriber.node_id, error = %e, "delivery failed");
                    failed.push(subscription.clone());
                }
            }
        }

        args.failed = failed;
        if !args.failed.is_empty() {
            self.requeue(args);
        }
        Outcome::Continue
    }
}

async fn within<T>(limit: Duration, call: impl Future<Output = RpcResult<T>>) -> RpcResult<T> {
    timeout(limit, call).await.unwrap_or(Err(TransportError::Timeout))
}

async fn deliver(peer: &Peer, subscription: &Subscription, message: &PublishMessage) -> RpcResult<()> {
    let transport = peer.node().transport();
    let limit = peer.node().config().request_timeout();
    let to = &subscription.subscriber;

    if message.is_data_request() {
        let entity_set = subscription
            .entity_set
            .as_deref()
            .unwrap_or(&subscription.topic);
        let request = DataRequest::for_message(message, entity_set)
            .map_err(|e| TransportError::Remote(e.to_string()))?;
        let response = within(limit, transport.execute_data_request(to, request)).await?;
        peer.complete_response(message, SyncResponse::Data(response));
    } else {
        let callback = CallbackMessage {
            topic: subscription.topic.clone(),
            callback: subscription.callback.clone(),
            message: message.clone(),
        };
        within(limit, transport.callback(to, callback)).await?;
    }
    Ok(())
}
