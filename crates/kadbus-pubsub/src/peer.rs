//! A DHT node extended with publish/subscribe
//!
//! A [`Peer`] owns its [`Node`] and everything a subscriber needs locally:
//! its subscriptions, named callbacks and data sources, and the waiters of
//! synchronous publishes. Work is handed to the shared event queues; the
//! event arguments carry the peer so one set of pipelines serves every peer
//! in the process.

use async_trait::async_trait;
use dashmap::DashMap;
use kadbus_dht::{Node, RpcHandler, RpcResult, TransportError};
use kadbus_protocol::{
    CallbackMessage, Contact, DataRequest, DataResponse, DhtEntry, FindValueResult, NodeId,
    PublishMessage, Subscription, CORRELATION_HEADER,
};
use kadbus_runtime::{Event, ExpiringCache, QueueManager};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

use crate::context::{ActiveContexts, CallbackContext};
use crate::error::{PubSubError, Result};
use crate::pipelines::{CALLBACK, PUBLISH, SUBSCRIBE};
use crate::processors::{CallbackArgs, PublishArgs, SubscribeArgs};
use crate::waiters::{ResponseWaiters, SyncResponse};

/// Cache shared by every peer in the process
pub type MessageCache = ExpiringCache<PublishMessage>;

/// Handler invoked for messages delivered to a local subscription
#[async_trait]
pub trait SubscriptionCallback: Send + Sync {
    async fn on_message(
        &self,
        context: &CallbackContext,
        message: &PublishMessage,
    ) -> anyhow::Result<()>;
}

/// Serves data requests against one entity set
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn execute(&self, request: &DataRequest) -> anyhow::Result<DataResponse>;
}

pub struct Peer {
    node: Arc<Node>,
    queues: Arc<QueueManager>,
    cache: Arc<MessageCache>,
    waiters: ResponseWaiters,
    contexts: ActiveContexts,
    subscriptions: DashMap<String, Subscription>,
    callbacks: DashMap<String, Arc<dyn SubscriptionCallback>>,
    data_sources: DashMap<String, Arc<dyn DataSource>>,
    me: Weak<Peer>,
}

impl Peer {
    pub fn new(node: Arc<Node>, queues: Arc<QueueManager>, cache: Arc<MessageCache>) -> Arc<Self> {
        Arc::new_cyclic(|me| Peer {
            node,
            queues,
            cache,
            waiters: ResponseWaiters::new(),
            contexts: ActiveContexts::new(),
            subscriptions: DashMap::new(),
            callbacks: DashMap::new(),
            data_sources: DashMap::new(),
            me: me.clone(),
        })
    }

    fn handle(&self) -> Result<Arc<Peer>> {
        self.me.upgrade().ok_or(PubSubError::PeerGone)
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn contact(&self) -> &Contact {
        self.node.contact()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    pub fn waiters(&self) -> &ResponseWaiters {
        &self.waiters
    }

    /// Callbacks currently running on this peer
    pub fn contexts(&self) -> &ActiveContexts {
        &self.contexts
    }

    pub fn register_callback(&self, name: impl Into<String>, callback: Arc<dyn SubscriptionCallback>) {
        self.callbacks.insert(name.into(), callback);
    }

    pub fn register_data_source(&self, entity_set: impl Into<String>, source: Arc<dyn DataSource>) {
        self.data_sources.insert(entity_set.into(), source);
    }

    pub(crate) fn callback(&self, name: &str) -> Option<Arc<dyn SubscriptionCallback>> {
        self.callbacks.get(name).map(|cb| Arc::clone(cb.value()))
    }

    /// A subscription to `topic` delivered to this peer's `callback`
    pub fn new_subscription(&self, topic: impl Into<String>, callback: impl Into<String>) -> Subscription {
        Subscription::new(topic, self.contact().clone(), callback)
    }

    pub fn subscription(&self, topic: &str) -> Option<Subscription> {
        self.subscriptions.get(topic).map(|s| s.value().clone())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.iter().map(|s| s.value().clone()).collect()
    }

    /// Register locally and announce the subscription through the DHT
    ///
    /// Subscribing again to the same topic replaces the previous
    /// subscription.
    pub fn subscribe(&self, subscription: Subscription) -> Result<()> {
        if !self.callbacks.contains_key(&subscription.callback) {
            return Err(PubSubError::UnknownCallback(subscription.callback));
        }

        let subscription = Subscription {
            subscriber: self.contact().clone(),
            ..subscription
        };
        self.subscriptions
            .insert(subscription.topic.clone(), subscription.clone());

        info!(node = %self.id(), topic = %subscription.topic, "subscribing");
        let args = SubscribeArgs::new(self.handle()?, subscription);
        self.queues.enqueue(SUBSCRIBE, Event::new(SUBSCRIBE, args))?;
        Ok(())
    }

    /// Stop serving `topic`; replicas of the subscription expire
    pub fn unsubscribe(&self, topic: &str) -> Option<Subscription> {
        let removed = self.subscriptions.remove(topic).map(|(_, s)| s);
        if removed.is_some() {
            self.node.unpublish(topic);
            info!(node = %self.id(), topic, "unsubscribed");
        }
        removed
    }

    /// Queue `message` for delivery to every matching subscriber
    pub fn publish(&self, message: PublishMessage) -> Result<()> {
        debug!(node = %self.id(), key = %message.key, id = %message.id, "publishing");
        let args = PublishArgs::new(self.handle()?, message);
        self.queues.enqueue(PUBLISH, Event::new(PUBLISH, args))?;
        Ok(())
    }

    /// Publish and wait for the correlated response
    ///
    /// The message id becomes the correlation id when the message carries
    /// none.
    pub async fn publish_sync(&self, message: PublishMessage, limit: Duration) -> Result<SyncResponse> {
        let message = match message.correlation_id() {
            Some(_) => message,
            None => {
                let id = message.id.to_string();
                message.with_header(CORRELATION_HEADER, id)
            }
        };
        let correlation = message.correlation_id().unwrap_or_default().to_string();

        let handle = self.waiters.register(correlation.clone());
        if let Err(e) = self.publish(message) {
            self.waiters.cancel(&correlation);
            return Err(e);
        }
        self.waiters.wait(handle, limit).await
    }

    /// Complete the synchronous publish `message` belongs to, if any
    pub(crate) fn complete_response(&self, message: &PublishMessage, response: SyncResponse) -> bool {
        match message.correlation_id() {
            Some(correlation) => self.waiters.complete(correlation, response),
            None => false,
        }
    }

    fn rpc_handle(&self) -> RpcResult<Arc<Peer>> {
        self.me
            .upgrade()
            .ok_or_else(|| TransportError::Unreachable(self.contact().address.clone()))
    }
}

#[async_trait]
impl RpcHandler for Peer {
    async fn handle_ping(&self, from: &Contact) -> RpcResult<()> {
        self.node.handle_ping(from).await
    }

    async fn handle_find_node(&self, from: &Contact, target: &NodeId) -> RpcResult<Vec<Contact>> {
        self.node.handle_find_node(from, target).await
    }

    async fn handle_find_value(&self, from: &Contact, key: &str) -> RpcResult<FindValueResult> {
        self.node.handle_find_value(from, key).await
    }

    async fn handle_store(&self, from: &Contact, entry: DhtEntry) -> RpcResult<()> {
        self.node.handle_store(from, entry).await
    }

    async fn handle_callback(&self, from: &Contact, message: CallbackMessage) -> RpcResult<()> {
        if !self.subscriptions.contains_key(&message.topic) {
            return Err(TransportError::Remote(
                PubSubError::NotSubscribed(message.topic).to_string(),
            ));
        }

        let args = CallbackArgs::new(self.rpc_handle()?, from.clone(), message);
        self.queues
            .enqueue(CALLBACK, Event::new(CALLBACK, args))
            .map_err(|e| TransportError::Remote(e.to_string()))
    }

    async fn handle_data_request(&self, from: &Contact, request: DataRequest) -> RpcResult<DataResponse> {
        let source = self
            .data_sources
            .get(&request.entity_set)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| {
                TransportError::Remote(
                    PubSubError::UnknownDataSource(request.entity_set.clone()).to_string(),
                )
            })?;

        debug!(node = %self.id(), from = %from.node_id, entity_set = %request.entity_set, "serving data request");
        source
            .execute(&request)
            .await
            .map_err(|e| TransportError::Remote(format!("{:#}", e)))
    }
}
