//! In-process transport
//!
//! A [`MemoryNetwork`] maps addresses to registered [`RpcHandler`]s. Each
//! local node talks through its own [`MemoryTransport`], which carries the
//! sender contact so the remote side can learn about it. Endpoints can be
//! taken offline to simulate churn.

use async_trait::async_trait;
use dashmap::DashMap;
use kadbus_protocol::{
    CallbackMessage, Contact, DataRequest, DataResponse, DhtEntry, FindValueResult, NodeId,
};
use std::sync::Arc;
use tracing::trace;

use crate::error::TransportError;
use crate::transport::{PeerTransport, RpcHandler, RpcResult};

struct Endpoint {
    handler: Arc<dyn RpcHandler>,
    online: bool,
}

/// Registry of in-process RPC endpoints
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: DashMap<String, Endpoint>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `handler` at `address`, replacing any previous endpoint
    pub fn register(&self, address: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        self.endpoints.insert(
            address.into(),
            Endpoint {
                handler,
                online: true,
            },
        );
    }

    pub fn unregister(&self, address: &str) {
        self.endpoints.remove(address);
    }

    /// Take an endpoint offline or bring it back. Unknown addresses are ignored.
    pub fn set_online(&self, address: &str, online: bool) {
        if let Some(mut endpoint) = self.endpoints.get_mut(address) {
            endpoint.online = online;
        }
    }

    pub fn is_online(&self, address: &str) -> bool {
        self.endpoints
            .get(address)
            .map(|endpoint| endpoint.online)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Transport that sends as `local`
    pub fn transport(self: &Arc<Self>, local: Contact) -> MemoryTransport {
        MemoryTransport {
            network: Arc::clone(self),
            local,
        }
    }

    /// Handler behind `to`, if both ends are online
    fn route(&self, from: &Contact, to: &Contact) -> RpcResult<Arc<dyn RpcHandler>> {
        if self
            .endpoints
            .get(&from.address)
            .map(|endpoint| !endpoint.online)
            .unwrap_or(false)
        {
            return Err(TransportError::Unreachable(to.address.clone()));
        }

        match self.endpoints.get(&to.address) {
            Some(endpoint) if endpoint.online => Ok(Arc::clone(&endpoint.handler)),
            _ => Err(TransportError::Unreachable(to.address.clone())),
        }
    }
}

/// One node's view of a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: Contact,
}

impl MemoryTransport {
    pub fn local(&self) -> &Contact {
        &self.local
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn ping(&self, to: &Contact) -> RpcResult<()> {
        trace!(from = %self.local, to = %to, "ping");
        self.network
            .route(&self.local, to)?
            .handle_ping(&self.local)
            .await
    }

    async fn find_node(&self, to: &Contact, target: &NodeId) -> RpcResult<Vec<Contact>> {
        self.network
            .route(&self.local, to)?
            .handle_find_node(&self.local, target)
            .await
    }

    async fn find_value(&self, to: &Contact, key: &str) -> RpcResult<FindValueResult> {
        self.network
            .route(&self.local, to)?
            .handle_find_value(&self.local, key)
            .await
    }

    async fn store(&self, to: &Contact, entry: DhtEntry) -> RpcResult<()> {
        self.network
            .route(&self.local, to)?
            .handle_store(&self.local, entry)
            .await
    }

    async fn callback(&self, to: &Contact, message: CallbackMessage) -> RpcResult<()> {
        self.network
            .route(&self.local, to)?
            .handle_callback(&self.local, message)
            .await
    }

    async fn execute_data_request(
        &self,
        to: &Contact,
        request: DataRequest,
    ) -> RpcResult<DataResponse> {
        self.network
            .route(&self.local, to)?
            .handle_data_request(&self.local, request)
            .await
    }
}
