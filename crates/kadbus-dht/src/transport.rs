//! The peer transport boundary
//!
//! `PeerTransport` is what the core calls to reach a remote peer;
//! `RpcHandler` is what a transport calls when a request arrives. Any RPC
//! mechanism implementing both sides can carry the DHT.

use async_trait::async_trait;
use kadbus_protocol::{
    CallbackMessage, Contact, DataRequest, DataResponse, DhtEntry, FindValueResult, NodeId,
};

use crate::error::TransportError;

/// Result type for transport calls
pub type RpcResult<T> = std::result::Result<T, TransportError>;

/// Outbound side: issue requests to a remote peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Liveness check
    async fn ping(&self, to: &Contact) -> RpcResult<()>;

    async fn find_node(&self, to: &Contact, target: &NodeId) -> RpcResult<Vec<Contact>>;

    async fn find_value(&self, to: &Contact, key: &str) -> RpcResult<FindValueResult>;

    async fn store(&self, to: &Contact, entry: DhtEntry) -> RpcResult<()>;

    async fn callback(&self, to: &Contact, message: CallbackMessage) -> RpcResult<()>;

    async fn execute_data_request(
        &self,
        to: &Contact,
        request: DataRequest,
    ) -> RpcResult<DataResponse>;
}

/// Inbound side: serve requests from remote peers
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle_ping(&self, from: &Contact) -> RpcResult<()>;

    async fn handle_find_node(&self, from: &Contact, target: &NodeId) -> RpcResult<Vec<Contact>>;

    async fn handle_find_value(&self, from: &Contact, key: &str) -> RpcResult<FindValueResult>;

    async fn handle_store(&self, from: &Contact, entry: DhtEntry) -> RpcResult<()>;

    async fn handle_callback(&self, _from: &Contact, _message: CallbackMessage) -> RpcResult<()> {
        Err(TransportError::Unsupported)
    }

    async fn handle_data_request(
        &self,
        _from: &Contact,
        _request: DataRequest,
    ) -> RpcResult<DataResponse> {
        Err(TransportError::Unsupported)
    }
}
