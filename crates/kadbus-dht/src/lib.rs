//! kadbus DHT (Distributed Hash Table)
//!
//! This module implements a Kademlia-based DHT for:
//! - Node discovery and routing over a 160-bit XOR metric
//! - Iterative node and value lookup with configurable parallelism
//! - Replicated key-value storage with expiration
//! - Republish and integrity maintenance under churn
//!
//! The network itself is abstracted behind [`PeerTransport`] and
//! [`RpcHandler`]; [`memory`] provides an in-process implementation.

pub mod config;
pub mod error;
pub mod kbucket;
pub mod lookup;
pub mod memory;
pub mod node;
pub mod routing_table;
pub mod storage;
pub mod transport;

pub use config::{DhtConfig, NodeRole, Parallelism};
pub use error::{DhtError, Result, TransportError};
pub use kbucket::{Admission, KBucket, PendingProbe, ProbeState};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use node::{IntegrityReport, Node, NodeState, PutReport};
pub use routing_table::{AddOutcome, RoutingTable};
pub use storage::{DhtStorage, StoreOutcome, StoredEntry};
pub use transport::{PeerTransport, RpcHandler, RpcResult};

/// Kademlia k parameter (nodes per k-bucket)
pub const K: usize = 20;

/// Alpha parameter (parallel queries)
pub const ALPHA: usize = 3;

/// Maximum number of DHT keys
pub const MAX_DHT_KEYS: usize = 10_000;

/// Maximum value size (bytes)
pub const MAX_VALUE_SIZE: usize = 1024 * 1024; // 1MB
