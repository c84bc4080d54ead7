//! Core identifier and contact types

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Size of a node ID in bytes (20 bytes / 160 bits)
pub const NODE_ID_SIZE: usize = 20;

/// Number of bits in a node ID
pub const NODE_ID_BITS: usize = NODE_ID_SIZE * 8;

/// An identifier in the Kademlia address space
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Create a NodeId from a byte array
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        NodeId(bytes)
    }

    /// Get the bytes of this NodeId
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        NodeId(rand::random())
    }

    /// Derive the address of a string key: BLAKE2b-512(key)[0:20]
    pub fn for_key(key: &str) -> Self {
        let hash = Blake2b512::digest(key.as_bytes());
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&hash[..NODE_ID_SIZE]);
        NodeId(id)
    }

    /// Random id whose common prefix with `local` is exactly `index` bits.
    ///
    /// Used to refresh the bucket at `index`.
    pub fn random_in_bucket(local: &NodeId, index: usize) -> Self {
        let index = index.min(NODE_ID_BITS - 1);
        let mut bytes: [u8; NODE_ID_SIZE] = rand::random();

        for bit in 0..=index {
            let byte = bit / 8;
            let mask = 0x80u8 >> (bit % 8);
            let local_bit = local.0[byte] & mask;
            let wanted = if bit == index { !local_bit & mask } else { local_bit };
            bytes[byte] = (bytes[byte] & !mask) | wanted;
        }

        NodeId(bytes)
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidNodeId(e.to_string()))?;

        if bytes.len() != NODE_ID_SIZE {
            return Err(ProtocolError::InvalidNodeId(format!(
                "expected {} bytes, got {}",
                NODE_ID_SIZE,
                bytes.len()
            )));
        }

        let mut arr = [0u8; NODE_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(NodeId(arr))
    }

    /// XOR distance to another id
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut result = [0u8; NODE_ID_SIZE];
        for (i, item) in result.iter_mut().enumerate() {
            *item = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    /// Number of leading bits shared with `other` (160 when equal)
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Order `a` and `b` by distance to `self`, ties broken by raw id
    pub fn cmp_distance(&self, a: &NodeId, b: &NodeId) -> Ordering {
        self.distance(a)
            .cmp(&self.distance(b))
            .then_with(|| a.cmp(b))
    }

    /// True when `a` is strictly closer to `self` than `b`
    pub fn closer_than(&self, a: &NodeId, b: &NodeId) -> bool {
        self.cmp_distance(a, b) == Ordering::Less
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl FromStr for NodeId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeId::from_hex(s)
    }
}

/// XOR distance between two ids, ordered as a big-endian unsigned integer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Distance([u8; NODE_ID_SIZE]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; NODE_ID_SIZE]);

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Count of leading zero bits
    pub fn leading_zeros(&self) -> usize {
        for (byte_idx, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        NODE_ID_BITS
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// A known peer: id plus transport address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    pub address: String,
}

impl Contact {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Contact {
            node_id,
            address: address.into(),
        }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.address)
    }
}

/// Parses `<hex-id>@<address>`
impl FromStr for Contact {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, address) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| ProtocolError::InvalidContact(format!("missing '@' in {:?}", s)))?;

        if address.is_empty() {
            return Err(ProtocolError::InvalidContact(format!(
                "empty address in {:?}",
                s
            )));
        }

        Ok(Contact::new(NodeId::from_hex(id)?, address))
    }
}
