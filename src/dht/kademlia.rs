use crate::crypto::{bencode_bytes, sha1};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// 节点ID字节长度（mainline DHT使用160位）
pub const ID_LEN: usize = 20;

#[derive(Error, Debug, Clone)]
pub enum KademliaError {
    #[error("Invalid node info: {0}")]
    InvalidNodeInfo(String),

    #[error("DHT operation failed: {0}")]
    OperationFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Remote rejected request: {0}")]
    Rejected(String),
}

/// Configuration for the Kademlia DHT
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// The number of nodes to keep in each k-bucket, and the number of
    /// closest nodes a put is stored on
    pub k: usize,
    /// The number of nodes to query in parallel during traversals
    pub alpha: usize,
    /// Timeout for a single node query
    pub query_timeout: Duration,
    /// Routing entries not seen for this long are evicted first
    pub node_ttl: Duration,
    /// How long a node keeps a stored item before forgetting it
    pub item_ttl: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 8,
            alpha: 15,
            query_timeout: Duration::from_secs(2),
            node_ttl: Duration::from_secs(900),   // 15 minutes
            item_ttl: Duration::from_secs(7200),  // 2 hours
        }
    }
}

/// Represents a node's identifier (or a lookup target) in the DHT
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    /// Generates a random NodeId
    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut id);
        Self(id)
    }

    /// Target of a mutable item: SHA1(key ‖ salt)
    pub fn for_mutable(key: &[u8; 32], salt: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(32 + salt.len());
        buf.extend_from_slice(key);
        buf.extend_from_slice(salt);
        Self(sha1(&buf))
    }

    /// Target of an immutable item: SHA1 of the bencoded value
    pub fn for_immutable(value: &[u8]) -> Self {
        Self(sha1(&bencode_bytes(value)))
    }

    /// Calculates the XOR distance between two NodeIds
    pub fn distance(&self, other: &Self) -> [u8; ID_LEN] {
        let mut result = [0u8; ID_LEN];

        for i in 0..ID_LEN {
            result[i] = self.0[i] ^ other.0[i];
        }

        result
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = KademliaError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != ID_LEN {
            return Err(KademliaError::InvalidNodeInfo(
                format!("Invalid length: expected {}, got {}", ID_LEN, bytes.len())
            ));
        }

        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);

        Ok(Self(id))
    }
}

/// Represents information about a node in the network
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The node's ID
    pub id: NodeId,
    /// The node's UDP address
    pub addr: SocketAddr,
    /// The time when this node was last heard from
    pub last_seen: SystemTime,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: SystemTime::now(),
        }
    }

    /// 标记节点最近活跃
    pub fn touch(&mut self) {
        self.last_seen = SystemTime::now();
    }

    /// Checks if the node has not been seen within `ttl`
    pub fn is_expired(&self, ttl: Duration) -> bool {
        match SystemTime::now().duration_since(self.last_seen) {
            Ok(age) => age > ttl,
            Err(_) => false, // Clock went backwards, consider not expired
        }
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInfo")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_is_symmetric() {
        let a = NodeId::random();
        let b = NodeId::random();

        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; ID_LEN]);
    }

    #[test]
    fn test_targets() {
        let key = [3u8; 32];
        assert_eq!(NodeId::for_mutable(&key, b""), NodeId(sha1(&key)));
        assert_ne!(NodeId::for_mutable(&key, b""), NodeId::for_mutable(&key, b"salt"));

        // 不可变条目的目标为bencode后值的哈希
        assert_eq!(NodeId::for_immutable(b"hi"), NodeId(sha1(b"2:hi")));
    }

    #[test]
    fn test_node_id_from_slice() {
        assert!(NodeId::try_from(&[0u8; 19][..]).is_err());
        assert_eq!(NodeId::try_from(&[1u8; 20][..]).unwrap(), NodeId([1u8; 20]));
    }
}
