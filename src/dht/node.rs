use super::error::DhtError;
use crate::config::{COMPACT_NODE_LEN, NODE_ID_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng as _;
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::time::Instant;

const MAX_FAILURES: u8 = 3;

/// 160-bit node identifier. Keys of stored values share the same space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn generate() -> Self {
        let mut id = [0u8; NODE_ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    /// Maps an arbitrary key into the id space with SHA-1.
    pub fn from_key(key: &[u8]) -> Self {
        Self(Sha1::digest(key).into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// XOR distance. Byte arrays compare lexicographically, which matches
    /// comparing the distances as big-endian integers.
    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut dist = [0u8; NODE_ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Index of the first differing bit; 159 when the ids are equal.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let dist = self.distance(other);

        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        NODE_ID_LEN * 8 - 1
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A peer as known to the routing table or to a running lookup.
///
/// `invalid` marks a node that failed us; it sorts after every valid node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub invalid: bool,
    pub last_seen: Instant,
    pub failures: u8,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            invalid: false,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
        self.invalid = false;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.invalid = true;
    }

    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
    }

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..NODE_ID_LEN]).ok()?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);

        Some(Self::new(id, SocketAddr::new(IpAddr::V4(ip), port)))
    }

    /// IPv6 nodes have no compact form and yield `None`.
    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let SocketAddr::V4(v4) = self.addr else {
            return None;
        };
        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..20].copy_from_slice(&self.id.0);
        compact[20..24].copy_from_slice(&v4.ip().octets());
        compact[24..26].copy_from_slice(&v4.port().to_be_bytes());
        Some(compact)
    }
}

/// Orders nodes for a lookup towards `target`: valid before invalid, then
/// nearest first.
pub fn compare_by_distance(target: &NodeId, a: &Node, b: &Node) -> Ordering {
    a.invalid
        .cmp(&b.invalid)
        .then_with(|| target.distance(&a.id).cmp(&target.distance(&b.id)))
}

pub fn sort_by_distance(target: &NodeId, nodes: &mut [Node]) {
    nodes.sort_by(|a, b| compare_by_distance(target, a, b));
}

pub fn pack_nodes(nodes: &[Node]) -> Bytes {
    let mut out = BytesMut::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for compact in nodes.iter().filter_map(Node::to_compact) {
        out.put_slice(&compact);
    }
    out.freeze()
}

/// Trailing bytes that do not form a whole entry are ignored.
pub fn unpack_nodes(data: &[u8]) -> Vec<Node> {
    data.chunks_exact(COMPACT_NODE_LEN)
        .filter_map(Node::from_compact)
        .collect()
}
