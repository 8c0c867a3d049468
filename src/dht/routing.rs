use std::collections::VecDeque;

use parking_lot::RwLock;

use super::node::{sort_by_distance, Node, NodeId};

const NUM_BUCKETS: usize = 160;

#[derive(Debug)]
struct Bucket {
    nodes: VecDeque<Node>,
    replacements: VecDeque<Node>,
    k: usize,
}

impl Bucket {
    fn new(k: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(k),
            replacements: VecDeque::with_capacity(k),
            k,
        }
    }

    fn insert(&mut self, node: Node, contacted: bool) {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == node.id) {
            if contacted {
                existing.addr = node.addr;
                existing.touch();
            }
            return;
        }

        let mut node = node;
        if contacted {
            node.touch();
        }

        if self.nodes.len() < self.k {
            self.nodes.push_back(node);
        } else if let Some(pos) = self.nodes.iter().position(|n| n.invalid) {
            self.nodes.remove(pos);
            self.nodes.push_back(node);
        } else if !self.replacements.iter().any(|n| n.id == node.id) {
            if self.replacements.len() >= self.k {
                self.replacements.pop_front();
            }
            self.replacements.push_back(node);
        }
    }

    /// Marks the node invalid and swaps in the newest replacement if there
    /// is one. Without a replacement the node stays until it turns bad.
    fn invalidate(&mut self, id: &NodeId) {
        let Some(pos) = self.nodes.iter().position(|n| &n.id == id) else {
            return;
        };
        self.nodes[pos].fail();

        if let Some(replacement) = self.replacements.pop_back() {
            self.nodes.remove(pos);
            self.nodes.push_back(replacement);
        } else if self.nodes[pos].is_bad() {
            self.nodes.remove(pos);
        }
    }
}

/// Known peers bucketed by shared prefix length with the local id.
///
/// Nodes never move between buckets; each bucket keeps up to `k` entries
/// plus a small replacement list.
pub struct RoutingTable {
    local: Node,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(local: Node, k: usize) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| RwLock::new(Bucket::new(k))).collect();
        Self { local, buckets }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local.id
    }

    /// Adds a node. `contacted` records that it just talked to us, which
    /// refreshes it and clears any invalid mark.
    pub fn insert_node(&self, node: Node, contacted: bool) {
        if node.id == self.local.id {
            return;
        }
        let idx = self.local.id.bucket_index(&node.id);
        self.buckets[idx].write().insert(node, contacted);
    }

    pub fn invalidate_node(&self, id: &NodeId) {
        let idx = self.local.id.bucket_index(id);
        self.buckets[idx].write().invalidate(id);
    }

    pub fn find_node(&self, id: &NodeId) -> Option<Node> {
        let idx = self.local.id.bucket_index(id);
        let bucket = self.buckets[idx].read();
        bucket.nodes.iter().find(|n| &n.id == id).cloned()
    }

    /// Up to `count` nodes ordered nearest-first to `target`, invalid nodes
    /// last.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut nodes = self.all_nodes();
        sort_by_distance(target, &mut nodes);
        nodes.truncate(count);
        nodes
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        let mut nodes = Vec::new();
        for bucket in &self.buckets {
            nodes.extend(bucket.read().nodes.iter().cloned());
        }
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.read().nodes.len()).sum()
    }
}
