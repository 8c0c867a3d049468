use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;

use super::node::{sort_by_distance, Node, NodeId};
use super::routing::RoutingTable;
use crate::config::DhtConfig;
use crate::krpc::RpcError;

pub type RpcFuture<T> = BoxFuture<'static, Result<T, RpcError>>;

/// Outcome of one RPC, tagged with the node it was sent to.
pub(crate) type Completion<T> = BoxFuture<'static, (Node, Result<T, RpcError>)>;

/// A `find_node` style answer: who replied and which nodes it knows.
#[derive(Debug, Clone)]
pub struct NodesReply {
    pub sender: Node,
    pub nodes: Vec<Node>,
}

/// A `find_value` answer carries either closer nodes or the values.
#[derive(Debug, Clone)]
pub enum ValueReply {
    Nodes(NodesReply),
    Values { sender: Node, values: Vec<Bytes> },
}

/// Remote calls issued by lookup actions.
///
/// Each method returns `Err` synchronously when the request cannot be sent
/// at all (e.g. [`RpcError::SelfNode`]); such attempts are not counted as
/// outstanding.
pub trait DhtRpc: Send + Sync {
    fn find_node(&self, node: &Node, target: NodeId) -> Result<RpcFuture<NodesReply>, RpcError>;

    fn find_value(
        &self,
        method: &str,
        node: &Node,
        key: NodeId,
    ) -> Result<RpcFuture<ValueReply>, RpcError>;

    fn store_value(
        &self,
        method: &str,
        node: &Node,
        key: NodeId,
        value: Bytes,
    ) -> Result<RpcFuture<()>, RpcError>;
}

/// Bookkeeping shared by every iterative action.
pub(crate) struct ActionBase {
    pub table: Arc<RoutingTable>,
    pub target: NodeId,
    pub found: HashMap<NodeId, Node>,
    pub queried: HashSet<NodeId>,
    pub queried_addrs: HashSet<SocketAddr>,
    pub answered: HashSet<NodeId>,
    pub outstanding: usize,
    pub finished: bool,
    pub k: usize,
    pub concurrent_reqs: usize,
    pub store_redundancy: usize,
}

impl ActionBase {
    pub fn new(table: Arc<RoutingTable>, target: NodeId, config: &DhtConfig) -> Self {
        Self {
            table,
            target,
            found: HashMap::new(),
            queried: HashSet::new(),
            queried_addrs: HashSet::new(),
            answered: HashSet::new(),
            outstanding: 0,
            finished: false,
            k: config.k,
            concurrent_reqs: config.concurrent_reqs,
            store_redundancy: config.store_redundancy,
        }
    }

    /// The only gate against contacting a peer twice within one action:
    /// rejects ourselves and anything already queried by id or address.
    pub fn should_query(&mut self, node: &Node) -> bool {
        if node.id == *self.table.local_id() {
            return false;
        }
        if self.queried.contains(&node.id) || self.queried_addrs.contains(&node.addr) {
            return false;
        }
        self.queried.insert(node.id);
        self.queried_addrs.insert(node.addr);
        true
    }

    pub fn seed(&mut self, nodes: Vec<Node>) {
        let local = *self.table.local_id();
        for node in nodes.into_iter().filter(|n| n.id != local) {
            self.found.insert(node.id, node);
        }
    }

    /// Adds newly learned peers to `found` and, as uncontacted, to the
    /// routing table.
    pub fn absorb(&mut self, nodes: Vec<Node>) {
        let local = *self.table.local_id();
        for node in nodes {
            if node.id != local && !self.found.contains_key(&node.id) {
                self.table.insert_node(node.clone(), false);
                self.found.insert(node.id, node);
            }
        }
    }

    /// Records a reply from `sender`. Returns false for replies that arrive
    /// after finishing or that duplicate an earlier one.
    pub fn accept_reply(&mut self, sender: &NodeId) -> bool {
        if self.finished || self.answered.contains(sender) {
            return false;
        }
        self.outstanding = self.outstanding.saturating_sub(1);
        self.answered.insert(*sender);
        true
    }

    /// Marks our copy of a peer that did not answer, so it ranks after every
    /// responsive node.
    pub fn mark_failed(&mut self, id: &NodeId) {
        if let Some(node) = self.found.get_mut(id) {
            node.fail();
        }
    }

    pub fn sorted_found(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.found.values().cloned().collect();
        sort_by_distance(&self.target, &mut nodes);
        nodes
    }

    pub fn top_k(&self) -> Vec<Node> {
        let mut nodes = self.sorted_found();
        nodes.truncate(self.k);
        nodes
    }
}

/// Wraps an RPC future so its completion carries the queried node.
pub(crate) fn tag<T: Send + 'static>(node: Node, fut: RpcFuture<T>) -> Completion<T> {
    fut.map(move |result| (node, result)).boxed()
}

pub(crate) type InFlight<T> = FuturesUnordered<Completion<T>>;
