use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, trace};

use super::action::{tag, ActionBase, DhtRpc, InFlight};
use super::node::{sort_by_distance, Node, NodeId};
use super::routing::RoutingTable;
use crate::config::DhtConfig;
use crate::krpc::RpcError;

const DEFAULT_METHOD: &str = "store_value";

/// Pushes a value to the nodes closest to its key until `store_redundancy`
/// of them have accepted it or the candidates run out.
pub struct StoreValue {
    base: ActionBase,
    rpc: Arc<dyn DhtRpc>,
    method: String,
    value: Bytes,
    /// Farthest first, so `pop` yields the nearest remaining node.
    candidates: Vec<Node>,
    stored: Vec<Node>,
    in_flight: InFlight<()>,
    result: Option<Vec<Node>>,
}

impl StoreValue {
    pub fn new(
        table: Arc<RoutingTable>,
        rpc: Arc<dyn DhtRpc>,
        key: NodeId,
        value: Bytes,
        config: &DhtConfig,
    ) -> Self {
        Self {
            base: ActionBase::new(table, key, config),
            rpc,
            method: DEFAULT_METHOD.to_string(),
            value,
            candidates: Vec::new(),
            stored: Vec::new(),
            in_flight: InFlight::new(),
            result: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Stores on the nearest of `nodes` and resolves to the nodes that
    /// accepted the value. Never more than `store_redundancy` of them.
    pub async fn go_with_nodes(mut self, nodes: Vec<Node>) -> Vec<Node> {
        self.set_candidates(nodes);
        self.schedule();

        while self.result.is_none() {
            match self.in_flight.next().await {
                Some((node, Ok(()))) => self.stored_value(node),
                Some((node, Err(err))) => self.store_failed(&node, &err),
                None => self.finish(),
            }
        }

        let stored = self.result.take().unwrap_or_default();
        debug!("store_value {} finished on {} nodes", self.base.target, stored.len());
        stored
    }

    pub(crate) fn set_candidates(&mut self, mut nodes: Vec<Node>) {
        sort_by_distance(&self.base.target, &mut nodes);
        nodes.reverse();
        self.candidates = nodes;
    }

    pub(crate) fn stored_value(&mut self, node: Node) {
        self.base.outstanding = self.base.outstanding.saturating_sub(1);
        if self.base.finished {
            trace!("store ack from {} after finishing", node.addr);
            return;
        }
        self.stored.push(node);
        if self.stored.len() >= self.base.store_redundancy {
            self.finish();
        } else if self.stored.len() + self.base.outstanding < self.base.store_redundancy {
            self.schedule();
        }
    }

    pub(crate) fn store_failed(&mut self, node: &Node, err: &RpcError) {
        self.base.outstanding = self.base.outstanding.saturating_sub(1);
        debug!("store_value to {} failed: {}", node.addr, err);
        if err.is_protocol_error() {
            self.base.table.invalidate_node(&node.id);
        }
        if self.base.finished {
            return;
        }
        self.schedule();
    }

    pub(crate) fn schedule(&mut self) {
        if self.base.finished {
            return;
        }

        let mut slots = self
            .base
            .concurrent_reqs
            .saturating_sub(self.base.outstanding)
            .min(self.base.store_redundancy.saturating_sub(self.stored.len()));
        if slots == 0 {
            self.finish();
            return;
        }

        let local = *self.base.table.local_id();
        while slots > 0 {
            let Some(node) = self.candidates.pop() else {
                if self.base.outstanding == 0 {
                    self.finish();
                }
                return;
            };
            if node.id == local {
                continue;
            }
            match self
                .rpc
                .store_value(&self.method, &node, self.base.target, self.value.clone())
            {
                Ok(fut) => {
                    self.base.outstanding += 1;
                    self.in_flight.push(tag(node, fut));
                    slots -= 1;
                }
                Err(RpcError::SelfNode) => {}
                Err(err) if err.is_protocol_error() => {
                    self.base.table.invalidate_node(&node.id);
                }
                Err(err) => debug!("store_value to {} not sent: {}", node.addr, err),
            }
        }
    }

    fn finish(&mut self) {
        if self.base.finished {
            return;
        }
        self.base.finished = true;
        self.result = Some(std::mem::take(&mut self.stored));
    }
}

#[cfg(test)]
impl StoreValue {
    pub(crate) fn outstanding(&self) -> usize {
        self.base.outstanding
    }

    pub(crate) fn result(&self) -> Option<&[Node]> {
        self.result.as_deref()
    }
}
