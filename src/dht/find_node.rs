use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, trace};

use super::action::{tag, ActionBase, DhtRpc, InFlight, NodesReply};
use super::node::{Node, NodeId};
use super::routing::RoutingTable;
use crate::config::DhtConfig;
use crate::krpc::RpcError;

/// Iterative lookup of the K nodes closest to a target id.
///
/// The lookup keeps at most `concurrent_reqs` queries in flight, always
/// asking the closest not-yet-queried nodes it knows of, and stops once a
/// round brings nothing new to ask.
pub struct FindNode {
    base: ActionBase,
    rpc: Arc<dyn DhtRpc>,
    in_flight: InFlight<NodesReply>,
    result: Option<Vec<Node>>,
}

impl FindNode {
    pub fn new(
        table: Arc<RoutingTable>,
        rpc: Arc<dyn DhtRpc>,
        target: NodeId,
        config: &DhtConfig,
    ) -> Self {
        Self {
            base: ActionBase::new(table, target, config),
            rpc,
            in_flight: InFlight::new(),
            result: None,
        }
    }

    /// Runs the lookup from `nodes` and resolves to the closest nodes found,
    /// or to just the target when a node with exactly that id turns up.
    pub async fn go_with_nodes(mut self, nodes: Vec<Node>) -> Vec<Node> {
        self.base.seed(nodes);
        self.schedule();

        while self.result.is_none() {
            match self.in_flight.next().await {
                Some((_, Ok(reply))) => self.handle_got_nodes(reply),
                Some((node, Err(err))) => self.msg_failed(&node, &err),
                None => {
                    // Every query came back but a duplicate sender kept
                    // the count above zero.
                    let best = self.base.top_k();
                    self.finish(best);
                }
            }
        }

        let result = self.result.take().unwrap_or_default();
        debug!("find_node {} finished with {} nodes", self.base.target, result.len());
        result
    }

    pub(crate) fn handle_got_nodes(&mut self, reply: NodesReply) {
        if !self.base.accept_reply(&reply.sender.id) {
            trace!("ignoring late find_node reply from {}", reply.sender.id);
            return;
        }
        self.base.absorb(reply.nodes);
        self.schedule();
    }

    pub(crate) fn msg_failed(&mut self, node: &Node, err: &RpcError) {
        debug!("find_node query to {} failed: {}", node.addr, err);
        self.base.outstanding = self.base.outstanding.saturating_sub(1);
        self.base.mark_failed(&node.id);
        self.schedule();
    }

    pub(crate) fn schedule(&mut self) {
        if self.base.finished {
            return;
        }

        let closest = self.base.top_k();
        if let Some(hit) = closest.iter().find(|n| n.id == self.base.target) {
            let hit = hit.clone();
            self.finish(vec![hit]);
            return;
        }

        for node in &closest {
            if self.base.outstanding >= self.base.concurrent_reqs {
                break;
            }
            if !self.base.should_query(node) {
                continue;
            }
            match self.rpc.find_node(node, self.base.target) {
                Ok(fut) => {
                    self.base.outstanding += 1;
                    self.in_flight.push(tag(node.clone(), fut));
                }
                Err(RpcError::SelfNode) => {}
                Err(err) => debug!("find_node to {} not sent: {}", node.addr, err),
            }
        }

        if self.base.outstanding == 0 {
            self.finish(closest);
        }
    }

    fn finish(&mut self, nodes: Vec<Node>) {
        if self.base.finished {
            return;
        }
        self.base.finished = true;
        self.result = Some(nodes);
    }
}

#[cfg(test)]
impl FindNode {
    pub(crate) fn outstanding(&self) -> usize {
        self.base.outstanding
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.base.finished
    }

    pub(crate) fn result(&self) -> Option<&[Node]> {
        self.result.as_deref()
    }

    pub(crate) fn seed(&mut self, nodes: Vec<Node>) {
        self.base.seed(nodes);
    }
}
