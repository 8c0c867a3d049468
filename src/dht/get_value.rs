use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::action::{tag, ActionBase, DhtRpc, InFlight, ValueReply};
use super::node::{Node, NodeId};
use super::routing::RoutingTable;
use crate::config::DhtConfig;
use crate::krpc::RpcError;

const DEFAULT_METHOD: &str = "find_value";

/// Iterative search for the values stored under a key.
///
/// Values are streamed to the receiver returned by [`GetValue::new`] as
/// they arrive, one batch per reply carrying something new. If the search
/// ends without delivering anything, a single empty batch is sent. The
/// channel closes when the search is over.
pub struct GetValue {
    base: ActionBase,
    rpc: Arc<dyn DhtRpc>,
    method: String,
    in_flight: InFlight<ValueReply>,
    results: HashSet<Bytes>,
    delivered: bool,
    tx: mpsc::UnboundedSender<Vec<Bytes>>,
}

impl GetValue {
    pub fn new(
        table: Arc<RoutingTable>,
        rpc: Arc<dyn DhtRpc>,
        key: NodeId,
        config: &DhtConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<Bytes>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let action = Self {
            base: ActionBase::new(table, key, config),
            rpc,
            method: DEFAULT_METHOD.to_string(),
            in_flight: InFlight::new(),
            results: HashSet::new(),
            delivered: false,
            tx,
        };
        (action, rx)
    }

    /// Queries peers with `method` instead of `find_value`.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Runs the search. `known` holds values the caller already has; they
    /// are never delivered again.
    pub async fn go_with_nodes(mut self, nodes: Vec<Node>, known: Vec<Bytes>) {
        self.results.extend(known);
        self.base.seed(nodes);
        self.schedule();

        while !self.base.finished {
            match self.in_flight.next().await {
                Some((_, Ok(reply))) => self.handle_reply(reply),
                Some((node, Err(err))) => self.msg_failed(&node, &err),
                None => self.finish(),
            }
        }

        debug!("get_value {} finished, {} values known", self.base.target, self.results.len());
    }

    pub(crate) fn handle_reply(&mut self, reply: ValueReply) {
        let sender = match &reply {
            ValueReply::Nodes(r) => r.sender.id,
            ValueReply::Values { sender, .. } => sender.id,
        };
        if !self.base.accept_reply(&sender) {
            trace!("ignoring late find_value reply from {}", sender);
            return;
        }

        match reply {
            ValueReply::Nodes(r) => self.base.absorb(r.nodes),
            ValueReply::Values { values, .. } => {
                let fresh: Vec<Bytes> = values
                    .into_iter()
                    .filter(|v| self.results.insert(v.clone()))
                    .collect();
                if !fresh.is_empty() {
                    self.deliver(fresh);
                }
            }
        }
        self.schedule();
    }

    pub(crate) fn msg_failed(&mut self, node: &Node, err: &RpcError) {
        debug!("find_value query to {} failed: {}", node.addr, err);
        self.base.outstanding = self.base.outstanding.saturating_sub(1);
        self.base.mark_failed(&node.id);
        self.schedule();
    }

    pub(crate) fn schedule(&mut self) {
        if self.base.finished {
            return;
        }

        for node in self.base.top_k() {
            if self.base.outstanding >= self.base.concurrent_reqs {
                break;
            }
            if !self.base.should_query(&node) {
                continue;
            }
            match self.rpc.find_value(&self.method, &node, self.base.target) {
                Ok(fut) => {
                    self.base.outstanding += 1;
                    self.in_flight.push(tag(node, fut));
                }
                Err(RpcError::SelfNode) => {}
                Err(err) => debug!("find_value to {} not sent: {}", node.addr, err),
            }
        }

        if self.base.outstanding == 0 {
            self.finish();
        }
    }

    fn deliver(&mut self, values: Vec<Bytes>) {
        self.delivered = true;
        // A dropped receiver only means nobody is listening any more.
        let _ = self.tx.send(values);
    }

    fn finish(&mut self) {
        if self.base.finished {
            return;
        }
        self.base.finished = true;
        if !self.delivered {
            self.deliver(Vec::new());
        }
    }
}

#[cfg(test)]
impl GetValue {
    pub(crate) fn is_finished(&self) -> bool {
        self.base.finished
    }
}
