use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;

use super::action::{DhtRpc, NodesReply, RpcFuture, ValueReply};
use super::node::{unpack_nodes, Node, NodeId};
use super::routing::RoutingTable;
use crate::bencode::{Dict, Value};
use crate::krpc::{Broker, RpcError};

/// Builds an argument dictionary from `(key, value)` pairs.
pub(crate) fn dict<const N: usize>(pairs: [(&'static str, Value); N]) -> Dict {
    pairs
        .into_iter()
        .map(|(k, v)| (Bytes::from_static(k.as_bytes()), v))
        .collect()
}

fn invalid(msg: &str) -> RpcError {
    RpcError::InvalidResponse(msg.to_string())
}

/// Reads the responder's id and pairs it with the address we sent to.
fn responder(reply: &Dict, addr: SocketAddr) -> Result<Node, RpcError> {
    let id = reply
        .get(b"id".as_slice())
        .and_then(Value::as_bytes)
        .ok_or_else(|| invalid("missing id"))?;
    let id = NodeId::from_bytes(id).map_err(|_| invalid("bad id length"))?;
    Ok(Node::new(id, addr))
}

fn nodes_of(reply: &Dict) -> Vec<Node> {
    reply
        .get(b"nodes".as_slice())
        .and_then(Value::as_bytes)
        .map(|b| unpack_nodes(b))
        .unwrap_or_default()
}

fn values_of(reply: &Dict) -> Option<Vec<Bytes>> {
    let list = reply.get(b"values".as_slice())?.as_list()?;
    Some(list.iter().filter_map(Value::as_bytes).cloned().collect())
}

/// [`DhtRpc`] over the KRPC broker.
///
/// Every well-formed reply refreshes its sender in the routing table;
/// timeouts mark the peer as failed.
pub struct KrpcClient {
    broker: Arc<Broker>,
    table: Arc<RoutingTable>,
}

impl KrpcClient {
    pub fn new(broker: Arc<Broker>, table: Arc<RoutingTable>) -> Self {
        Self { broker, table }
    }

    fn local_id(&self) -> Value {
        Value::bytes(self.table.local_id().as_bytes())
    }

    /// Sends `method` to `addr` and parses the reply with `parse`. `peer` is
    /// the id we expect there, if known; it is marked failed on timeout.
    fn call<T, F>(
        &self,
        addr: SocketAddr,
        peer: Option<NodeId>,
        method: &str,
        args: Dict,
        parse: F,
    ) -> Result<RpcFuture<T>, RpcError>
    where
        T: Send + 'static,
        F: FnOnce(Node, &Dict) -> Result<T, RpcError> + Send + 'static,
    {
        let request = self.broker.connection_for(addr)?.send_request(method, args)?;
        let table = self.table.clone();

        Ok(async move {
            match request.await {
                Ok(reply) => responder(&reply, addr).and_then(|sender| {
                    table.insert_node(sender.clone(), true);
                    parse(sender, &reply)
                }),
                Err(RpcError::Timeout) => {
                    if let Some(id) = peer {
                        table.invalidate_node(&id);
                    }
                    Err(RpcError::Timeout)
                }
                Err(err) => Err(err),
            }
        }
        .boxed())
    }

    /// Pings `addr` and resolves to the node that answered.
    pub fn ping(&self, addr: SocketAddr) -> Result<RpcFuture<Node>, RpcError> {
        let args = dict([("id", self.local_id())]);
        self.call(addr, None, "ping", args, |sender, _| Ok(sender))
    }
}

impl DhtRpc for KrpcClient {
    fn find_node(&self, node: &Node, target: NodeId) -> Result<RpcFuture<NodesReply>, RpcError> {
        let args = dict([
            ("id", self.local_id()),
            ("target", Value::bytes(target.as_bytes())),
        ]);
        self.call(node.addr, Some(node.id), "find_node", args, |sender, reply| {
            Ok(NodesReply {
                sender,
                nodes: nodes_of(reply),
            })
        })
    }

    fn find_value(
        &self,
        method: &str,
        node: &Node,
        key: NodeId,
    ) -> Result<RpcFuture<ValueReply>, RpcError> {
        let args = dict([
            ("id", self.local_id()),
            ("key", Value::bytes(key.as_bytes())),
        ]);
        self.call(node.addr, Some(node.id), method, args, |sender, reply| {
            Ok(match values_of(reply) {
                Some(values) => ValueReply::Values { sender, values },
                None => ValueReply::Nodes(NodesReply {
                    sender,
                    nodes: nodes_of(reply),
                }),
            })
        })
    }

    fn store_value(
        &self,
        method: &str,
        node: &Node,
        key: NodeId,
        value: Bytes,
    ) -> Result<RpcFuture<()>, RpcError> {
        let args = dict([
            ("id", self.local_id()),
            ("key", Value::bytes(key.as_bytes())),
            ("value", Value::Bytes(value)),
        ]);
        self.call(node.addr, Some(node.id), method, args, |_, _| Ok(()))
    }
}
