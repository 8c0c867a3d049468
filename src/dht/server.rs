use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::client::{dict, KrpcClient};
use super::error::DhtError;
use super::expirer::KeyExpirer;
use super::find_node::FindNode;
use super::get_value::GetValue;
use super::node::{pack_nodes, Node, NodeId};
use super::routing::RoutingTable;
use super::store::ValueStore;
use super::store_value::StoreValue;
use crate::bencode::{Dict, Value};
use crate::config::{DhtConfig, MAX_VALUES_PER_KEY};
use crate::krpc::{Broker, HandlerError, HandlerResult, RateLimitedSender, Registry};

/// Answers inbound queries from the local routing table and value store.
pub(super) struct QueryHandlers {
    pub(super) table: Arc<RoutingTable>,
    pub(super) store: Arc<ValueStore>,
    pub(super) k: usize,
}

fn arg<'a>(args: &'a Dict, name: &str) -> Result<&'a Bytes, HandlerError> {
    args.get(name.as_bytes())
        .and_then(Value::as_bytes)
        .ok_or_else(|| HandlerError::Protocol(format!("missing argument {}", name)))
}

fn arg_id(args: &Dict, name: &str) -> Result<NodeId, HandlerError> {
    NodeId::from_bytes(arg(args, name)?)
        .map_err(|_| HandlerError::Protocol(format!("invalid argument {}", name)))
}

impl QueryHandlers {
    /// Every query refreshes its sender, which just proved to be alive.
    fn note_sender(&self, args: &Dict, from: SocketAddr) -> Result<(), HandlerError> {
        let id = arg_id(args, "id")?;
        self.table.insert_node(Node::new(id, from), true);
        Ok(())
    }

    fn own_id(&self) -> Value {
        Value::bytes(self.table.local_id().as_bytes())
    }

    fn closest(&self, target: &NodeId) -> Value {
        Value::Bytes(pack_nodes(&self.table.find_closest(target, self.k)))
    }

    fn ping(&self, args: &Dict, from: SocketAddr) -> HandlerResult {
        self.note_sender(args, from)?;
        Ok(dict([("id", self.own_id())]))
    }

    fn find_node(&self, args: &Dict, from: SocketAddr) -> HandlerResult {
        self.note_sender(args, from)?;
        let target = arg_id(args, "target")?;
        Ok(dict([("id", self.own_id()), ("nodes", self.closest(&target))]))
    }

    fn find_value(&self, args: &Dict, from: SocketAddr) -> HandlerResult {
        self.note_sender(args, from)?;
        let key = arg_id(args, "key")?;
        let values = self.store.get(&key);
        if values.is_empty() {
            return Ok(dict([("id", self.own_id()), ("nodes", self.closest(&key))]));
        }
        let values = values.into_iter().map(Value::Bytes).collect::<Vec<_>>();
        Ok(dict([("id", self.own_id()), ("values", Value::List(values))]))
    }

    fn store_value(&self, args: &Dict, from: SocketAddr) -> HandlerResult {
        self.note_sender(args, from)?;
        let key = arg_id(args, "key")?;
        let value = arg(args, "value")?.clone();
        debug!("storing {} byte value under {} for {}", value.len(), key, from);
        self.store.put(key, value);
        Ok(dict([("id", self.own_id())]))
    }
}

pub(super) fn registry(handlers: Arc<QueryHandlers>) -> Result<Registry, DhtError> {
    let mut registry = Registry::new();

    let h = handlers.clone();
    registry.register("ping", move |a: &Dict, from: SocketAddr| -> HandlerResult {
        h.ping(a, from)
    })?;
    let h = handlers.clone();
    registry.register("find_node", move |a: &Dict, from: SocketAddr| -> HandlerResult {
        h.find_node(a, from)
    })?;
    let h = handlers.clone();
    registry.register("find_value", move |a: &Dict, from: SocketAddr| -> HandlerResult {
        h.find_value(a, from)
    })?;
    let h = handlers;
    registry.register("store_value", move |a: &Dict, from: SocketAddr| -> HandlerResult {
        h.store_value(a, from)
    })?;

    Ok(registry)
}

/// A Kademlia DHT node.
///
/// `DhtServer` answers `ping`, `find_node`, `find_value` and `store_value`
/// queries from other nodes and runs iterative lookups and stores of its
/// own. Outgoing lookups start from the closest nodes in the local routing
/// table; a fresh node learns its first peers by [`ping`](Self::ping)ing
/// them.
///
/// # Examples
///
/// ```no_run
/// use rdht::{DhtConfig, DhtServer, NodeId};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = Arc::new(DhtServer::bind(DhtConfig { port: 4000, ..Default::default() }).await?);
///
/// let runner = dht.clone();
/// tokio::spawn(async move { runner.run().await });
///
/// dht.ping("203.0.113.7:4000".parse()?).await?;
///
/// let key = NodeId::from_key(b"greeting");
/// dht.store_value(key, "hello".into()).await;
/// let values = dht.get_values(key).await;
/// # Ok(())
/// # }
/// ```
pub struct DhtServer {
    socket: Arc<UdpSocket>,
    config: DhtConfig,
    table: Arc<RoutingTable>,
    store: Arc<ValueStore>,
    broker: Arc<Broker>,
    client: Arc<KrpcClient>,
    drain: JoinHandle<()>,
}

impl DhtServer {
    pub async fn bind(config: DhtConfig) -> Result<Self, DhtError> {
        let socket = Arc::new(UdpSocket::bind(SocketAddr::new(config.bind_ip, config.port)).await?);
        let local_addr = socket.local_addr()?;
        let local_id = NodeId::generate();

        let table = Arc::new(RoutingTable::new(Node::new(local_id, local_addr), config.k));
        let store = Arc::new(ValueStore::new(MAX_VALUES_PER_KEY));
        let handlers = Arc::new(QueryHandlers {
            table: table.clone(),
            store: store.clone(),
            k: config.k,
        });

        let sender = RateLimitedSender::new(socket.clone(), config.max_upload_rate);
        let drain = sender.start();
        let broker = Arc::new(Broker::new(
            local_addr,
            Arc::new(registry(handlers)?),
            sender,
            &config,
        ));
        let client = Arc::new(KrpcClient::new(broker.clone(), table.clone()));

        info!("DHT node {} bound to {}", local_id, local_addr);

        Ok(Self {
            socket,
            config,
            table,
            store,
            broker,
            client,
            drain,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.broker.local_addr()
    }

    pub fn local_id(&self) -> &NodeId {
        self.table.local_id()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn value_store(&self) -> &ValueStore {
        &self.store
    }

    /// Serves the socket until it fails. Connection expiry and the stored
    /// value sweep run alongside and stop with it.
    pub async fn run(&self) -> Result<(), DhtError> {
        let expiry = self.broker.spawn_expiry();
        let expirer = KeyExpirer::new(self.store.clone(), &self.config).spawn();

        let result = self.broker.serve(&self.socket).await;

        expiry.abort();
        expirer.abort();
        result.map_err(DhtError::from)
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<Node, DhtError> {
        Ok(self.client.ping(addr)?.await?)
    }

    /// The closest nodes to `target` the network knows of.
    pub async fn find_node(&self, target: NodeId) -> Vec<Node> {
        let seed = self.table.find_closest(&target, self.config.k);
        FindNode::new(self.table.clone(), self.client.clone(), target, &self.config)
            .go_with_nodes(seed)
            .await
    }

    /// Starts a value search and returns its delivery channel.
    ///
    /// Values held locally are delivered first and are not repeated by the
    /// network search.
    pub fn get_value(&self, key: NodeId) -> mpsc::UnboundedReceiver<Vec<Bytes>> {
        let seed = self.table.find_closest(&key, self.config.k);
        let (action, rx) = GetValue::new(self.table.clone(), self.client.clone(), key, &self.config);

        let local = self.store.get(&key);
        let (tx, merged) = mpsc::unbounded_channel();
        if !local.is_empty() {
            let _ = tx.send(local.clone());
        }
        tokio::spawn(forward(rx, tx, !local.is_empty()));
        tokio::spawn(action.go_with_nodes(seed, local));
        merged
    }

    /// Every distinct value found for `key`, local ones included.
    pub async fn get_values(&self, key: NodeId) -> Vec<Bytes> {
        let mut rx = self.get_value(key);
        let mut values = Vec::new();
        while let Some(batch) = rx.recv().await {
            values.extend(batch);
        }
        values
    }

    /// Finds the nodes closest to `key` and stores `value` on them.
    /// Resolves to the nodes that accepted it.
    pub async fn store_value(&self, key: NodeId, value: Bytes) -> Vec<Node> {
        let closest = self.find_node(key).await;
        StoreValue::new(self.table.clone(), self.client.clone(), key, value, &self.config)
            .go_with_nodes(closest)
            .await
    }
}

/// Relays the network search to the caller. When local values were
/// already delivered, the empty "not found" batch is swallowed.
async fn forward(
    mut rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
    tx: mpsc::UnboundedSender<Vec<Bytes>>,
    delivered: bool,
) {
    while let Some(batch) = rx.recv().await {
        if batch.is_empty() && delivered {
            continue;
        }
        if tx.send(batch).is_err() {
            break;
        }
    }
}

impl Drop for DhtServer {
    fn drop(&mut self) {
        self.drain.abort();
    }
}
