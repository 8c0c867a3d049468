//! Kademlia distributed hash table.
//!
//! Nodes and keys share a 160-bit id space and closeness is XOR distance.
//! Lookups are iterative: an action keeps a bounded number of queries in
//! flight towards the closest nodes it has heard of, learns closer nodes
//! from the replies and stops once nobody new is left to ask.
//!
//! - [`FindNode`] locates the K nodes closest to an id.
//! - [`GetValue`] streams the values stored under a key.
//! - [`StoreValue`] pushes a value to the nodes closest to its key.
//! - [`KeyExpirer`] ages out values this node stores for others.
//!
//! [`DhtServer`] ties these to a KRPC [`Broker`](crate::krpc::Broker) on a
//! UDP socket.

mod action;
mod client;
mod error;
mod expirer;
mod find_node;
mod get_value;
mod node;
mod routing;
mod server;
mod store;
mod store_value;

pub use action::{DhtRpc, NodesReply, RpcFuture, ValueReply};
pub use client::KrpcClient;
pub use error::DhtError;
pub use expirer::KeyExpirer;
pub use find_node::FindNode;
pub use get_value::GetValue;
pub use node::{compare_by_distance, pack_nodes, sort_by_distance, unpack_nodes, Node, NodeId};
pub use routing::RoutingTable;
pub use server::DhtServer;
pub use store::ValueStore;
pub use store_value::StoreValue;
