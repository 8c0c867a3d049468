//! rdht - A Kademlia DHT over KRPC
//!
//! This library implements a Kademlia distributed hash table speaking
//! bencoded KRPC over UDP, in the style of the BitTorrent mainline DHT.
//!
//! # Modules
//!
//! - [`bencode`] - Bencode encoding/decoding
//! - [`krpc`] - Transactions, timeouts, rate limiting and the connection broker
//! - [`dht`] - Node ids, routing table, lookup actions and the DHT server
//! - [`config`] - Protocol constants and [`DhtConfig`]

pub mod bencode;
pub mod config;
pub mod dht;
pub mod krpc;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::DhtConfig;
pub use dht::{
    DhtError, DhtRpc, DhtServer, FindNode, GetValue, KeyExpirer, Node, NodeId, RoutingTable,
    StoreValue, ValueStore,
};
pub use krpc::{Broker, Connection, HandlerError, Registry, RpcError};
