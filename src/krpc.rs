//! KRPC transport: bencoded request/response over datagrams.
//!
//! A [`Broker`] owns one socket's worth of per-peer [`Connection`]s. Each
//! connection assigns one-byte transaction ids to outgoing queries, resolves
//! them when a response or error arrives, and fails them on timeout. Inbound
//! queries are answered by looking the method up in a [`Registry`].
//!
//! # Envelopes
//!
//! | Kind | Shape |
//! |------|-------|
//! | Query | `{t: tid, y: "q", q: method, a: args}` |
//! | Response | `{t: tid, y: "r", r: result}` |
//! | Error | `{t: tid, y: "e", e: message}` |
//!
//! # Examples
//!
//! ```no_run
//! use rdht::bencode::Dict;
//! use rdht::krpc::{Broker, HandlerResult, Registry, RateLimitedSender};
//! use rdht::DhtConfig;
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use tokio::net::UdpSocket;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
//! let sender = RateLimitedSender::new(socket.clone(), 0);
//! sender.start();
//!
//! let mut registry = Registry::new();
//! registry.register("echo", |args: &Dict, _from: SocketAddr| -> HandlerResult {
//!     Ok(args.clone())
//! })?;
//!
//! let broker = Arc::new(Broker::new(
//!     socket.local_addr()?,
//!     Arc::new(registry),
//!     sender,
//!     &DhtConfig::default(),
//! ));
//!
//! let conn = broker.connection_for("127.0.0.1:6881".parse()?)?;
//! let reply = conn.send_request("echo", Dict::new())?;
//! tokio::spawn(async move { broker.serve(&socket).await });
//! let payload = reply.await?;
//! # Ok(())
//! # }
//! ```

mod broker;
mod cache;
mod connection;
mod error;
mod handler;
mod message;
mod ratelimit;

pub use broker::Broker;
pub use cache::ExpiringCache;
pub use connection::Connection;
pub use error::{HandlerError, RpcError};
pub use handler::{HandlerResult, Registry, Reply, RpcHandler};
pub use message::{KrpcMessage, MessageKind};
pub use ratelimit::{DatagramSocket, RateLimitedSender, TokenBucket};

#[cfg(test)]
mod tests;
