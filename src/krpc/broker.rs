use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::cache::ExpiringCache;
use super::connection::Connection;
use super::error::RpcError;
use super::handler::Registry;
use super::ratelimit::RateLimitedSender;
use crate::config::{DhtConfig, MAX_DATAGRAM_SIZE};

/// Owns the per-peer [`Connection`]s of one bound socket.
///
/// Connections are created on first use and dropped after sitting idle for
/// the configured TTL. Inbound datagrams are routed to the connection of
/// their source address.
pub struct Broker {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    sender: Arc<RateLimitedSender>,
    rpc_timeout: Duration,
    connection_ttl: Duration,
    connections: Mutex<ExpiringCache<SocketAddr, Arc<Connection>>>,
}

impl Broker {
    pub fn new(
        local_addr: SocketAddr,
        registry: Arc<Registry>,
        sender: Arc<RateLimitedSender>,
        config: &DhtConfig,
    ) -> Self {
        Self {
            local_addr,
            registry,
            sender,
            rpc_timeout: config.rpc_timeout,
            connection_ttl: config.connection_ttl,
            connections: Mutex::new(ExpiringCache::new()),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Returns the cached connection for `addr`, creating it if needed.
    pub fn connection_for(&self, addr: SocketAddr) -> Result<Arc<Connection>, RpcError> {
        if addr == self.local_addr {
            return Err(RpcError::SelfNode);
        }

        let mut connections = self.connections.lock();
        let conn = connections.get_or_insert_with(addr, Instant::now(), || {
            Arc::new(Connection::new(
                addr,
                self.local_addr,
                self.registry.clone(),
                self.sender.clone(),
                self.rpc_timeout,
            ))
        });
        Ok(conn.clone())
    }

    pub fn on_datagram(&self, addr: SocketAddr, data: &[u8]) {
        match self.connection_for(addr) {
            Ok(conn) => conn.on_datagram(data),
            Err(e) => debug!("dropping {} byte datagram from {}: {}", data.len(), addr, e),
        }
    }

    /// Drops connections idle for longer than the TTL.
    pub fn expire_connections(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.connection_ttl) else {
            return 0;
        };
        let evicted = self.connections.lock().expire(cutoff);
        if evicted > 0 {
            trace!("evicted {} idle connections", evicted);
        }
        evicted
    }

    /// Runs [`expire_connections`](Self::expire_connections) every TTL
    /// until the broker is dropped.
    pub fn spawn_expiry(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::downgrade(self);
        let period = self.connection_ttl;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match broker.upgrade() {
                    Some(broker) => {
                        broker.expire_connections();
                    }
                    None => break,
                }
            }
        })
    }

    /// Receive loop: feeds every datagram on `socket` to its connection.
    pub async fn serve(&self, socket: &UdpSocket) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, addr) = socket.recv_from(&mut buf).await?;
            self.on_datagram(addr, &buf[..n]);
        }
    }
}
