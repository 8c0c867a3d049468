use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::error::RpcError;
use super::handler::{Registry, Reply};
use super::message::{KrpcMessage, MessageKind};
use super::ratelimit::RateLimitedSender;
use crate::bencode::Dict;
use crate::config::TRANSACTION_ID_SPACE;

/// A request waiting for its reply, and the timer that will fail it.
struct Pending {
    reply: oneshot::Sender<Result<Dict, RpcError>>,
    timer: Option<AbortHandle>,
}

impl Pending {
    /// Delivers the outcome and stops the timeout task.
    fn settle(self, result: Result<Dict, RpcError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let _ = self.reply.send(result);
    }
}

/// In-flight requests keyed by their one-byte transaction id.
#[derive(Default)]
struct Transactions {
    next_id: u8,
    pending: HashMap<u8, Pending>,
}

impl Transactions {
    /// Claims the next free id in cyclic order.
    fn allocate(&mut self, reply: oneshot::Sender<Result<Dict, RpcError>>) -> Option<u8> {
        for _ in 0..TRANSACTION_ID_SPACE {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                self.pending.insert(id, Pending { reply, timer: None });
                return Some(id);
            }
        }
        None
    }

    fn take(&mut self, id: u8) -> Option<Pending> {
        self.pending.remove(&id)
    }
}

/// KRPC state for one remote address.
///
/// Outgoing requests get a transaction id and a timeout; incoming datagrams
/// either resolve one of those transactions or are served by the
/// [`Registry`].
pub struct Connection {
    addr: SocketAddr,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    sender: Arc<RateLimitedSender>,
    rpc_timeout: Duration,
    transactions: Arc<Mutex<Transactions>>,
}

impl Connection {
    pub fn new(
        addr: SocketAddr,
        local_addr: SocketAddr,
        registry: Arc<Registry>,
        sender: Arc<RateLimitedSender>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            local_addr,
            registry,
            sender,
            rpc_timeout,
            transactions: Arc::new(Mutex::new(Transactions::default())),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn in_flight(&self) -> usize {
        self.transactions.lock().pending.len()
    }

    /// Sends `method` with `args` and returns a future for the reply.
    ///
    /// The datagram is written from a spawned task, never inline, so this
    /// must be called from within a tokio runtime. Fails without sending
    /// when the peer is ourselves or all transaction ids are taken.
    pub fn send_request(
        &self,
        method: &str,
        args: Dict,
    ) -> Result<impl Future<Output = Result<Dict, RpcError>> + Send + 'static, RpcError> {
        if self.addr == self.local_addr {
            return Err(RpcError::SelfNode);
        }

        let (tx, rx) = oneshot::channel();
        let id = self
            .transactions
            .lock()
            .allocate(tx)
            .ok_or(RpcError::TransactionsExhausted)?;
        let data = Bytes::from(KrpcMessage::query(id, method, args).encode());
        trace!("{} -> {} tid {}", method, self.addr, id);

        let transactions = self.transactions.clone();
        let timeout = self.rpc_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = transactions.lock().take(id);
            if let Some(pending) = expired {
                let _ = pending.reply.send(Err(RpcError::Timeout));
            }
        });
        if let Some(pending) = self.transactions.lock().pending.get_mut(&id) {
            pending.timer = Some(timer.abort_handle());
        }

        let transactions = self.transactions.clone();
        let sender = self.sender.clone();
        let addr = self.addr;
        tokio::spawn(async move {
            if let Err(e) = sender.send_to(data, addr).await {
                let failed = transactions.lock().take(id);
                if let Some(pending) = failed {
                    pending.settle(Err(RpcError::Socket(e.to_string())));
                }
            }
        });

        Ok(async move { rx.await.unwrap_or(Err(RpcError::Timeout)) })
    }

    /// Handles one datagram received from this connection's peer.
    ///
    /// Undecodable input is dropped without a reply.
    pub fn on_datagram(&self, data: &[u8]) {
        let msg = match KrpcMessage::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping datagram from {}: {}", self.addr, e);
                return;
            }
        };

        match msg.kind {
            MessageKind::Query { ref method, ref args } => {
                let reply = self.registry.dispatch(method, args, self.addr);
                self.reply(msg.transaction_id.clone(), reply);
            }
            MessageKind::Response(ref payload) => {
                let payload = payload.clone();
                self.resolve(&msg, Ok(payload));
            }
            MessageKind::Error(ref message) => {
                let message = message.clone();
                self.resolve(&msg, Err(RpcError::Remote(message)));
            }
            MessageKind::Unknown(ref msg_type) => {
                warn!(
                    "unknown message type {:?} from {}",
                    String::from_utf8_lossy(msg_type),
                    self.addr
                );
                self.resolve(&msg, Err(RpcError::UnknownMessageType));
            }
        }
    }

    fn reply(&self, transaction_id: Bytes, reply: Reply) {
        let msg = match reply {
            Reply::Response(payload) => KrpcMessage::response(transaction_id, payload),
            Reply::Error(message) => KrpcMessage::error(transaction_id, message),
            Reply::Silent => return,
        };
        self.sender.enqueue(Bytes::from(msg.encode()), self.addr);
    }

    fn resolve(&self, msg: &KrpcMessage, result: Result<Dict, RpcError>) {
        let pending = msg
            .short_transaction_id()
            .and_then(|id| self.transactions.lock().take(id));

        match pending {
            Some(pending) => pending.settle(result),
            None => trace!(
                "no transaction {:?} for reply from {}",
                msg.transaction_id,
                self.addr
            ),
        }
    }
}

#[cfg(test)]
impl Connection {
    /// Spawned tasks still holding on to this connection's transactions.
    pub(crate) fn background_tasks(&self) -> usize {
        Arc::strong_count(&self.transactions) - 1
    }
}
