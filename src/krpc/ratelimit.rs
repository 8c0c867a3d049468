//! Outgoing datagram rate limiting.
//!
//! Every datagram sent by a broker's connections goes through one
//! [`RateLimitedSender`]. Sending never blocks the caller: datagrams are
//! queued per destination and a single drain task writes them to the socket,
//! pacing itself with a token bucket. Destinations are served round-robin so
//! a chatty peer cannot starve the others.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

/// The raw datagram send operation being wrapped.
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>>;
}

impl DatagramSocket for UdpSocket {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(UdpSocket::send_to(self, buf, target))
    }
}

/// Token bucket measured in bytes. The bucket holds two seconds worth of
/// tokens to allow bursts.
pub struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64, now: Instant) -> Self {
        let max_tokens = (bytes_per_sec * 2) as f64;
        Self {
            tokens: max_tokens,
            max_tokens,
            tokens_per_sec: bytes_per_sec as f64,
            last_update: now,
        }
    }

    /// Takes `bytes` from the bucket and returns how long the caller must
    /// wait before the send is within budget.
    pub fn reserve(&mut self, bytes: usize, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);

        let needed = bytes as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            Duration::ZERO
        } else {
            let wait = (needed - self.tokens) / self.tokens_per_sec;
            self.tokens = 0.0;
            Duration::from_secs_f64(wait)
        }
    }
}

struct Datagram {
    data: Bytes,
    done: Option<oneshot::Sender<io::Result<()>>>,
}

/// Per-destination FIFO queues served round-robin.
#[derive(Default)]
struct FairQueue {
    queues: HashMap<SocketAddr, VecDeque<Datagram>>,
    order: VecDeque<SocketAddr>,
}

impl FairQueue {
    fn push(&mut self, addr: SocketAddr, datagram: Datagram) {
        let queue = self.queues.entry(addr).or_default();
        if queue.is_empty() {
            self.order.push_back(addr);
        }
        queue.push_back(datagram);
    }

    fn pop(&mut self) -> Option<(SocketAddr, Datagram)> {
        let addr = self.order.pop_front()?;
        let queue = self.queues.get_mut(&addr)?;
        let datagram = queue.pop_front()?;

        if queue.is_empty() {
            self.queues.remove(&addr);
        } else {
            self.order.push_back(addr);
        }
        Some((addr, datagram))
    }

    fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

pub struct RateLimitedSender {
    socket: Arc<dyn DatagramSocket>,
    bucket: Mutex<Option<TokenBucket>>,
    queue: Mutex<FairQueue>,
    notify: Notify,
}

impl RateLimitedSender {
    /// A rate of 0 means unlimited.
    pub fn new(socket: Arc<dyn DatagramSocket>, bytes_per_sec: u64) -> Arc<Self> {
        let bucket = (bytes_per_sec > 0).then(|| TokenBucket::new(bytes_per_sec, Instant::now()));
        Arc::new(Self {
            socket,
            bucket: Mutex::new(bucket),
            queue: Mutex::new(FairQueue::default()),
            notify: Notify::new(),
        })
    }

    /// Queues a datagram without waiting for it to be written.
    pub fn enqueue(&self, data: Bytes, target: SocketAddr) {
        self.push(target, Datagram { data, done: None });
    }

    /// Queues a datagram and resolves once the socket accepted or rejected
    /// it.
    pub async fn send_to(&self, data: Bytes, target: SocketAddr) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.push(
            target,
            Datagram {
                data,
                done: Some(tx),
            },
        );
        rx.await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "sender stopped")))
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn push(&self, target: SocketAddr, datagram: Datagram) {
        self.queue.lock().push(target, datagram);
        self.notify.notify_one();
    }

    /// Starts the drain task. Sends queued before this call are kept.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let sender = self.clone();
        tokio::spawn(async move { sender.drain().await })
    }

    async fn drain(&self) {
        loop {
            let next = self.queue.lock().pop();
            let Some((target, datagram)) = next else {
                self.notify.notified().await;
                continue;
            };

            let wait = self
                .bucket
                .lock()
                .as_mut()
                .map(|b| b.reserve(datagram.data.len(), Instant::now()))
                .unwrap_or(Duration::ZERO);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            let result = self.socket.send_to(&datagram.data, target).await.map(|_| ());
            if let Err(e) = &result {
                warn!("failed to send {} bytes to {}: {}", datagram.data.len(), target, e);
            }
            if let Some(done) = datagram.done {
                let _ = done.send(result);
            }
        }
    }
}
