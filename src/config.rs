//! Protocol constants and tunable parameters.
//!
//! Fixed protocol values live here as constants. Everything a deployment may
//! want to tune is collected in [`DhtConfig`], which is handed to each
//! component when it is constructed.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

// ============================================================================
// KRPC protocol
// ============================================================================

/// Number of distinct single-byte transaction ids per connection
pub const TRANSACTION_ID_SPACE: usize = 256;

/// Error string sent when a query names a method we do not serve
pub const ERROR_METHOD_UNKNOWN: &str = "Method Unknown";

/// Prefix of the error string for handler protocol faults
pub const ERROR_PROTOCOL_PREFIX: &str = "Protocol Error";

/// Prefix of the error string for handler server faults
pub const ERROR_SERVER_PREFIX: &str = "Server Error";

/// Largest datagram we expect to receive
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Distinct values kept per key in the local store
pub const MAX_VALUES_PER_KEY: usize = 100;

// ============================================================================
// Node encoding
// ============================================================================

/// Node id length in bytes (SHA-1 sized keyspace)
pub const NODE_ID_LEN: usize = 20;

/// Compact node info: 20 byte id, 4 byte IPv4 address, 2 byte port
pub const COMPACT_NODE_LEN: usize = 26;

// ============================================================================
// Defaults
// ============================================================================

/// Bucket size and per-round fan-out
pub const DEFAULT_K: usize = 8;

/// Maximum outstanding RPCs per action
pub const DEFAULT_CONCURRENT_REQS: usize = 8;

/// Number of peers a value is stored on
pub const DEFAULT_STORE_REDUNDANCY: usize = 3;

/// Time to wait for a reply before a transaction fails
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(20);

/// Idle time after which a cached connection is dropped
pub const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(40);

/// Age after which a stored value is purged
pub const DEFAULT_KEY_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Period of the stored value sweep
pub const DEFAULT_EXPIRE_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before the first stored value sweep
pub const DEFAULT_EXPIRE_INITIAL_DELAY: Duration = Duration::from_secs(15);

/// Runtime configuration for a DHT node.
///
/// The defaults follow the classic mainline tuning; every field can be
/// overridden before the node is bound.
///
/// ```
/// use rdht::DhtConfig;
/// use std::net::{IpAddr, Ipv4Addr};
/// use std::time::Duration;
///
/// let config = DhtConfig {
///     rpc_timeout: Duration::from_secs(5),
///     ..DhtConfig::default()
/// };
/// assert_eq!(config.k, 8);
/// ```
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub bind_ip: IpAddr,
    /// UDP port to bind; 0 picks an ephemeral port.
    pub port: u16,
    pub k: usize,
    pub concurrent_reqs: usize,
    pub store_redundancy: usize,
    pub rpc_timeout: Duration,
    pub connection_ttl: Duration,
    pub key_max_age: Duration,
    pub expire_interval: Duration,
    pub expire_initial_delay: Duration,
    /// Outgoing bytes per second; 0 disables rate limiting.
    pub max_upload_rate: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            k: DEFAULT_K,
            concurrent_reqs: DEFAULT_CONCURRENT_REQS,
            store_redundancy: DEFAULT_STORE_REDUNDANCY,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            connection_ttl: DEFAULT_CONNECTION_TTL,
            key_max_age: DEFAULT_KEY_MAX_AGE,
            expire_interval: DEFAULT_EXPIRE_INTERVAL,
            expire_initial_delay: DEFAULT_EXPIRE_INITIAL_DELAY,
            max_upload_rate: 0,
        }
    }
}
