use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use crate::{cache::DEFAULT_CACHE_CAPACITY, validator::NAMESPACE};

pub const DEFAULT_USER_AGENT: &str = "FreedomNames/1.0.0";
pub const DEFAULT_DISCOVERY_SERVICE: &str = "localfreedomnames";
pub const DEFAULT_KEY_PATH: &str = "private.key";
pub const DEFAULT_PROTOCOL_PREFIX: &str = "/freedomnames";

pub const DEFAULT_BUCKET_SIZE: usize = 10;
pub const DEFAULT_CONCURRENCY: usize = 15;
pub const DEFAULT_RESILIENCY: usize = 2;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(30);
/// Shorter stats intervals, including zero, are raised to this.
pub const MIN_STATS_INTERVAL: Duration = Duration::from_millis(10);

/// Addresses a bootstrap node listens on.
pub const BOOTSTRAP_LISTEN_ADDRS: [&str; 4] = [
    "/ip4/0.0.0.0/tcp/4020",
    "/ip4/0.0.0.0/udp/4020/quic-v1",
    "/ip4/0.0.0.0/udp/4021/quic-v1/webtransport",
    "/ip4/0.0.0.0/udp/4022/webrtc-direct",
];

#[derive(Debug, Clone)]
/// Node Configurations
pub struct NodeConfig {
    /// Listen on fixed public addresses, run the store in server mode and
    /// don't join through other bootstrap peers.
    ///
    /// Defaults to false
    pub bootstrap_node: bool,
    /// Where the node identity is loaded from, or created at.
    ///
    /// Defaults to [DEFAULT_KEY_PATH]
    pub key_path: PathBuf,
    /// Defaults to [DEFAULT_USER_AGENT]
    pub user_agent: String,
    /// Service name announced to same-subnet peers.
    ///
    /// Defaults to [DEFAULT_DISCOVERY_SERVICE]
    pub discovery_service: String,
    /// Addresses to listen on when running as a bootstrap node.
    ///
    /// Defaults to [BOOTSTRAP_LISTEN_ADDRS]
    pub listen_addrs: Vec<String>,
    /// `/p2p/` addresses of the peers a non bootstrap node joins through.
    /// Entries that can't be parsed are logged and skipped.
    ///
    /// Defaults to empty, leaving local discovery as the only way in.
    pub bootstrap_peers: Vec<String>,
    /// Defaults to [DEFAULT_PROTOCOL_PREFIX]
    pub protocol_prefix: String,
    /// Namespace tag of name records.
    ///
    /// Defaults to [NAMESPACE]
    pub namespace: String,
    /// Defaults to [DEFAULT_BUCKET_SIZE]
    pub bucket_size: usize,
    /// Defaults to [DEFAULT_CONCURRENCY]
    pub concurrency: usize,
    /// Defaults to [DEFAULT_RESILIENCY]
    pub resiliency: usize,
    /// Maximum number of names in the local cache.
    ///
    /// Defaults to [DEFAULT_CACHE_CAPACITY]
    pub cache_capacity: NonZeroUsize,
    /// Upper bound of each distributed store read or write.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Defaults to [DEFAULT_BOOTSTRAP_TIMEOUT]
    pub bootstrap_timeout: Duration,
    /// Upper bound of dialing a locally discovered peer.
    ///
    /// Defaults to [DEFAULT_DIAL_TIMEOUT]
    pub dial_timeout: Duration,
    /// Raised to [MIN_STATS_INTERVAL] if shorter.
    ///
    /// Defaults to [DEFAULT_STATS_INTERVAL]
    pub stats_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bootstrap_node: false,
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            discovery_service: DEFAULT_DISCOVERY_SERVICE.to_string(),
            listen_addrs: BOOTSTRAP_LISTEN_ADDRS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            bootstrap_peers: vec![],
            protocol_prefix: DEFAULT_PROTOCOL_PREFIX.to_string(),
            namespace: NAMESPACE.to_string(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            resiliency: DEFAULT_RESILIENCY,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}
