//! The distributed store: a Kademlia style DHT the node reads and writes
//! name records through.

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use serde::Serialize;

use crate::{
    cancel::{CancelReason, CancelToken},
    common::PeerInfo,
    network::PeerId,
    validator::{Rejected, Validator},
};

/// A replicated key-value store shared with other peers.
///
/// Implementations must be internally thread-safe, callers issue no extra
/// locking around them. Every network bound call takes a [CancelToken] and
/// must give up once it is cancelled or its deadline passes.
pub trait DistributedStore: Send + Sync {
    /// Validate and store a value on this node and the peers closest to `key`.
    fn put(&self, key: &[u8], value: Bytes, cancel: &CancelToken) -> Result<(), StoreError>;

    /// The best value known for `key` according to the configured
    /// [Validator], `None` if no peer has one.
    fn get(&self, key: &[u8], cancel: &CancelToken) -> Result<Option<Bytes>, StoreError>;

    /// Peers in the routing table.
    fn routing_peers(&self) -> Vec<PeerId>;

    /// Routing table entries with their metadata.
    fn routing_table(&self) -> Vec<RoutingPeer>;

    fn mode(&self) -> Mode;

    /// An estimate of the number of peers in the network.
    fn network_size(&self) -> Result<usize, StoreError>;

    /// Join the network through the configured bootstrap peers and fill the
    /// routing table.
    ///
    /// Unreachable peers are skipped; only a closed store or a cancelled
    /// `cancel` fail the call.
    fn bootstrap(&self, cancel: &CancelToken) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
/// Whether the store answers queries from other peers.
pub enum Mode {
    /// Only issues queries.
    Client,
    /// Issues and answers queries.
    Server,
    /// Switches between client and server depending on reachability.
    Auto,
    /// Like [Mode::Auto], but assumes server until shown unreachable.
    AutoServer,
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Client => "Client",
            Mode::Server => "Server",
            Mode::Auto => "Auto",
            Mode::AutoServer => "AutoServer",
        };

        f.write_str(name)
    }
}

/// A routing table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPeer {
    pub id: PeerId,
    pub added_at: Instant,
}

/// Configuration surface of a [DistributedStore].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub mode: Mode,
    /// Kademlia `k`: routing bucket size and replication factor.
    pub bucket_size: usize,
    /// Prefix of the protocol ids the store speaks, e.g. `/freedomnames`.
    pub protocol_prefix: String,
    /// Kademlia `alpha`: number of peers queried in parallel.
    pub concurrency: usize,
    /// Kademlia `beta`: number of closest peers that must respond before a
    /// lookup terminates.
    pub resiliency: usize,
    pub validator: Arc<dyn Validator>,
    /// Peers to join through, empty for bootstrap nodes.
    pub bootstrap_peers: Vec<PeerInfo>,
}

impl StoreConfig {
    /// The protocol id the store registers on the host.
    pub fn protocol_id(&self) -> String {
        format!("{}/kad/1.0.0", self.protocol_prefix)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Distributed store errors, all transient from the caller's point of view.
pub enum StoreError {
    #[error("Distributed store is not initialized")]
    NotInitialized,

    #[error("Store call was cancelled")]
    Cancelled,

    #[error("Store call timed out")]
    TimedOut,

    #[error("Distributed store is closed")]
    Closed,

    #[error("Record rejected: {0}")]
    Rejected(#[from] Rejected),

    #[error("Distributed store unavailable: {0}")]
    Unavailable(String),
}

impl From<CancelReason> for StoreError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Cancelled => StoreError::Cancelled,
            CancelReason::DeadlineExceeded => StoreError::TimedOut,
        }
    }
}

/// Returns the matching [StoreError] if `cancel` is no longer live.
pub fn check_cancelled(cancel: &CancelToken) -> Result<(), StoreError> {
    match cancel.reason() {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}
