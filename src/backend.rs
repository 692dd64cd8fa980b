//! Constructors for the collaborators a node is built from.

use std::sync::Arc;

use crate::{
    common::Multiaddr,
    discovery::{DiscoveryService, PeerFoundHandler},
    identity::NodeIdentity,
    network::{NetworkError, NetworkHost},
    store::{DistributedStore, StoreConfig, StoreError},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
/// Channel security negotiated on every connection. Hosts only connect to
/// peers using the same one.
pub enum SecurityTransport {
    #[default]
    Noise,
    Tls,
}

/// Network host settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    pub user_agent: String,
    /// Defaults to [SecurityTransport::Noise]
    pub security: SecurityTransport,
    /// Fixed addresses to listen on, empty to let the host pick.
    pub listen_addrs: Vec<Multiaddr>,
    /// Assume the host is publicly reachable and offer relay and hole
    /// punching services to other peers.
    pub public: bool,
    /// Try to open ports on the local router.
    pub nat_port_map: bool,
}

/// Builds the network host, the local discovery service and the distributed
/// store of a node.
///
/// [crate::testnet::Testnet] implements an in-process backend.
pub trait Backend: Send + Sync {
    fn create_host(
        &self,
        identity: &NodeIdentity,
        config: &HostConfig,
    ) -> Result<Arc<dyn NetworkHost>, NetworkError>;

    /// Start announcing `host` under `service_name` and report peers
    /// announcing the same service to `handler`.
    fn start_discovery(
        &self,
        host: Arc<dyn NetworkHost>,
        service_name: &str,
        handler: Arc<dyn PeerFoundHandler>,
    ) -> Result<Box<dyn DiscoveryService>, NetworkError>;

    fn create_store(
        &self,
        host: Arc<dyn NetworkHost>,
        config: StoreConfig,
    ) -> Result<Arc<dyn DistributedStore>, StoreError>;
}
