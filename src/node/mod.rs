//! Node lifecycle: startup, shutdown and introspection.

mod events;
mod stats;

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{error, info, warn};

use crate::{
    backend::{Backend, HostConfig, SecurityTransport},
    cancel::CancelToken,
    common::{peer_infos, Multiaddr},
    config::NodeConfig,
    discovery::{DiscoveryNotifee, DiscoveryService},
    error::StartupError,
    identity::NodeIdentity,
    network::{NetworkHost, PeerId},
    store::{DistributedStore, Mode, RoutingPeer, StoreConfig, StoreError},
    validator::{NameValidator, NamespacedValidator},
};

pub use stats::StatsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle states, in the only order a node moves through them.
pub enum NodeStatus {
    Uninitialized,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// The handles owned by a running node.
///
/// Created together by [Node::start] and closed together by
/// [Node::shutdown], never valid outside of that window.
pub(crate) struct NodeState {
    identity: NodeIdentity,
    host: Arc<dyn NetworkHost>,
    discovery: Box<dyn DiscoveryService>,
    store: Arc<dyn DistributedStore>,
}

impl NodeState {
    /// Best effort, close errors are logged and otherwise ignored.
    fn close(&self) {
        if let Err(error) = self.discovery.close() {
            warn!(?error, "Error closing local discovery");
        }
        if let Err(error) = self.host.close() {
            warn!(?error, "Error closing network host");
        }
        if let Err(error) = self.store.close() {
            warn!(?error, "Error closing distributed store");
        }
    }
}

#[derive(Clone)]
/// A name directory node.
///
/// Cheap to clone, every clone is a handle to the same node.
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    config: NodeConfig,
    backend: Arc<dyn Backend>,
    lifecycle: RwLock<Lifecycle>,
    /// Node wide scope, cancelled on shutdown.
    cancel: CancelToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Lifecycle {
    status: NodeStatus,
    state: Option<Arc<NodeState>>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    pub fn new(config: NodeConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                lifecycle: RwLock::new(Lifecycle {
                    status: NodeStatus::Uninitialized,
                    state: None,
                }),
                cancel: CancelToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    // === Getters ===

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn status(&self) -> NodeStatus {
        self.read().status
    }

    /// Node wide cancellation scope, cancelled when the node shuts down.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.cancel
    }

    /// `true` only while the node is running with both its network host and
    /// distributed store available.
    pub fn is_initialized(&self) -> bool {
        let lifecycle = self.read();

        lifecycle.status == NodeStatus::Running && lifecycle.state.is_some()
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.state().map(|state| state.identity.peer_id())
    }

    pub fn mode(&self) -> Option<Mode> {
        self.state().map(|state| state.store.mode())
    }

    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.state()
            .map(|state| state.host.listen_addrs())
            .unwrap_or_default()
    }

    pub fn routing_peers(&self) -> Vec<PeerId> {
        self.state()
            .map(|state| state.store.routing_peers())
            .unwrap_or_default()
    }

    pub fn routing_table(&self) -> Vec<RoutingPeer> {
        self.state()
            .map(|state| state.store.routing_table())
            .unwrap_or_default()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.state()
            .map(|state| state.host.peers())
            .unwrap_or_default()
    }

    /// Estimated number of peers in the network, `0` while not initialized.
    pub fn network_size(&self) -> Result<usize, StoreError> {
        match self.state() {
            Some(state) => state.store.network_size(),
            None => Ok(0),
        }
    }

    pub fn supported_protocols(&self) -> Vec<String> {
        self.state()
            .map(|state| state.host.protocols())
            .unwrap_or_default()
    }

    /// Connected peers and bandwidth totals, read from the network host.
    pub fn stats(&self) -> StatsSnapshot {
        self.state()
            .map(|state| StatsSnapshot::collect(state.host.as_ref()))
            .unwrap_or_default()
    }

    pub(crate) fn store(&self) -> Result<Arc<dyn DistributedStore>, StoreError> {
        self.state()
            .map(|state| state.store.clone())
            .ok_or(StoreError::NotInitialized)
    }

    // === Public Methods ===

    /// Load the identity, create the network host, register local discovery,
    /// create the distributed store and join the network.
    ///
    /// Any failure is fatal: the node moves to [NodeStatus::Stopped] and
    /// can't be started again.
    pub fn start(&self) -> Result<(), StartupError> {
        {
            let mut lifecycle = self.write();

            if lifecycle.status != NodeStatus::Uninitialized {
                return Err(StartupError::InvalidState(lifecycle.status));
            }
            lifecycle.status = NodeStatus::Starting;
        }

        let state = match self.open() {
            Ok(state) => Arc::new(state),
            Err(error) => {
                error!(%error, "Node failed to start");
                self.write().status = NodeStatus::Stopped;

                return Err(error);
            }
        };

        {
            let mut lifecycle = self.write();

            if lifecycle.status != NodeStatus::Starting || self.inner.cancel.is_cancelled() {
                drop(lifecycle);
                state.close();
                self.write().status = NodeStatus::Stopped;

                return Err(StartupError::Aborted);
            }

            lifecycle.state = Some(state.clone());
            lifecycle.status = NodeStatus::Running;

            // Under the lifecycle lock, so a concurrent shutdown joins them.
            self.spawn_loops(&state);
        }

        Ok(())
    }

    /// Cancel in-flight calls, stop the observability loops, then close local
    /// discovery, the network host and the distributed store.
    ///
    /// Close errors are logged, not returned. Calling it more than once, or
    /// on a node that never started, is a no-op.
    pub fn shutdown(&self) {
        let state = {
            let mut lifecycle = self.write();

            match lifecycle.status {
                NodeStatus::Running => {
                    lifecycle.status = NodeStatus::ShuttingDown;
                    lifecycle.state.take()
                }
                NodeStatus::Uninitialized => {
                    lifecycle.status = NodeStatus::Stopped;
                    None
                }
                NodeStatus::Starting => {
                    // Abort the startup in progress, `start` cleans up.
                    drop(lifecycle);
                    self.inner.cancel.cancel();
                    return;
                }
                NodeStatus::ShuttingDown | NodeStatus::Stopped => return,
            }
        };

        info!("Shutting down node");
        self.inner.cancel.cancel();

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if task.join().is_err() {
                warn!("Observability task panicked");
            }
        }

        if let Some(state) = state {
            state.close();
        }

        self.write().status = NodeStatus::Stopped;
        info!("Node stopped");
    }

    // === Private Methods ===

    fn open(&self) -> Result<NodeState, StartupError> {
        let config = &self.inner.config;
        let backend = &self.inner.backend;

        let identity = NodeIdentity::load_or_create(&config.key_path)?;

        let listen_addrs = if config.bootstrap_node {
            info!("Starting bootstrap node");

            config
                .listen_addrs
                .iter()
                .map(|addr| addr.parse::<Multiaddr>())
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![]
        };

        let host_config = HostConfig {
            user_agent: config.user_agent.clone(),
            security: SecurityTransport::Noise,
            listen_addrs,
            public: config.bootstrap_node,
            nat_port_map: true,
        };

        let host = backend
            .create_host(&identity, &host_config)
            .map_err(StartupError::Host)?;

        let peer_id = host.id();
        info!(%peer_id, "Network host started");
        for addr in host.listen_addrs() {
            info!(addr = %addr.with_peer(&peer_id), "Connect to me on");
        }

        let notifee = Arc::new(DiscoveryNotifee::new(
            host.clone(),
            self.inner.cancel.child_token(),
            config.dial_timeout,
        ));

        let discovery = match backend.start_discovery(host.clone(), &config.discovery_service, notifee)
        {
            Ok(discovery) => discovery,
            Err(error) => {
                if let Err(error) = host.close() {
                    warn!(?error, "Error closing network host");
                }
                return Err(StartupError::Discovery(error));
            }
        };
        info!(service = %config.discovery_service, "Local discovery service started");

        let store = match backend.create_store(host.clone(), self.store_config()) {
            Ok(store) => store,
            Err(error) => {
                if let Err(error) = discovery.close() {
                    warn!(?error, "Error closing local discovery");
                }
                if let Err(error) = host.close() {
                    warn!(?error, "Error closing network host");
                }
                return Err(StartupError::Store(error));
            }
        };

        let state = NodeState {
            identity,
            host,
            discovery,
            store,
        };

        let cancel = self.inner.cancel.child_with_timeout(config.bootstrap_timeout);

        if let Err(error) = state.store.bootstrap(&cancel) {
            state.close();
            return Err(StartupError::Bootstrap(error));
        }

        info!(
            mode = %state.store.mode(),
            routing_peers = state.store.routing_peers().len(),
            "Distributed store bootstrapped"
        );

        Ok(state)
    }

    fn store_config(&self) -> StoreConfig {
        let config = &self.inner.config;

        let validator = NamespacedValidator::new().with(
            config.namespace.clone(),
            Arc::new(NameValidator::new(config.namespace.clone())),
        );

        let (mode, bootstrap_peers) = if config.bootstrap_node {
            (Mode::Server, vec![])
        } else {
            let peers = peer_infos(&config.bootstrap_peers);

            if peers.is_empty() {
                warn!("No bootstrap peers configured, relying on local discovery");
            }

            (Mode::Auto, peers)
        };

        StoreConfig {
            mode,
            bucket_size: config.bucket_size,
            protocol_prefix: config.protocol_prefix.clone(),
            concurrency: config.concurrency,
            resiliency: config.resiliency,
            validator: Arc::new(validator),
            bootstrap_peers,
        }
    }

    fn spawn_loops(&self, state: &NodeState) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        match state.host.subscribe(&events::SUBSCRIBED_EVENTS) {
            Ok(subscription) => {
                let host = state.host.clone();
                let cancel = self.inner.cancel.child_token();

                match thread::Builder::new()
                    .name("freedomnames-events".to_string())
                    .spawn(move || events::run(host, subscription, cancel))
                {
                    Ok(handle) => tasks.push(handle),
                    Err(error) => error!(?error, "Failed to spawn the event listener"),
                }
            }
            Err(error) => error!(?error, "Failed to subscribe to network events"),
        }

        let host = state.host.clone();
        let cancel = self.inner.cancel.child_token();
        let interval = self.inner.config.stats_interval;

        match thread::Builder::new()
            .name("freedomnames-stats".to_string())
            .spawn(move || {
                stats::run(host, interval, cancel);
            })
        {
            Ok(handle) => tasks.push(handle),
            Err(error) => error!(?error, "Failed to spawn the stats service"),
        }
    }

    fn state(&self) -> Option<Arc<NodeState>> {
        self.read().state.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("status", &self.status())
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
/// Fluent [NodeConfig] builder.
pub struct NodeBuilder(NodeConfig);

impl NodeBuilder {
    /// Run as a bootstrap node: listen on fixed addresses, assume public
    /// reachability and serve the distributed store.
    pub fn bootstrap_node(&mut self) -> &mut Self {
        self.0.bootstrap_node = true;

        self
    }

    /// Path of the identity key file.
    pub fn key_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.0.key_path = path.into();

        self
    }

    /// Set the `/p2p/` addresses of the peers to join through.
    pub fn bootstrap(&mut self, peers: &[String]) -> &mut Self {
        self.0.bootstrap_peers = peers.to_vec();

        self
    }

    /// Set the addresses a bootstrap node listens on.
    pub fn listen_addrs(&mut self, addrs: &[String]) -> &mut Self {
        self.0.listen_addrs = addrs.to_vec();

        self
    }

    pub fn discovery_service(&mut self, name: &str) -> &mut Self {
        self.0.discovery_service = name.to_string();

        self
    }

    pub fn protocol_prefix(&mut self, prefix: &str) -> &mut Self {
        self.0.protocol_prefix = prefix.to_string();

        self
    }

    pub fn bucket_size(&mut self, bucket_size: usize) -> &mut Self {
        self.0.bucket_size = bucket_size;

        self
    }

    pub fn cache_capacity(&mut self, capacity: NonZeroUsize) -> &mut Self {
        self.0.cache_capacity = capacity;

        self
    }

    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.0.request_timeout = timeout;

        self
    }

    pub fn bootstrap_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.0.bootstrap_timeout = timeout;

        self
    }

    pub fn stats_interval(&mut self, interval: Duration) -> &mut Self {
        self.0.stats_interval = interval;

        self
    }

    /// Create an uninitialized [Node], call [Node::start] to bring it up.
    pub fn build(&self, backend: Arc<dyn Backend>) -> Node {
        Node::new(self.0.clone(), backend)
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::testnet::Testnet;

    fn builder(dir: &TempDir, key: &str) -> NodeBuilder {
        let mut builder = Node::builder();
        builder.key_path(dir.path().join(key));

        builder
    }

    #[test]
    fn accessors_are_empty_before_start() {
        let dir = TempDir::new().unwrap();
        let node = builder(&dir, "a.key").build(Arc::new(Testnet::new()));

        assert_eq!(node.status(), NodeStatus::Uninitialized);
        assert!(!node.is_initialized());
        assert_eq!(node.peer_id(), None);
        assert_eq!(node.mode(), None);
        assert!(node.listen_addresses().is_empty());
        assert!(node.routing_peers().is_empty());
        assert!(node.routing_table().is_empty());
        assert!(node.connected_peers().is_empty());
        assert_eq!(node.network_size(), Ok(0));
        assert!(node.supported_protocols().is_empty());
        assert_eq!(node.stats(), StatsSnapshot::default());
        assert!(matches!(node.store(), Err(StoreError::NotInitialized)));
    }

    #[test]
    fn lifecycle() {
        let dir = TempDir::new().unwrap();
        let node = builder(&dir, "a.key")
            .bootstrap_node()
            .build(Arc::new(Testnet::new()));

        node.start().unwrap();

        assert_eq!(node.status(), NodeStatus::Running);
        assert!(node.is_initialized());
        assert_eq!(node.mode(), Some(Mode::Server));
        assert_eq!(node.listen_addresses().len(), 4);
        assert!(node
            .supported_protocols()
            .contains(&"/freedomnames/kad/1.0.0".to_string()));
        assert!(matches!(
            node.start(),
            Err(StartupError::InvalidState(NodeStatus::Running))
        ));
        assert_eq!(node.inner.tasks.lock().unwrap().len(), 2);

        node.shutdown();

        assert_eq!(node.status(), NodeStatus::Stopped);
        assert!(!node.is_initialized());
        assert_eq!(node.peer_id(), None);
        assert!(node.cancel_token().is_cancelled());
        assert!(node.inner.tasks.lock().unwrap().is_empty());

        node.shutdown();
        assert!(matches!(
            node.start(),
            Err(StartupError::InvalidState(NodeStatus::Stopped))
        ));
    }

    #[test]
    fn identity_survives_restarts() {
        let dir = TempDir::new().unwrap();
        let testnet = Testnet::new();

        let first = builder(&dir, "a.key").build(Arc::new(testnet.clone()));
        first.start().unwrap();
        let peer_id = first.peer_id();
        first.shutdown();

        let second = builder(&dir, "a.key").build(Arc::new(testnet));
        second.start().unwrap();

        assert_eq!(second.peer_id(), peer_id);

        second.shutdown();
    }

    #[test]
    fn corrupt_identity_is_fatal() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.key"), b"garbage").unwrap();

        let node = builder(&dir, "a.key").build(Arc::new(Testnet::new()));

        assert!(matches!(node.start(), Err(StartupError::Identity(_))));
        assert_eq!(node.status(), NodeStatus::Stopped);
        assert!(!node.is_initialized());
    }

    #[test]
    fn invalid_listen_address_is_fatal() {
        let dir = TempDir::new().unwrap();
        let node = builder(&dir, "a.key")
            .bootstrap_node()
            .listen_addrs(&["0.0.0.0:4020".to_string()])
            .build(Arc::new(Testnet::new()));

        assert!(matches!(node.start(), Err(StartupError::ListenAddr(_))));
        assert_eq!(node.status(), NodeStatus::Stopped);
    }

    #[test]
    fn unreachable_bootstrap_peers_are_not_fatal() {
        let dir = TempDir::new().unwrap();
        let testnet = Testnet::new();

        let local = builder(&dir, "local.key").build(Arc::new(testnet.clone()));
        local.start().unwrap();

        let node = builder(&dir, "a.key")
            .bootstrap(&[format!(
                "/ip4/192.168.1.204/tcp/4020/p2p/{}",
                PeerId::random()
            )])
            .build(Arc::new(testnet.clone()));

        node.start().unwrap();

        assert_eq!(node.status(), NodeStatus::Running);
        assert_eq!(node.connected_peers(), vec![local.peer_id().unwrap()]);

        node.shutdown();
        local.shutdown();
    }

    #[test]
    fn joins_through_bootstrap_peers() {
        let dir = TempDir::new().unwrap();
        let testnet = Testnet::new();

        let bootstrap = builder(&dir, "bootstrap.key")
            .bootstrap_node()
            .build(Arc::new(testnet.clone()));
        bootstrap.start().unwrap();
        let bootstrap_id = bootstrap.peer_id().unwrap();

        let node = builder(&dir, "node.key")
            .discovery_service("elsewhere")
            .bootstrap(&testnet.p2p_addrs(&bootstrap_id))
            .build(Arc::new(testnet.clone()));
        node.start().unwrap();

        assert_eq!(node.mode(), Some(Mode::Auto));
        assert_eq!(node.connected_peers(), vec![bootstrap_id]);
        assert_eq!(node.routing_peers(), vec![bootstrap_id]);
        assert_eq!(node.stats().connected_peers, 1);
        assert!(node.network_size().unwrap() > 0);

        node.shutdown();
        assert!(bootstrap.connected_peers().is_empty());

        bootstrap.shutdown();
    }

    #[test]
    fn local_discovery_connects_nodes() {
        let dir = TempDir::new().unwrap();
        let testnet = Testnet::new();

        let a = builder(&dir, "a.key").build(Arc::new(testnet.clone()));
        let b = builder(&dir, "b.key").build(Arc::new(testnet.clone()));
        a.start().unwrap();
        b.start().unwrap();

        assert_eq!(a.connected_peers(), vec![b.peer_id().unwrap()]);
        assert_eq!(b.connected_peers(), vec![a.peer_id().unwrap()]);

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn shutdown_before_start() {
        let dir = TempDir::new().unwrap();
        let node = builder(&dir, "a.key").build(Arc::new(Testnet::new()));

        node.shutdown();

        assert_eq!(node.status(), NodeStatus::Stopped);
        assert!(matches!(
            node.start(),
            Err(StartupError::InvalidState(NodeStatus::Stopped))
        ));
    }
}
