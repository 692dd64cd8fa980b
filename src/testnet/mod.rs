//! In-process [Backend] for tests and local experiments.
//!
//! Every node built on the same [Testnet] shares one simulated network:
//! hosts dial each other by peer id and address, local discovery introduces
//! hosts registered under the same service name, and stores replicate
//! records to their XOR-closest connected peers.

mod discovery;
mod host;
mod store;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use tracing::debug;

use crate::{
    backend::{Backend, HostConfig},
    common::PeerInfo,
    discovery::{DiscoveryService, PeerFoundHandler},
    identity::NodeIdentity,
    network::{NetworkError, NetworkHost, PeerId},
    store::{DistributedStore, StoreConfig, StoreError},
};

pub use discovery::MemoryDiscovery;
pub use host::{MemoryHost, MemoryPeerStore};
pub use store::MemoryStore;

/// First port handed out to hosts without fixed listen addresses.
const BASE_PORT: u16 = 40_000;

#[derive(Clone, Default)]
/// A simulated network shared by every node built with it.
pub struct Testnet {
    registry: Arc<Registry>,
}

#[derive(Default)]
pub(crate) struct Registry {
    next_port: AtomicU16,
    hosts: RwLock<HashMap<PeerId, Arc<MemoryHost>>>,
    stores: RwLock<HashMap<PeerId, Arc<MemoryStore>>>,
    services: Mutex<HashMap<String, Vec<discovery::Member>>>,
}

impl Registry {
    pub(crate) fn host(&self, peer: &PeerId) -> Option<Arc<MemoryHost>> {
        read(&self.hosts).get(peer).cloned()
    }

    pub(crate) fn store(&self, peer: &PeerId) -> Option<Arc<MemoryStore>> {
        read(&self.stores).get(peer).cloned()
    }
}

impl Testnet {
    pub fn new() -> Self {
        Self::default()
    }

    // === Getters ===

    /// The host created for `peer`, if any.
    pub fn host(&self, peer: &PeerId) -> Option<Arc<MemoryHost>> {
        self.registry.host(peer)
    }

    /// The store created on top of `peer`'s host, if any.
    pub fn store(&self, peer: &PeerId) -> Option<Arc<MemoryStore>> {
        self.registry.store(peer)
    }

    /// What another host needs to dial `peer`.
    pub fn peer_info(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.host(peer).map(|host| host.peer_info())
    }

    /// `peer`'s listen addresses ending with `/p2p/<peer id>`, as expected in
    /// a bootstrap peer list.
    pub fn p2p_addrs(&self, peer: &PeerId) -> Vec<String> {
        self.host(peer)
            .map(|host| {
                host.listen_addrs()
                    .iter()
                    .map(|addr| addr.with_peer(peer).to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Backend for Testnet {
    fn create_host(
        &self,
        identity: &NodeIdentity,
        config: &HostConfig,
    ) -> Result<Arc<dyn NetworkHost>, NetworkError> {
        let id = identity.peer_id();

        if let Some(existing) = self.host(&id) {
            if !existing.is_closed() {
                return Err(NetworkError::InvalidAddress(format!(
                    "peer {id} is already listening"
                )));
            }
        }

        let port = BASE_PORT.wrapping_add(self.registry.next_port.fetch_add(1, Ordering::Relaxed));
        let host = Arc::new(MemoryHost::new(
            id,
            config,
            port,
            Arc::downgrade(&self.registry),
        ));

        write(&self.registry.hosts).insert(id, host.clone());
        debug!(peer = %id, addrs = ?host.listen_addrs(), "Created testnet host");

        Ok(host)
    }

    fn start_discovery(
        &self,
        host: Arc<dyn NetworkHost>,
        service_name: &str,
        handler: Arc<dyn PeerFoundHandler>,
    ) -> Result<Box<dyn DiscoveryService>, NetworkError> {
        let host = self
            .host(&host.id())
            .filter(|host| !host.is_closed())
            .ok_or(NetworkError::Closed)?;

        Ok(Box::new(MemoryDiscovery::start(
            &self.registry,
            service_name,
            host.peer_info(),
            handler,
        )))
    }

    fn create_store(
        &self,
        host: Arc<dyn NetworkHost>,
        config: StoreConfig,
    ) -> Result<Arc<dyn DistributedStore>, StoreError> {
        let host = self.host(&host.id()).ok_or_else(|| {
            StoreError::Unavailable(format!("host {} is not part of this testnet", host.id()))
        })?;

        if host.is_closed() {
            return Err(StoreError::Closed);
        }

        let id = host.id();
        let store = Arc::new(MemoryStore::new(host, config, Arc::downgrade(&self.registry)));

        write(&self.registry.stores).insert(id, store.clone());

        Ok(store)
    }
}

impl std::fmt::Debug for Testnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Testnet")
            .field("hosts", &read(&self.registry.hosts).len())
            .field("stores", &read(&self.registry.stores).len())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}
