//! In-process distributed store, replicating records to the XOR-closest
//! connected peers.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    cancel::CancelToken,
    common::{Id, ID_SIZE},
    network::{NetworkHost, PeerId},
    store::{check_cancelled, DistributedStore, Mode, RoutingPeer, StoreConfig, StoreError},
};

use super::{host::MemoryHost, lock, read, write, Registry};

/// A [DistributedStore] backed by a [MemoryHost].
pub struct MemoryStore {
    host: Arc<MemoryHost>,
    config: StoreConfig,
    protocol_id: String,
    registry: Weak<Registry>,
    records: RwLock<HashMap<Box<[u8]>, Bytes>>,
    routing: Mutex<HashMap<PeerId, Instant>>,
    closed: AtomicBool,
    unavailable: AtomicBool,
    latency: Mutex<Duration>,
    put_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn new(host: Arc<MemoryHost>, config: StoreConfig, registry: Weak<Registry>) -> Self {
        let protocol_id = config.protocol_id();

        if config.mode != Mode::Client {
            host.add_protocol(&protocol_id);
        }

        Self {
            host,
            config,
            protocol_id,
            registry,
            records: RwLock::new(HashMap::new()),
            routing: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            put_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }

    // === Getters ===

    pub fn id(&self) -> PeerId {
        self.host.id()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of [DistributedStore::put] calls made on this store.
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::Relaxed)
    }

    /// Number of [DistributedStore::get] calls made on this store.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::Relaxed)
    }

    /// The record held by this store alone, without asking peers.
    pub fn local_record(&self, key: &[u8]) -> Option<Bytes> {
        read(&self.records).get(key).cloned()
    }

    // === Public Methods ===

    /// Fail every put and get with [StoreError::Unavailable] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Delay every put and get by `latency`, unless cancelled first.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    // === Private Methods ===

    /// Whether other stores can query this one over `protocol_id`.
    fn serves(&self, protocol_id: &str) -> bool {
        !self.is_closed() && self.config.mode != Mode::Client && self.protocol_id == protocol_id
    }

    fn ready(&self, cancel: &CancelToken) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable(format!(
                "no peer reachable from {}",
                self.id()
            )));
        }

        check_cancelled(cancel)?;

        let latency = *lock(&self.latency);
        if !latency.is_zero() && cancel.wait_timeout(latency) {
            check_cancelled(cancel)?;
        }

        Ok(())
    }

    /// Connected peers serving the same protocol, refreshing the routing
    /// table along the way.
    fn routing_stores(&self) -> Vec<Arc<MemoryStore>> {
        let Some(registry) = self.registry.upgrade() else {
            return vec![];
        };

        let stores: Vec<Arc<MemoryStore>> = self
            .host
            .peers()
            .iter()
            .filter_map(|peer| registry.store(peer))
            .filter(|store| store.serves(&self.protocol_id))
            .collect();

        let mut routing = lock(&self.routing);
        routing.retain(|peer, _| stores.iter().any(|store| store.id() == *peer));
        for store in &stores {
            routing.entry(store.id()).or_insert_with(Instant::now);
        }

        stores
    }

    /// The `bucket_size` routing peers closest to `target`.
    fn closest(&self, target: &Id) -> Vec<Arc<MemoryStore>> {
        let mut stores = self.routing_stores();

        stores.sort_by_key(|store| store.id().xor(target));
        stores.truncate(self.config.bucket_size);

        stores
    }

    /// Validate and keep a record, letting the validator pick between the
    /// incoming and the existing value.
    fn accept(&self, key: &[u8], value: Bytes) -> Result<(), StoreError> {
        self.config.validator.validate(key, &value)?;

        let mut records = write(&self.records);

        match records.get(key) {
            Some(existing) if existing == &value => {}
            Some(existing) => {
                let candidates = [value.clone(), existing.clone()];
                if self.config.validator.select(key, &candidates) == 0 {
                    records.insert(key.into(), value);
                }
            }
            None => {
                records.insert(key.into(), value);
            }
        }

        Ok(())
    }

    /// A record a peer holds, as long as it is still a valid one.
    fn serve(&self, key: &[u8]) -> Option<Bytes> {
        let value = self.local_record(key)?;

        self.config
            .validator
            .validate(key, &value)
            .is_ok()
            .then_some(value)
    }
}

impl DistributedStore for MemoryStore {
    fn put(&self, key: &[u8], value: Bytes, cancel: &CancelToken) -> Result<(), StoreError> {
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        self.ready(cancel)?;

        self.accept(key, value.clone())?;

        let target = Id::for_key(key);
        let closest = self.closest(&target);
        let size = (key.len() + value.len()) as u64;

        for batch in closest.chunks(self.config.concurrency.max(1)) {
            check_cancelled(cancel)?;

            thread::scope(|scope| {
                for peer in batch {
                    let value = value.clone();

                    scope.spawn(move || {
                        self.host.record_traffic(0, size);
                        peer.host.record_traffic(size, 0);

                        if let Err(error) = peer.accept(key, value) {
                            debug!(peer = %peer.id(), ?error, "Peer rejected replicated record");
                        }
                    });
                }
            });
        }

        trace!(?target, replicas = closest.len(), "Stored record");

        Ok(())
    }

    fn get(&self, key: &[u8], cancel: &CancelToken) -> Result<Option<Bytes>, StoreError> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        self.ready(cancel)?;

        let mut candidates: Vec<Bytes> = self.serve(key).into_iter().collect();

        let target = Id::for_key(key);
        let closest = self.closest(&target);
        let quorum = self.config.resiliency.max(1);

        for batch in closest.chunks(self.config.concurrency.max(1)) {
            if candidates.len() >= quorum {
                break;
            }
            check_cancelled(cancel)?;

            let found: Vec<Bytes> = thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|peer| scope.spawn(move || peer.serve(key)))
                    .collect();

                handles
                    .into_iter()
                    .filter_map(|handle| handle.join().ok().flatten())
                    .collect()
            });

            for value in &found {
                self.host.record_traffic(value.len() as u64, key.len() as u64);
            }

            candidates.extend(found);
        }

        if candidates.is_empty() {
            return Ok(None);
        }

        let best = self.config.validator.select(key, &candidates);

        Ok(candidates.get(best).cloned())
    }

    fn routing_peers(&self) -> Vec<PeerId> {
        self.routing_stores().iter().map(|store| store.id()).collect()
    }

    fn routing_table(&self) -> Vec<RoutingPeer> {
        self.routing_stores();

        lock(&self.routing)
            .iter()
            .map(|(id, added_at)| RoutingPeer {
                id: *id,
                added_at: *added_at,
            })
            .collect()
    }

    fn mode(&self) -> Mode {
        self.config.mode
    }

    fn network_size(&self) -> Result<usize, StoreError> {
        let own = self.id();
        let mut peers = self.routing_peers();

        if peers.is_empty() {
            return Err(StoreError::Unavailable(
                "no peers to estimate the network size from".to_string(),
            ));
        }

        peers.sort_by_key(|peer| peer.xor(&own));

        Ok(size_estimate(&own, &peers[..peers.len().min(self.config.bucket_size)]))
    }

    fn bootstrap(&self, cancel: &CancelToken) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if self.config.bootstrap_peers.is_empty() {
            return Ok(());
        }

        let mut connected = 0;

        // Unreachable peers are not fatal, local discovery may still find the network.
        for peer in &self.config.bootstrap_peers {
            check_cancelled(cancel)?;

            match self.host.connect(peer, cancel) {
                Ok(()) => connected += 1,
                Err(error) => warn!(peer = %peer.id, ?error, "Failed to reach bootstrap peer"),
            }
        }

        check_cancelled(cancel)?;

        debug!(connected, routing_peers = self.routing_peers().len(), "Joined the network");

        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::Closed);
        }

        self.host.remove_protocol(&self.protocol_id);

        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("id", &self.id())
            .field("mode", &self.config.mode)
            .field("records", &read(&self.records).len())
            .finish()
    }
}

/// Estimate the network size from the distances of the closest peers to a
/// target: with `n` peers spread uniformly, the `i`th closest sits around
/// `i * MAX / n` away.
fn size_estimate(target: &Id, closest: &[PeerId]) -> usize {
    if closest.is_empty() {
        return 0;
    }

    let mut sum: usize = 0;

    for (index, peer) in closest.iter().enumerate() {
        let xor = peer.xor(target);

        // Drop the lower 4 bytes to fit a u160 distance into a u128.
        let mut high = [0u8; 16];
        high.copy_from_slice(&xor.as_bytes()[..ID_SIZE - 4]);
        let distance = u128::from_be_bytes(high).saturating_add(1);

        let intervals = usize::try_from(u128::MAX / distance).unwrap_or(usize::MAX);
        sum = sum.saturating_add(intervals.saturating_mul(index + 1));
    }

    sum / closest.len()
}
