//! In-process network host.

use std::{
    collections::{HashMap, HashSet},
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, RwLock, Weak,
    },
    time::Instant,
};

use flume::Sender;
use tracing::debug;

use crate::{
    backend::{HostConfig, SecurityTransport},
    cancel::CancelToken,
    common::{Multiaddr, PeerInfo},
    network::{
        BandwidthTotals, Connectedness, EventKind, NetworkError, NetworkEvent, NetworkHost,
        PeerId, PeerStore, Subscription,
    },
};

use super::{lock, read, write, Registry};

/// Bytes accounted to both sides of a new connection.
const HANDSHAKE_SIZE: u64 = 256;

const IDENTIFY_PROTOCOL: &str = "/ipfs/id/1.0.0";
const RELAY_HOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/hop";

/// A [NetworkHost] connecting to other hosts of the same
/// [Testnet](super::Testnet).
pub struct MemoryHost {
    id: PeerId,
    user_agent: String,
    security: SecurityTransport,
    public: bool,
    addrs: Vec<Multiaddr>,
    registry: Weak<Registry>,
    closed: AtomicBool,
    protocols: RwLock<Vec<String>>,
    connections: RwLock<HashSet<PeerId>>,
    peer_store: MemoryPeerStore,
    subscribers: Mutex<Vec<Subscriber>>,
    bandwidth: BandwidthCounter,
}

struct Subscriber {
    kinds: Vec<EventKind>,
    sender: Sender<NetworkEvent>,
}

impl MemoryHost {
    pub(crate) fn new(id: PeerId, config: &HostConfig, port: u16, registry: Weak<Registry>) -> Self {
        let addrs = if config.listen_addrs.is_empty() {
            vec![Multiaddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))]
        } else {
            config.listen_addrs.clone()
        };

        let mut protocols = vec![IDENTIFY_PROTOCOL.to_string()];
        if config.public {
            protocols.push(RELAY_HOP_PROTOCOL.to_string());
        }

        Self {
            id,
            user_agent: config.user_agent.clone(),
            security: config.security,
            public: config.public,
            addrs,
            registry,
            closed: AtomicBool::new(false),
            protocols: RwLock::new(protocols),
            connections: RwLock::new(HashSet::new()),
            peer_store: MemoryPeerStore::default(),
            subscribers: Mutex::new(Vec::new()),
            bandwidth: BandwidthCounter::new(),
        }
    }

    // === Getters ===

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn security(&self) -> SecurityTransport {
        self.security
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        read(&self.connections).contains(peer)
    }

    /// This host's [PeerInfo], as another host would dial it.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.id, self.addrs.clone())
    }

    // === Public Methods ===

    /// Drop the connection to `peer` on both ends.
    pub fn disconnect(&self, peer: &PeerId) {
        self.unlink(peer);

        if let Some(remote) = self.registry.upgrade().and_then(|r| r.host(peer)) {
            remote.unlink(&self.id);
        }
    }

    /// Start handling `protocol`, and tell connected peers about it.
    pub fn add_protocol(&self, protocol: &str) {
        {
            let mut protocols = write(&self.protocols);
            if protocols.iter().any(|p| p == protocol) {
                return;
            }
            protocols.push(protocol.to_string());
        }

        self.emit(NetworkEvent::LocalProtocolsUpdated {
            added: vec![protocol.to_string()],
            removed: vec![],
        });
        self.announce_protocols(vec![protocol.to_string()], vec![]);
    }

    /// Stop handling `protocol`, and tell connected peers about it.
    pub fn remove_protocol(&self, protocol: &str) {
        {
            let mut protocols = write(&self.protocols);
            let before = protocols.len();
            protocols.retain(|p| p != protocol);
            if protocols.len() == before {
                return;
            }
        }

        self.emit(NetworkEvent::LocalProtocolsUpdated {
            added: vec![],
            removed: vec![protocol.to_string()],
        });
        self.announce_protocols(vec![], vec![protocol.to_string()]);
    }

    /// Publish an event to the subscribers of its kind.
    pub fn emit(&self, event: NetworkEvent) {
        let kind = event.kind();

        lock(&self.subscribers).retain(|subscriber| {
            !subscriber.kinds.contains(&kind) || subscriber.sender.send(event.clone()).is_ok()
        });
    }

    /// Account traffic to this host.
    pub fn record_traffic(&self, inbound: u64, outbound: u64) {
        self.bandwidth.record(inbound, outbound);
    }

    // === Private Methods ===

    fn link(&self, remote: &MemoryHost) {
        if !write(&self.connections).insert(remote.id) {
            return;
        }

        self.peer_store
            .add(remote.id, remote.addrs.clone(), remote.protocols());
        self.record_traffic(HANDSHAKE_SIZE, HANDSHAKE_SIZE);

        self.emit(NetworkEvent::PeerConnectednessChanged {
            peer: remote.id,
            connectedness: Connectedness::Connected,
        });
        self.emit(NetworkEvent::PeerIdentificationCompleted { peer: remote.id });
    }

    fn unlink(&self, peer: &PeerId) {
        if !write(&self.connections).remove(peer) {
            return;
        }

        self.emit(NetworkEvent::PeerConnectednessChanged {
            peer: *peer,
            connectedness: Connectedness::NotConnected,
        });
    }

    fn announce_protocols(&self, added: Vec<String>, removed: Vec<String>) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        for peer in self.peers() {
            if let Some(remote) = registry.host(&peer) {
                remote
                    .peer_store
                    .update_protocols(&self.id, &added, &removed);
                remote.emit(NetworkEvent::PeerProtocolsUpdated {
                    peer: self.id,
                    added: added.clone(),
                    removed: removed.clone(),
                });
            }
        }
    }
}

impl NetworkHost for MemoryHost {
    fn id(&self) -> PeerId {
        self.id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.addrs.clone()
    }

    fn protocols(&self) -> Vec<String> {
        read(&self.protocols).clone()
    }

    fn peers(&self) -> Vec<PeerId> {
        read(&self.connections).iter().copied().collect()
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if self.is_connected(peer) {
            Connectedness::Connected
        } else {
            Connectedness::NotConnected
        }
    }

    fn connect(&self, peer: &PeerInfo, cancel: &CancelToken) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(NetworkError::Cancelled);
        }
        if peer.id == self.id {
            return Err(NetworkError::Unreachable(peer.id));
        }
        if self.is_connected(&peer.id) {
            return Ok(());
        }

        let remote = self
            .registry
            .upgrade()
            .and_then(|registry| registry.host(&peer.id))
            .filter(|remote| !remote.is_closed())
            .ok_or(NetworkError::Unreachable(peer.id))?;

        // An empty address list leaves finding the peer to the network.
        let dialable = peer.addrs.is_empty()
            || peer
                .addrs
                .iter()
                .any(|addr| remote.addrs.contains(&addr.without_peer()));

        if !dialable {
            return Err(NetworkError::Unreachable(peer.id));
        }
        if remote.security != self.security {
            debug!(
                remote = %peer.id,
                local = ?self.security,
                theirs = ?remote.security,
                "Security handshake failed"
            );
            return Err(NetworkError::Unreachable(peer.id));
        }

        self.link(&remote);
        remote.link(self);

        debug!(local = %self.id, remote = %peer.id, "Connected");

        Ok(())
    }

    fn subscribe(&self, kinds: &[EventKind]) -> Result<Subscription, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }

        let (sender, receiver) = flume::unbounded();

        lock(&self.subscribers).push(Subscriber {
            kinds: kinds.to_vec(),
            sender,
        });

        Ok(Subscription::new(receiver))
    }

    fn peer_store(&self) -> &dyn PeerStore {
        &self.peer_store
    }

    fn bandwidth(&self) -> BandwidthTotals {
        self.bandwidth.totals()
    }

    fn close(&self) -> Result<(), NetworkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for peer in self.peers() {
            self.disconnect(&peer);
        }

        lock(&self.subscribers).clear();

        Ok(())
    }
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHost")
            .field("id", &self.id)
            .field("addrs", &self.addrs)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Default)]
/// Addresses and protocols of the peers a [MemoryHost] has met.
pub struct MemoryPeerStore {
    peers: RwLock<HashMap<PeerId, KnownPeer>>,
}

#[derive(Debug, Clone, Default)]
struct KnownPeer {
    addrs: Vec<Multiaddr>,
    protocols: Vec<String>,
}

impl MemoryPeerStore {
    pub fn contains(&self, peer: &PeerId) -> bool {
        read(&self.peers).contains_key(peer)
    }

    fn add(&self, peer: PeerId, addrs: Vec<Multiaddr>, protocols: Vec<String>) {
        write(&self.peers).insert(peer, KnownPeer { addrs, protocols });
    }

    fn update_protocols(&self, peer: &PeerId, added: &[String], removed: &[String]) {
        if let Some(known) = write(&self.peers).get_mut(peer) {
            known.protocols.retain(|p| !removed.contains(p));
            for protocol in added {
                if !known.protocols.contains(protocol) {
                    known.protocols.push(protocol.clone());
                }
            }
        }
    }
}

impl PeerStore for MemoryPeerStore {
    fn peer_info(&self, peer: &PeerId) -> PeerInfo {
        PeerInfo::new(*peer, self.addrs(peer))
    }

    fn protocols(&self, peer: &PeerId) -> Result<Vec<String>, NetworkError> {
        read(&self.peers)
            .get(peer)
            .map(|known| known.protocols.clone())
            .ok_or(NetworkError::UnknownPeer(*peer))
    }

    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        read(&self.peers)
            .get(peer)
            .map(|known| known.addrs.clone())
            .unwrap_or_default()
    }

    fn remove_peer(&self, peer: &PeerId) {
        write(&self.peers).remove(peer);
    }
}

/// Cumulative traffic, with rates averaged over the counter's lifetime.
#[derive(Debug)]
struct BandwidthCounter {
    started: Instant,
    total_in: AtomicU64,
    total_out: AtomicU64,
}

impl BandwidthCounter {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            total_in: AtomicU64::new(0),
            total_out: AtomicU64::new(0),
        }
    }

    fn record(&self, inbound: u64, outbound: u64) {
        self.total_in.fetch_add(inbound, Ordering::Relaxed);
        self.total_out.fetch_add(outbound, Ordering::Relaxed);
    }

    fn totals(&self) -> BandwidthTotals {
        let total_in = self.total_in.load(Ordering::Relaxed);
        let total_out = self.total_out.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64().max(1.0);

        BandwidthTotals {
            total_in,
            total_out,
            rate_in: total_in as f64 / elapsed,
            rate_out: total_out as f64 / elapsed,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{backend::Backend, identity::NodeIdentity, testnet::Testnet};

    fn pair() -> (Testnet, Arc<MemoryHost>, Arc<MemoryHost>) {
        let testnet = Testnet::new();
        let config = HostConfig::default();

        let a = testnet
            .create_host(&NodeIdentity::generate(), &config)
            .unwrap();
        let b = testnet
            .create_host(&NodeIdentity::generate(), &config)
            .unwrap();

        let a = testnet.host(&a.id()).unwrap();
        let b = testnet.host(&b.id()).unwrap();

        (testnet, a, b)
    }

    #[test]
    fn default_protocols() {
        let (_testnet, a, _b) = pair();

        assert_eq!(a.protocols(), vec![IDENTIFY_PROTOCOL.to_string()]);
        assert_eq!(a.security(), SecurityTransport::Noise);
    }

    #[test]
    fn mismatched_security_is_refused() {
        let (testnet, a, _b) = pair();

        let config = HostConfig {
            security: SecurityTransport::Tls,
            ..Default::default()
        };
        let tls = testnet
            .create_host(&NodeIdentity::generate(), &config)
            .unwrap();

        assert_eq!(
            a.connect(&testnet.peer_info(&tls.id()).unwrap(), &CancelToken::new()),
            Err(NetworkError::Unreachable(tls.id()))
        );
        assert!(a.peers().is_empty());
    }

    #[test]
    fn connect_is_mutual() {
        let (_testnet, a, b) = pair();

        a.connect(&b.peer_info(), &CancelToken::new()).unwrap();

        assert_eq!(a.peers(), vec![b.id()]);
        assert_eq!(b.peers(), vec![a.id()]);
        assert_eq!(a.peer_store().addrs(&b.id()), b.listen_addrs());
        assert!(b.peer_store.contains(&a.id()));
    }

    #[test]
    fn unreachable_peers() {
        let (_testnet, a, b) = pair();

        let unknown = PeerInfo::new(PeerId::random(), vec![]);
        assert_eq!(
            a.connect(&unknown, &CancelToken::new()),
            Err(NetworkError::Unreachable(unknown.id))
        );

        let wrong_addr = PeerInfo::new(
            b.id(),
            vec!["/ip4/10.9.9.9/tcp/1".parse::<Multiaddr>().unwrap()],
        );
        assert_eq!(
            a.connect(&wrong_addr, &CancelToken::new()),
            Err(NetworkError::Unreachable(b.id()))
        );

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            a.connect(&b.peer_info(), &cancel),
            Err(NetworkError::Cancelled)
        );
    }

    #[test]
    fn events_are_filtered_by_kind() {
        let (_testnet, a, b) = pair();

        let subscription = a
            .subscribe(&[EventKind::PeerConnectednessChanged])
            .unwrap();

        a.connect(&b.peer_info(), &CancelToken::new()).unwrap();
        a.disconnect(&b.id());

        let events: Vec<_> = subscription.events().drain().collect();
        assert_eq!(
            events,
            vec![
                NetworkEvent::PeerConnectednessChanged {
                    peer: b.id(),
                    connectedness: Connectedness::Connected
                },
                NetworkEvent::PeerConnectednessChanged {
                    peer: b.id(),
                    connectedness: Connectedness::NotConnected
                },
            ]
        );
        assert!(b.peers().is_empty());
    }

    #[test]
    fn protocol_updates_reach_peers() {
        let (_testnet, a, b) = pair();
        a.connect(&b.peer_info(), &CancelToken::new()).unwrap();

        let subscription = b.subscribe(&[EventKind::PeerProtocolsUpdated]).unwrap();

        a.add_protocol("/freedomnames/kad/1.0.0");

        assert!(b
            .peer_store()
            .protocols(&a.id())
            .unwrap()
            .contains(&"/freedomnames/kad/1.0.0".to_string()));
        assert_eq!(subscription.events().len(), 1);
    }

    #[test]
    fn close_disconnects_and_ends_subscriptions() {
        let (_testnet, a, b) = pair();
        a.connect(&b.peer_info(), &CancelToken::new()).unwrap();

        let subscription = a.subscribe(&[EventKind::Other]).unwrap();

        a.close().unwrap();
        a.close().unwrap();

        assert!(b.peers().is_empty());
        assert!(subscription.events().is_disconnected());
        assert_eq!(
            b.connect(&a.peer_info(), &CancelToken::new()),
            Err(NetworkError::Unreachable(a.id()))
        );
        assert!(a.subscribe(&[EventKind::Other]).is_err());
    }
}
