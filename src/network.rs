//! The network handle: connections, peer metadata, an event bus and
//! bandwidth accounting.

use std::fmt::{self, Display, Formatter};

use flume::Receiver;
use serde::Serialize;

use crate::{
    cancel::CancelToken,
    common::{Id, Multiaddr, PeerInfo},
};

/// Peers are identified by an [Id] derived from their public key.
pub type PeerId = Id;

/// A network host bound to this node's identity.
///
/// Implementations are shared between the lifecycle manager, the local
/// discovery notifier and the observability loops, and must be internally
/// thread-safe.
pub trait NetworkHost: Send + Sync {
    fn id(&self) -> PeerId;

    /// Addresses this host listens on, without the `/p2p/` suffix.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Protocols this host handles.
    fn protocols(&self) -> Vec<String>;

    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerId>;

    fn connectedness(&self, peer: &PeerId) -> Connectedness;

    /// Dial a peer, returning once the connection is established.
    fn connect(&self, peer: &PeerInfo, cancel: &CancelToken) -> Result<(), NetworkError>;

    /// Subscribe to the given event kinds.
    ///
    /// Dropping the [Subscription] unsubscribes.
    fn subscribe(&self, kinds: &[EventKind]) -> Result<Subscription, NetworkError>;

    fn peer_store(&self) -> &dyn PeerStore;

    fn bandwidth(&self) -> BandwidthTotals;

    /// Close all connections and stop listening.
    fn close(&self) -> Result<(), NetworkError>;
}

/// Metadata the host keeps about known peers.
pub trait PeerStore: Send + Sync {
    fn peer_info(&self, peer: &PeerId) -> PeerInfo;

    fn protocols(&self, peer: &PeerId) -> Result<Vec<String>, NetworkError>;

    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Forget everything known about a peer.
    fn remove_peer(&self, peer: &PeerId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Connectedness {
    NotConnected,
    Connected,
    /// Connected through a relay with limited resources.
    Limited,
}

impl Display for Connectedness {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Connectedness::NotConnected => "NotConnected",
            Connectedness::Connected => "Connected",
            Connectedness::Limited => "Limited",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reachability {
    Unknown,
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NatDeviceType {
    Unknown,
    /// Endpoint independent mapping, hole punching works.
    Cone,
    /// Endpoint dependent mapping, hole punching does not work.
    Symmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

/// Connectivity and identification events published by a [NetworkHost].
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    LocalProtocolsUpdated {
        added: Vec<String>,
        removed: Vec<String>,
    },
    LocalAddressesUpdated {
        current: Vec<Multiaddr>,
        removed: Vec<Multiaddr>,
    },
    LocalReachabilityChanged {
        reachability: Reachability,
    },
    NatDeviceTypeChanged {
        device_type: NatDeviceType,
        transport: TransportProtocol,
    },
    PeerProtocolsUpdated {
        peer: PeerId,
        added: Vec<String>,
        removed: Vec<String>,
    },
    PeerIdentificationCompleted {
        peer: PeerId,
    },
    PeerIdentificationFailed {
        peer: PeerId,
        reason: String,
    },
    PeerConnectednessChanged {
        peer: PeerId,
        connectedness: Connectedness,
    },
    /// Any event kind this crate doesn't recognize.
    Other {
        kind: String,
        detail: String,
    },
}

impl NetworkEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NetworkEvent::LocalProtocolsUpdated { .. } => EventKind::LocalProtocolsUpdated,
            NetworkEvent::LocalAddressesUpdated { .. } => EventKind::LocalAddressesUpdated,
            NetworkEvent::LocalReachabilityChanged { .. } => EventKind::LocalReachabilityChanged,
            NetworkEvent::NatDeviceTypeChanged { .. } => EventKind::NatDeviceTypeChanged,
            NetworkEvent::PeerProtocolsUpdated { .. } => EventKind::PeerProtocolsUpdated,
            NetworkEvent::PeerIdentificationCompleted { .. } => {
                EventKind::PeerIdentificationCompleted
            }
            NetworkEvent::PeerIdentificationFailed { .. } => EventKind::PeerIdentificationFailed,
            NetworkEvent::PeerConnectednessChanged { .. } => EventKind::PeerConnectednessChanged,
            NetworkEvent::Other { .. } => EventKind::Other,
        }
    }
}

/// The discriminant of a [NetworkEvent], used to pick subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LocalProtocolsUpdated,
    LocalAddressesUpdated,
    LocalReachabilityChanged,
    NatDeviceTypeChanged,
    PeerProtocolsUpdated,
    PeerIdentificationCompleted,
    PeerIdentificationFailed,
    PeerConnectednessChanged,
    Other,
}

/// A stream of [NetworkEvent]s, closed when the host closes or the
/// subscription is dropped.
#[derive(Debug)]
pub struct Subscription {
    events: Receiver<NetworkEvent>,
}

impl Subscription {
    pub fn new(events: Receiver<NetworkEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &Receiver<NetworkEvent> {
        &self.events
    }

    /// Unsubscribe.
    pub fn close(self) {
        drop(self.events);
    }
}

/// Cumulative traffic and average rates, in bytes and bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BandwidthTotals {
    pub total_in: u64,
    pub total_out: u64,
    pub rate_in: f64,
    pub rate_out: f64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Network host errors.
pub enum NetworkError {
    #[error("Network host is closed")]
    Closed,

    #[error("Peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("Dial was cancelled")]
    Cancelled,

    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_kinds() {
        let peer = Id::random();

        assert_eq!(
            NetworkEvent::PeerConnectednessChanged {
                peer,
                connectedness: Connectedness::NotConnected
            }
            .kind(),
            EventKind::PeerConnectednessChanged
        );
        assert_eq!(
            NetworkEvent::Other {
                kind: "EvtAutoRelayAddrsUpdated".to_string(),
                detail: String::new()
            }
            .kind(),
            EventKind::Other
        );
    }

    #[test]
    fn connectedness_display() {
        assert_eq!(Connectedness::NotConnected.to_string(), "NotConnected");
    }
}
