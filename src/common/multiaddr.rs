//! Self describing network addresses and peer address records.

use std::{
    fmt::{self, Display, Formatter},
    net::SocketAddr,
    str::FromStr,
};

use serde::{Serialize, Serializer};
use tracing::warn;

use super::{Id, InvalidId};

const P2P_PROTOCOL: &str = "p2p";
const P2P_PROTOCOL_SEGMENT: &str = "/p2p";

/// A self describing address, e.g. `/ip4/0.0.0.0/tcp/4020`, optionally
/// ending with the `/p2p/<peer id>` of the node listening on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Multiaddr(String);

impl Multiaddr {
    /// Encapsulate this address with `/p2p/<peer id>`.
    ///
    /// Any peer id already present is replaced.
    pub fn with_peer(&self, peer: &Id) -> Multiaddr {
        Multiaddr(format!("{}/{}/{}", self.without_peer(), P2P_PROTOCOL, peer))
    }

    /// The trailing `/p2p/<peer id>` component, if any.
    pub fn peer_id(&self) -> Option<Result<Id, InvalidId>> {
        let (head, id) = self.0.rsplit_once('/')?;

        head.ends_with(P2P_PROTOCOL_SEGMENT).then(|| id.parse())
    }

    /// This address with the trailing `/p2p/<peer id>` component removed.
    pub fn without_peer(&self) -> Multiaddr {
        match self.0.rsplit_once('/') {
            Some((head, _)) if head.ends_with(P2P_PROTOCOL_SEGMENT) => {
                Multiaddr(head[..head.len() - P2P_PROTOCOL_SEGMENT.len()].to_string())
            }
            _ => self.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Multiaddr {
    type Err = InvalidAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| InvalidAddr::Malformed(s.to_string()))?;

        if rest.split('/').any(|segment| segment.is_empty()) {
            return Err(InvalidAddr::Malformed(s.to_string()));
        }

        Ok(Multiaddr(s.to_string()))
    }
}

impl Display for Multiaddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Multiaddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl From<SocketAddr> for Multiaddr {
    /// A TCP address.
    fn from(addr: SocketAddr) -> Self {
        let family = match addr {
            SocketAddr::V4(_) => "ip4",
            SocketAddr::V6(_) => "ip6",
        };

        Multiaddr(format!("/{}/{}/tcp/{}", family, addr.ip(), addr.port()))
    }
}

/// A peer id with the addresses it can be reached at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: Id,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(id: Id, addrs: Vec<Multiaddr>) -> Self {
        Self { id, addrs }
    }

    /// Split an address ending with `/p2p/<peer id>` into a [PeerInfo].
    pub fn from_p2p_addr(addr: &Multiaddr) -> Result<Self, InvalidAddr> {
        let id = addr
            .peer_id()
            .ok_or_else(|| InvalidAddr::MissingPeerId(addr.to_string()))??;

        let transport = addr.without_peer();
        let addrs = if transport.as_str().is_empty() {
            vec![]
        } else {
            vec![transport]
        };

        Ok(Self { id, addrs })
    }
}

/// Parse a list of `/p2p/` addresses, skipping the ones that can't be parsed.
pub fn peer_infos(addrs: &[String]) -> Vec<PeerInfo> {
    let mut infos: Vec<PeerInfo> = Vec::with_capacity(addrs.len());

    for addr in addrs {
        let info = addr
            .parse::<Multiaddr>()
            .and_then(|addr| PeerInfo::from_p2p_addr(&addr));

        match info {
            Ok(info) => match infos.iter_mut().find(|existing| existing.id == info.id) {
                Some(existing) => existing.addrs.extend(info.addrs),
                None => infos.push(info),
            },
            Err(error) => warn!(?addr, ?error, "Skipping invalid peer address"),
        }
    }

    infos
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors parsing a [Multiaddr] or a [PeerInfo].
pub enum InvalidAddr {
    #[error("Malformed address: {0}")]
    Malformed(String),

    #[error("Address has no /p2p/ component: {0}")]
    MissingPeerId(String),

    #[error(transparent)]
    PeerId(#[from] InvalidId),
}
