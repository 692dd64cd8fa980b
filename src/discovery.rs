//! Same-subnet peer discovery.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
    cancel::CancelToken,
    common::PeerInfo,
    network::{Connectedness, NetworkError, NetworkHost},
};

/// Receives peers found by a local discovery service.
pub trait PeerFoundHandler: Send + Sync {
    fn handle_peer_found(&self, peer: PeerInfo);
}

/// A running local discovery service.
pub trait DiscoveryService: Send + Sync {
    /// Stop announcing this node and stop reporting peers.
    fn close(&self) -> Result<(), NetworkError>;
}

/// Asks the network host to connect to every locally discovered peer it
/// isn't connected to yet.
pub struct DiscoveryNotifee {
    host: Arc<dyn NetworkHost>,
    cancel: CancelToken,
    dial_timeout: Duration,
}

impl DiscoveryNotifee {
    /// Dials are bounded by `dial_timeout` and abandoned once `cancel` is
    /// cancelled.
    pub fn new(host: Arc<dyn NetworkHost>, cancel: CancelToken, dial_timeout: Duration) -> Self {
        Self {
            host,
            cancel,
            dial_timeout,
        }
    }
}

impl PeerFoundHandler for DiscoveryNotifee {
    fn handle_peer_found(&self, peer: PeerInfo) {
        if peer.id == self.host.id()
            || self.host.connectedness(&peer.id) != Connectedness::NotConnected
        {
            return;
        }

        debug!(peer = %peer.id, "Discovered local peer");

        let cancel = self.cancel.child_with_timeout(self.dial_timeout);

        if let Err(error) = self.host.connect(&peer, &cancel) {
            warn!(peer = %peer.id, ?error, "Error connecting to discovered peer");
        }
    }
}
