//! Network event listener.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use flume::Selector;
use tracing::{debug, info, warn};

use crate::{
    cancel::CancelToken,
    network::{Connectedness, EventKind, NetworkEvent, NetworkHost, Subscription},
};

/// Every event kind the listener reports on.
pub const SUBSCRIBED_EVENTS: [EventKind; 8] = [
    EventKind::LocalProtocolsUpdated,
    EventKind::LocalAddressesUpdated,
    EventKind::LocalReachabilityChanged,
    EventKind::NatDeviceTypeChanged,
    EventKind::PeerProtocolsUpdated,
    EventKind::PeerIdentificationCompleted,
    EventKind::PeerIdentificationFailed,
    EventKind::PeerConnectednessChanged,
];

enum Step {
    Event(NetworkEvent),
    Stop,
}

/// Handle events until `cancel` is cancelled or the subscription closes.
///
/// Each event is handled on its own thread so a slow peer store lookup
/// doesn't hold up the rest of the stream. Handlers still running when the
/// listener stops are joined before it returns.
pub(crate) fn run(host: Arc<dyn NetworkHost>, subscription: Subscription, cancel: CancelToken) {
    let mut handlers: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let step = Selector::new()
            .recv(subscription.events(), |event| match event {
                Ok(event) => Step::Event(event),
                Err(_) => Step::Stop,
            })
            .recv(cancel.done(), |_| Step::Stop)
            .wait();

        let event = match step {
            Step::Event(event) => event,
            Step::Stop => break,
        };

        let spawned = {
            let host = host.clone();
            let event = event.clone();

            thread::Builder::new()
                .name("freedomnames-event".to_string())
                .spawn(move || dispatch(host.as_ref(), event))
        };

        handlers.retain(|handler| !handler.is_finished());

        match spawned {
            Ok(handler) => handlers.push(handler),
            Err(error) => {
                debug!(?error, "Handling network event inline");
                dispatch(host.as_ref(), event);
            }
        }
    }

    subscription.close();

    for handler in handlers {
        if handler.join().is_err() {
            warn!("Network event handler panicked");
        }
    }

    info!("Stopping event listener");
}

/// Log an event, and forget peers once they disconnect.
pub(crate) fn dispatch(host: &dyn NetworkHost, event: NetworkEvent) {
    match event {
        NetworkEvent::LocalProtocolsUpdated { added, removed } => {
            info!(?added, ?removed, "Local protocols updated");
        }
        NetworkEvent::LocalAddressesUpdated { current, removed } => {
            let peer_id = host.id();
            let current: Vec<String> = current
                .iter()
                .map(|addr| addr.with_peer(&peer_id).to_string())
                .collect();

            info!(?current, ?removed, "Local addresses updated");
        }
        NetworkEvent::LocalReachabilityChanged { reachability } => {
            info!(?reachability, "Local reachability changed");
        }
        NetworkEvent::NatDeviceTypeChanged {
            device_type,
            transport,
        } => {
            info!(?device_type, ?transport, "NAT device type changed");
        }
        NetworkEvent::PeerProtocolsUpdated {
            peer,
            added,
            removed,
        } => {
            info!(%peer, ?added, ?removed, "Peer protocols updated");
        }
        NetworkEvent::PeerIdentificationCompleted { peer } => {
            info!(%peer, "Peer identification completed");
        }
        NetworkEvent::PeerIdentificationFailed { peer, reason } => {
            warn!(%peer, %reason, "Peer identification failed");
        }
        NetworkEvent::PeerConnectednessChanged {
            peer,
            connectedness,
        } => {
            let peer_store = host.peer_store();

            let info = peer_store.peer_info(&peer);
            let addrs = peer_store.addrs(&peer);
            let protocols = match peer_store.protocols(&peer) {
                Ok(protocols) => protocols,
                Err(error) => {
                    debug!(%peer, ?error, "No protocols known for peer");
                    vec![]
                }
            };

            info!(
                %peer,
                %connectedness,
                info_addrs = ?info.addrs,
                ?addrs,
                ?protocols,
                "Peer connectedness changed"
            );

            if connectedness == Connectedness::NotConnected {
                peer_store.remove_peer(&peer);
                debug!(%peer, "Removed disconnected peer from the peer store");
            }
        }
        NetworkEvent::Other { kind, detail } => {
            debug!(%kind, %detail, "Unhandled network event");
        }
    }
}
