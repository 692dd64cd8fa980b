//! In-process local discovery: every host registered under the same service
//! name finds every other one.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use tracing::trace;

use crate::{
    common::PeerInfo,
    discovery::{DiscoveryService, PeerFoundHandler},
    network::{NetworkError, PeerId},
};

use super::{lock, Registry};

#[derive(Clone)]
pub(crate) struct Member {
    info: PeerInfo,
    handler: Arc<dyn PeerFoundHandler>,
}

/// A [DiscoveryService] announcing one host to the other members of its
/// service.
pub struct MemoryDiscovery {
    service: String,
    peer: PeerId,
    registry: Weak<Registry>,
    closed: AtomicBool,
}

impl MemoryDiscovery {
    /// Register `info` under `service` and introduce it to the existing
    /// members, and them to it.
    pub(crate) fn start(
        registry: &Arc<Registry>,
        service: &str,
        info: PeerInfo,
        handler: Arc<dyn PeerFoundHandler>,
    ) -> Self {
        let peer = info.id;

        let existing = {
            let mut services = lock(&registry.services);
            let members = services.entry(service.to_string()).or_default();

            members.retain(|member| member.info.id != peer);
            let existing = members.clone();
            members.push(Member {
                info: info.clone(),
                handler: handler.clone(),
            });

            existing
        };

        for member in existing {
            trace!(%service, local = %peer, remote = %member.info.id, "Local peer found");

            handler.handle_peer_found(member.info.clone());
            member.handler.handle_peer_found(info.clone());
        }

        Self {
            service: service.to_string(),
            peer,
            registry: Arc::downgrade(registry),
            closed: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl DiscoveryService for MemoryDiscovery {
    fn close(&self) -> Result<(), NetworkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(registry) = self.registry.upgrade() {
            if let Some(members) = lock(&registry.services).get_mut(&self.service) {
                members.retain(|member| member.info.id != self.peer);
            }
        }

        Ok(())
    }
}
