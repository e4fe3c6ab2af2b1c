//! Propagation engine: TTL-bounded fan-out over the live leases.
//!
//! Stateless: the recipient set is read from the registry on every call.
//! Each recipient gets its own clone of the message with its own header.
//! Unreachable recipients are logged and skipped; no call here fails.

use std::sync::Arc;

use futures::future::join_all;

use edgelink_core::header::{HeaderError, PropagationHeader};
use edgelink_core::{Message, PeerId};

use crate::registry::ConnectionRegistry;
use crate::transport::{Destination, Transport};

pub struct PropagationEngine {
    local: PeerId,
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    max_ttl: u32,
}

impl PropagationEngine {
    pub fn new(local: PeerId, registry: Arc<ConnectionRegistry>, transport: Arc<dyn Transport>, max_ttl: u32) -> Self {
        Self {
            local,
            registry,
            transport,
            max_ttl,
        }
    }

    /// Send to every leased rendezvous and into the wider group.
    /// Returns the number of lease connections reached.
    pub async fn propagate(&self, msg: &Message, service: &str, param: &str, ttl: u32) -> usize {
        let Some(header) = self.header_for(msg, service, param, ttl) else {
            return 0;
        };
        let reached = self.fan_out(msg, &header, self.registry.peer_ids()).await;
        self.send_to_group(msg, &header).await;
        reached
    }

    /// Send to every leased rendezvous only.
    pub async fn propagate_in_group(&self, msg: &Message, service: &str, param: &str, ttl: u32) -> usize {
        let Some(header) = self.header_for(msg, service, param, ttl) else {
            return 0;
        };
        self.fan_out(msg, &header, self.registry.peer_ids()).await
    }

    /// Only the transport's broader distribution path. Returns whether it
    /// accepted the message.
    pub async fn propagate_to_neighbors(&self, msg: &Message, service: &str, param: &str, ttl: u32) -> bool {
        match self.header_for(msg, service, param, ttl) {
            Some(header) => self.send_to_group(msg, &header).await,
            None => false,
        }
    }

    /// Directed forwarding. On an edge peer every walk goes through the
    /// leased rendezvous.
    pub async fn walk(&self, msg: &Message, service: &str, param: &str, ttl: u32) -> usize {
        self.propagate_in_group(msg, service, param, ttl).await
    }

    /// Multi-destination walk. The destinations are advisory; the message
    /// still leaves through the leased rendezvous.
    pub async fn walk_to(&self, dest_peers: &[PeerId], msg: &Message, service: &str, param: &str, ttl: u32) -> usize {
        tracing::trace!(destinations = dest_peers.len(), "walk to destinations");
        self.propagate_in_group(msg, service, param, ttl).await
    }

    fn header_for(&self, msg: &Message, service: &str, param: &str, ttl: u32) -> Option<PropagationHeader> {
        match PropagationHeader::outbound(msg, &self.local, service, param, ttl, self.max_ttl) {
            Ok(Some(header)) => Some(header),
            Ok(None) => {
                tracing::trace!(service, param, "hop budget spent, not propagating");
                None
            }
            Err(e @ HeaderError::Loop(_)) => {
                tracing::warn!(error = %e, "propagation loop, dropping");
                None
            }
            Err(e) => {
                tracing::warn!(service, param, error = %e, "cannot build propagation header");
                None
            }
        }
    }

    /// Concurrent unicast to `peers`, skipping any already on the header's
    /// path. Returns how many sends succeeded.
    async fn fan_out(&self, msg: &Message, header: &PropagationHeader, peers: Vec<PeerId>) -> usize {
        let sends = peers
            .into_iter()
            .filter(|peer| !header.has_visited(peer))
            .filter_map(|peer| {
                let mut copy = msg.clone();
                if let Err(e) = header.attach(&mut copy) {
                    tracing::warn!(error = %e, "failed to attach propagation header");
                    return None;
                }
                Some(async move {
                    let dest = Destination::Peer(peer);
                    match self.transport.send(&dest, copy).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::debug!(peer = peer.short(), error = %e, "propagation send failed");
                            false
                        }
                    }
                })
            });

        let reached = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        tracing::trace!(msg_id = %header.msg_id, ttl = header.ttl, reached, "propagated to leases");
        reached
    }

    async fn send_to_group(&self, msg: &Message, header: &PropagationHeader) -> bool {
        let mut copy = msg.clone();
        if let Err(e) = header.attach(&mut copy) {
            tracing::warn!(error = %e, "failed to attach propagation header");
            return false;
        }
        match self.transport.propagate(copy).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(msg_id = %header.msg_id, error = %e, "group propagation failed");
                false
            }
        }
    }
}
