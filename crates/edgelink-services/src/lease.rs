//! Lease protocol: requests, replies, renewals, and removals.
//!
//! Per rendezvous peer:
//!
//!   Unconnected ─request─▶ AwaitingReply ─accepted reply─▶ Connected
//!   Connected ─now ≥ renew_at─▶ Renewing ─accepted reply─▶ Connected
//!   Connected | Renewing ─now ≥ lease_end─▶ (removed, Failed)
//!   any ─disconnect notice / challenge(≤0)─▶ Unconnected
//!
//! Malformed or unacceptable replies are dropped and never tear down an
//! existing lease. Nothing here returns an error to steady-state callers
//! except the transport result of a single send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::time::Instant;

use edgelink_core::wire::{ControlMessage, DisconnectNotice, LeaseReply, LeaseRequest};
use edgelink_core::{MembershipEvent, Message, PeerDescriptor, PeerId};

use crate::cache::AdvertisementCache;
use crate::events::EventSink;
use crate::registry::{Connection, ConnectionRegistry};
use crate::seeding::{SeedCandidate, SeedingSource};
use crate::transport::{Destination, Transport, TransportError};

/// Where a peer stands in the lease lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unconnected,
    AwaitingReply,
    Connected,
    Renewing,
}

/// What `handle_reply` did with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// New lease installed.
    Connected,
    /// Existing lease renewed in place.
    Reconnected,
    /// Non-positive lease removed an existing connection.
    Revoked,
    /// New peer while the registry is full. Accepted but ignored.
    AtCapacity,
    /// Protocol violation or nothing to act on; registry untouched.
    Rejected,
}

pub struct LeaseProtocol {
    local: PeerDescriptor,
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    seeding: Arc<dyn SeedingSource>,
    cache: Arc<dyn AdvertisementCache>,
    events: Arc<dyn EventSink>,
    /// Outstanding lease requests and when they were sent.
    pending: DashMap<Destination, Instant>,
    cache_lifetime: Duration,
    cache_expiration: Duration,
    stopped: AtomicBool,
}

impl LeaseProtocol {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: PeerDescriptor,
        registry: Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        seeding: Arc<dyn SeedingSource>,
        cache: Arc<dyn AdvertisementCache>,
        events: Arc<dyn EventSink>,
        cache_lifetime: Duration,
        cache_expiration: Duration,
    ) -> Self {
        Self {
            local,
            registry,
            transport,
            seeding,
            cache,
            events,
            pending: DashMap::new(),
            cache_lifetime,
            cache_expiration,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local.peer_id
    }

    /// Refuse all further requests and replies. Set before the final
    /// `disconnect_all` so nothing is installed behind it.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Send a lease request carrying our descriptor. Also used for renewal:
    /// the rendezvous treats a repeat request as a renewal.
    pub async fn request_lease(&self, dest: &Destination) -> Result<(), TransportError> {
        if self.is_stopped() {
            return Err(TransportError::Closed);
        }
        let msg = ControlMessage::LeaseRequest(LeaseRequest {
            descriptor: self.local.clone(),
        })
        .to_message()
        .map_err(|e| TransportError::Encode(e.to_string()))?;

        self.pending.insert(dest.clone(), Instant::now());
        match self.transport.send(dest, msg).await {
            Ok(()) => {
                tracing::debug!(%dest, "lease request sent");
                Ok(())
            }
            Err(e) => {
                self.pending.remove(dest);
                tracing::warn!(%dest, error = %e, "lease request failed");
                Err(e)
            }
        }
    }

    /// Lease request to a bootstrap candidate. Candidates with a declared
    /// peer id go out by id so the transport can pick the path.
    pub async fn request_seed(&self, candidate: &SeedCandidate) -> Result<(), TransportError> {
        if let Some(hint) = candidate.route_hint() {
            self.transport.learn_route(&hint);
        }
        self.request_lease(&candidate.destination()).await
    }

    pub async fn renew(&self, conn: &Connection) -> Result<(), TransportError> {
        tracing::debug!(peer = conn.peer_id().short(), "renewing lease");
        self.request_lease(&Destination::Peer(*conn.peer_id())).await
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Handle an inbound message. Returns false if it carries no lease
    /// control element and belongs to someone else.
    pub async fn handle_message(&self, msg: &Message, from: Option<&Destination>) -> bool {
        match ControlMessage::parse(msg) {
            Ok(None) => false,
            Ok(Some(ControlMessage::LeaseReply(reply))) => {
                self.handle_reply(reply, from).await;
                true
            }
            Ok(Some(ControlMessage::Disconnect(notice))) => {
                self.handle_disconnect_notice(&notice.peer_id);
                true
            }
            Ok(Some(ControlMessage::LeaseRequest(req))) => {
                tracing::debug!(
                    peer = req.descriptor.peer_id.short(),
                    "ignoring lease request, edge peers do not grant leases"
                );
                true
            }
            Err(e) => {
                tracing::warn!(from = ?from, error = %e, "dropping malformed control message");
                true
            }
        }
    }

    pub async fn handle_reply(&self, reply: LeaseReply, from: Option<&Destination>) -> ReplyOutcome {
        let peer_id = reply.peer_id;
        self.pending.remove(&Destination::Peer(peer_id));
        if let Some(from) = from {
            self.pending.remove(from);
        }
        if self.is_stopped() {
            tracing::debug!(peer = peer_id.short(), "lease reply after shutdown, ignoring");
            return ReplyOutcome::Rejected;
        }

        let Some(lease) = reply.lease() else {
            return match self.registry.remove(&peer_id) {
                Some(conn) => {
                    conn.mark_disconnected();
                    tracing::info!(peer = peer_id.short(), lease_ms = reply.lease_ms, "lease revoked");
                    self.events.emit(MembershipEvent::Failed(peer_id));
                    ReplyOutcome::Revoked
                }
                None => {
                    tracing::debug!(peer = peer_id.short(), "non-positive lease from unknown peer");
                    ReplyOutcome::Rejected
                }
            };
        };

        let descriptor = match (reply.descriptor, self.registry.get(&peer_id)) {
            (Some(d), _) if d.peer_id != peer_id => {
                tracing::warn!(
                    peer = peer_id.short(),
                    descriptor_peer = d.peer_id.short(),
                    "lease reply descriptor names another peer"
                );
                return ReplyOutcome::Rejected;
            }
            (Some(d), _) if !self.seeding.is_acceptable_peer(&d) => {
                tracing::warn!(peer = peer_id.short(), "rendezvous not acceptable, discarding reply");
                return ReplyOutcome::Rejected;
            }
            (Some(d), _) => d,
            (None, Some(conn)) => conn.descriptor(),
            (None, None) => {
                tracing::warn!(peer = peer_id.short(), "first lease reply without descriptor");
                return ReplyOutcome::Rejected;
            }
        };

        let Some((conn, is_new)) = self.registry.upsert(peer_id, descriptor.clone(), lease) else {
            tracing::debug!(
                peer = peer_id.short(),
                max = self.registry.max_connections(),
                "registry full, ignoring lease"
            );
            return ReplyOutcome::AtCapacity;
        };

        // Lost a race with shutdown: undo the install, stay silent.
        if self.is_stopped() {
            if is_new {
                self.registry.remove(&peer_id);
            }
            return ReplyOutcome::Rejected;
        }

        self.transport.learn_route(&descriptor.route_hint());
        self.publish(&descriptor).await;

        if is_new {
            tracing::info!(
                peer = peer_id.short(),
                lease_ms = lease.as_millis() as u64,
                connections = self.registry.size(),
                "rendezvous lease installed"
            );
            self.events.emit(MembershipEvent::Connected(peer_id));
            ReplyOutcome::Connected
        } else {
            tracing::debug!(
                peer = peer_id.short(),
                lease_ms = lease.as_millis() as u64,
                connected = conn.is_connected(),
                "rendezvous lease renewed"
            );
            self.events.emit(MembershipEvent::Reconnected(peer_id));
            ReplyOutcome::Reconnected
        }
    }

    /// The rendezvous ended the lease.
    pub fn handle_disconnect_notice(&self, peer_id: &PeerId) -> bool {
        match self.registry.remove(peer_id) {
            Some(conn) => {
                conn.mark_disconnected();
                tracing::info!(peer = peer_id.short(), "rendezvous disconnected us");
                self.events.emit(MembershipEvent::Disconnected(*peer_id));
                true
            }
            None => {
                tracing::debug!(peer = peer_id.short(), "disconnect notice for unknown peer");
                false
            }
        }
    }

    // ── Caller-initiated ──────────────────────────────────────────────────────

    /// Graceful removal: drop the lease and tell the rendezvous.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        let Some(conn) = self.registry.remove(peer_id) else {
            return false;
        };
        conn.mark_disconnected();
        tracing::info!(peer = peer_id.short(), "disconnecting from rendezvous");
        self.send_disconnect_notice(peer_id).await;
        self.events.emit(MembershipEvent::Disconnected(*peer_id));
        true
    }

    /// Challenge a rendezvous we suspect is gone. A non-positive delay
    /// removes it now; a positive delay caps the remaining lease so the
    /// monitor removes it unless a renewal lands first.
    pub fn challenge(&self, peer_id: &PeerId, delay_ms: i64) -> bool {
        if delay_ms <= 0 {
            let Some(conn) = self.registry.remove(peer_id) else {
                return false;
            };
            conn.mark_disconnected();
            tracing::info!(peer = peer_id.short(), "challenged rendezvous removed");
            self.events.emit(MembershipEvent::Failed(*peer_id));
            return true;
        }

        let Some(conn) = self.registry.get(peer_id) else {
            return false;
        };
        conn.shrink_lease(Duration::from_millis(delay_ms as u64), Instant::now());
        tracing::debug!(peer = peer_id.short(), delay_ms, "rendezvous lease shortened by challenge");
        true
    }

    // ── Monitor hooks ─────────────────────────────────────────────────────────

    /// Remove `conn` if it is still disconnected or expired at `now`.
    /// Returns false if a renewal landed in the meantime.
    pub fn expire(&self, conn: &Connection, now: Instant) -> bool {
        let removed = self
            .registry
            .remove_if(conn.peer_id(), |c| !c.is_connected() || c.is_expired(now));
        match removed {
            Some(conn) => {
                conn.mark_disconnected();
                tracing::info!(peer = conn.peer_id().short(), "rendezvous lease expired");
                self.events.emit(MembershipEvent::Failed(*conn.peer_id()));
                true
            }
            None => false,
        }
    }

    /// Forget lease requests that went unanswered for `timeout`.
    pub fn prune_pending(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) < timeout);
        before - self.pending.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn state_of(&self, peer_id: &PeerId) -> LeaseState {
        match self.registry.get(peer_id) {
            Some(conn) if conn.is_connected() => {
                if conn.needs_renewal(Instant::now()) {
                    LeaseState::Renewing
                } else {
                    LeaseState::Connected
                }
            }
            _ if self.pending.contains_key(&Destination::Peer(*peer_id)) => LeaseState::AwaitingReply,
            _ => LeaseState::Unconnected,
        }
    }

    /// Drop every lease and notify each rendezvous. Used by shutdown.
    pub async fn disconnect_all(&self) -> usize {
        let removed = self.registry.clear();
        self.pending.clear();

        let notices = removed.iter().map(|conn| {
            conn.mark_disconnected();
            self.send_disconnect_notice(conn.peer_id())
        });
        join_all(notices).await;

        for conn in &removed {
            self.events.emit(MembershipEvent::Disconnected(*conn.peer_id()));
        }
        removed.len()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn send_disconnect_notice(&self, peer_id: &PeerId) {
        let msg = match ControlMessage::Disconnect(DisconnectNotice {
            peer_id: self.local.peer_id,
        })
        .to_message()
        {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode disconnect notice");
                return;
            }
        };
        if let Err(e) = self.transport.send(&Destination::Peer(*peer_id), msg).await {
            tracing::debug!(peer = peer_id.short(), error = %e, "disconnect notice not delivered");
        }
    }

    /// Best-effort: the cache is an optimization.
    async fn publish(&self, descriptor: &PeerDescriptor) {
        if let Err(e) = self
            .cache
            .publish(descriptor, self.cache_lifetime, self.cache_expiration)
            .await
        {
            tracing::debug!(peer = descriptor.peer_id.short(), error = %e, "descriptor not cached");
        }
    }
}
