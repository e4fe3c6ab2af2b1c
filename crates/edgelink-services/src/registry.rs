//! Connection registry: the table of rendezvous peers we hold leases with.
//!
//! The whole table sits behind one mutex. Entries are small and every
//! operation is a map lookup or a field update, so there is no per-entry
//! locking. Never call into the network while holding the lock: take a
//! `snapshot()` and work on the `Arc<Connection>`s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use edgelink_core::{PeerDescriptor, PeerId};

/// Lease bookkeeping for one connection.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    /// Descriptor from the most recent accepted reply.
    pub descriptor: PeerDescriptor,
    /// The lease is invalid at and after this instant.
    pub lease_end: Instant,
    /// Issue a renewal at or after this instant. Always `<= lease_end`.
    pub renew_at: Instant,
    /// False once a disconnect was observed.
    pub connected: bool,
}

/// One lease with a remote rendezvous peer.
///
/// Updated in place on renewal so that holders of the `Arc` observe the new
/// lease without re-fetching it from the registry.
#[derive(Debug)]
pub struct Connection {
    peer_id: PeerId,
    lease: RwLock<LeaseInfo>,
}

impl Connection {
    fn new(peer_id: PeerId, descriptor: PeerDescriptor, lease: Duration, margin: Duration, now: Instant) -> Self {
        let (lease_end, renew_at) = lease_window(now, lease, margin);
        Self {
            peer_id,
            lease: RwLock::new(LeaseInfo {
                descriptor,
                lease_end,
                renew_at,
                connected: true,
            }),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Copy of the current lease fields.
    pub fn info(&self) -> LeaseInfo {
        self.read().clone()
    }

    pub fn descriptor(&self) -> PeerDescriptor {
        self.read().descriptor.clone()
    }

    pub fn lease_end(&self) -> Instant {
        self.read().lease_end
    }

    pub fn renew_at(&self) -> Instant {
        self.read().renew_at
    }

    pub fn is_connected(&self) -> bool {
        self.read().connected
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.read().lease_end
    }

    pub fn needs_renewal(&self, now: Instant) -> bool {
        now >= self.read().renew_at
    }

    /// Time left on the lease, zero once expired.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.read().lease_end.saturating_duration_since(now)
    }

    /// Shorten the lease to at most `delay` from now. Never extends it.
    pub fn shrink_lease(&self, delay: Duration, now: Instant) {
        let mut info = self.write();
        info.lease_end = info.lease_end.min(now + delay);
        info.renew_at = info.renew_at.min(info.lease_end);
    }

    pub fn mark_disconnected(&self) {
        self.write().connected = false;
    }

    fn renew(&self, descriptor: PeerDescriptor, lease: Duration, margin: Duration, now: Instant) {
        let (lease_end, renew_at) = lease_window(now, lease, margin);
        let mut info = self.write();
        info.descriptor = descriptor;
        info.lease_end = lease_end;
        info.renew_at = renew_at;
        info.connected = true;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LeaseInfo> {
        self.lease.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LeaseInfo> {
        self.lease.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `(lease_end, renew_at)` for a lease granted at `now`.
///
/// The renewal margin is capped at half the lease so that short leases are
/// not renewed immediately.
pub fn lease_window(now: Instant, lease: Duration, margin: Duration) -> (Instant, Instant) {
    let lease_end = now + lease;
    let renew_at = lease_end - margin.min(lease / 2);
    (lease_end, renew_at)
}

/// The connection table, shared by the lease protocol, bootstrap,
/// monitor, and propagation.
#[derive(Debug)]
pub struct ConnectionRegistry {
    max_connections: usize,
    lease_margin: Duration,
    table: Mutex<HashMap<PeerId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, lease_margin: Duration) -> Self {
        Self {
            max_connections,
            lease_margin,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Install or renew a lease.
    ///
    /// Returns the connection and whether it is new. A new peer is only
    /// admitted while the table is below `max_connections`; otherwise the
    /// table is untouched and `None` is returned. The capacity check and the
    /// insert happen under one lock.
    pub fn upsert(
        &self,
        peer_id: PeerId,
        descriptor: PeerDescriptor,
        lease: Duration,
    ) -> Option<(Arc<Connection>, bool)> {
        let now = Instant::now();
        let mut table = self.lock();

        if let Some(existing) = table.get(&peer_id) {
            existing.renew(descriptor, lease, self.lease_margin, now);
            return Some((existing.clone(), false));
        }

        if table.len() >= self.max_connections {
            return None;
        }

        let conn = Arc::new(Connection::new(peer_id, descriptor, lease, self.lease_margin, now));
        table.insert(peer_id, conn.clone());
        Some((conn, true))
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<Connection>> {
        self.lock().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.lock().contains_key(peer_id)
    }

    pub fn remove(&self, peer_id: &PeerId) -> Option<Arc<Connection>> {
        self.lock().remove(peer_id)
    }

    /// Remove `peer_id` only if `pred` still holds for its entry.
    ///
    /// Used by expiry: a renewal may land between the snapshot and the
    /// removal, and must win.
    pub fn remove_if(
        &self,
        peer_id: &PeerId,
        pred: impl FnOnce(&Connection) -> bool,
    ) -> Option<Arc<Connection>> {
        let mut table = self.lock();
        match table.get(peer_id) {
            Some(conn) if pred(conn) => table.remove(peer_id),
            _ => None,
        }
    }

    /// All current connections, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.lock().keys().copied().collect()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.size() < self.max_connections
    }

    /// Empty the table, returning what was in it.
    pub fn clear(&self) -> Vec<Arc<Connection>> {
        self.lock().drain().map(|(_, conn)| conn).collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Arc<Connection>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
