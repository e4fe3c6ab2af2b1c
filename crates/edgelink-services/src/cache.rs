//! Advertisement cache: where learned rendezvous descriptors are kept.
//!
//! Publishing is best-effort: the lease protocol ignores failures. The cache
//! is also a seeding input (`CacheSeeding`), so descriptors learned in one
//! lease survive its end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use edgelink_core::{PeerDescriptor, PeerId};

#[async_trait]
pub trait AdvertisementCache: Send + Sync {
    /// Store `descriptor` locally for `lifetime`; remote holders should
    /// drop it after `expiration`.
    async fn publish(
        &self,
        descriptor: &PeerDescriptor,
        lifetime: Duration,
        expiration: Duration,
    ) -> Result<(), CacheError>;

    /// Unexpired rendezvous descriptors.
    async fn rendezvous_descriptors(&self) -> Vec<PeerDescriptor>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache is full ({0} entries)")]
    Full(usize),

    #[error("descriptor lifetime must be positive")]
    ZeroLifetime,
}

#[derive(Debug, Clone)]
struct CachedDescriptor {
    descriptor: PeerDescriptor,
    expires_at: Instant,
}

/// In-process descriptor cache with per-entry expiry. Keyed on peer id;
/// a newer publish for the same peer replaces the older one. Nothing is
/// pushed to remote holders, so the remote expiration is not kept.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<DashMap<PeerId, CachedDescriptor>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "expired cached descriptors");
        }
        removed
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl AdvertisementCache for MemoryCache {
    async fn publish(
        &self,
        descriptor: &PeerDescriptor,
        lifetime: Duration,
        _expiration: Duration,
    ) -> Result<(), CacheError> {
        if lifetime.is_zero() {
            return Err(CacheError::ZeroLifetime);
        }
        if !self.entries.contains_key(&descriptor.peer_id) && self.entries.len() >= self.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                return Err(CacheError::Full(self.max_entries));
            }
        }

        self.entries.insert(
            descriptor.peer_id,
            CachedDescriptor {
                descriptor: descriptor.clone(),
                expires_at: Instant::now() + lifetime,
            },
        );
        tracing::trace!(peer = descriptor.peer_id.short(), "descriptor cached");
        Ok(())
    }

    async fn rendezvous_descriptors(&self) -> Vec<PeerDescriptor> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.value().expires_at > now)
            .map(|e| e.value().descriptor.clone())
            .collect()
    }
}
