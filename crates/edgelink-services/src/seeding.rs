//! Seeding: where bootstrap candidates come from.
//!
//! Two sources, picked by config at startup:
//! - `UriSeeding`:   configured seed URIs plus seeds pushed by callers.
//! - `CacheSeeding`: rendezvous descriptors remembered in the advertisement
//!                   cache first, then the `UriSeeding` list.
//!
//! Seed URIs are `scheme://authority` or `<peer-id-hex>@scheme://authority`.
//! Invalid URIs in config fail construction; nothing is retried later.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use edgelink_core::config::{RendezvousConfig, SeedingKind};
use edgelink_core::{PeerDescriptor, PeerId, RouteHint};

use crate::cache::AdvertisementCache;
use crate::transport::Destination;

/// A bootstrap candidate: an address, optionally with the peer id expected
/// behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedCandidate {
    pub address: String,
    pub peer_id: Option<PeerId>,
    pub route: Option<RouteHint>,
}

impl SeedCandidate {
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            peer_id: None,
            route: None,
        }
    }

    /// Candidate for a peer whose route we already know. The first route
    /// address (if any) doubles as the raw address.
    pub fn from_route(route: RouteHint) -> Self {
        Self {
            address: route.addresses.first().cloned().unwrap_or_default(),
            peer_id: Some(route.peer_id),
            route: Some(route),
        }
    }

    /// Parse `scheme://authority` or `<peer-hex>@scheme://authority`.
    pub fn parse(uri: &str) -> Result<Self, SeedingError> {
        let uri = uri.trim();
        let (peer_id, address) = match uri.split_once('@') {
            Some((id, rest)) if !id.contains("://") => {
                let id = id
                    .parse::<PeerId>()
                    .map_err(|_| SeedingError::InvalidSeed(uri.to_string()))?;
                (Some(id), rest)
            }
            _ => (None, uri),
        };

        match address.split_once("://") {
            Some((scheme, authority))
                if !scheme.is_empty()
                    && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
                    && !authority.is_empty() => {}
            _ => return Err(SeedingError::InvalidSeed(uri.to_string())),
        }

        Ok(Self {
            address: address.to_string(),
            peer_id,
            route: None,
        })
    }

    /// Unicast target: the logical peer when known, else the raw address.
    pub fn destination(&self) -> Destination {
        match self.peer_id {
            Some(id) => Destination::Peer(id),
            None => Destination::Address(self.address.clone()),
        }
    }

    /// Route to hand the transport before sending by peer id.
    pub fn route_hint(&self) -> Option<RouteHint> {
        let peer_id = self.peer_id?;
        Some(self.route.clone().unwrap_or_else(|| RouteHint {
            peer_id,
            addresses: if self.address.is_empty() {
                Vec::new()
            } else {
                vec![self.address.clone()]
            },
        }))
    }
}

#[async_trait]
pub trait SeedingSource: Send + Sync {
    /// Current candidates. May probe the network.
    async fn active_seed_routes(&self) -> Vec<SeedCandidate>;

    /// Whether a rendezvous with this descriptor may be leased from.
    fn is_acceptable_peer(&self, descriptor: &PeerDescriptor) -> bool;

    fn add_seed_route(&self, route: RouteHint);

    fn add_seed_address(&self, address: &str);

    /// Stop producing candidates.
    fn stop(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeedingError {
    #[error("invalid seed URI: {0:?}")]
    InvalidSeed(String),
}

// ── UriSeeding ────────────────────────────────────────────────────────────────

pub struct UriSeeding {
    configured: Vec<SeedCandidate>,
    pushed: Mutex<Vec<SeedCandidate>>,
    use_only_seeds: bool,
    stopped: AtomicBool,
}

impl UriSeeding {
    pub fn from_uris<S: AsRef<str>>(uris: &[S], use_only_seeds: bool) -> Result<Self, SeedingError> {
        let configured = uris
            .iter()
            .map(|u| SeedCandidate::parse(u.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            configured,
            pushed: Mutex::new(Vec::new()),
            use_only_seeds,
            stopped: AtomicBool::new(false),
        })
    }

    fn push(&self, candidate: SeedCandidate) {
        let mut pushed = self.pushed.lock().unwrap_or_else(PoisonError::into_inner);
        if !pushed.contains(&candidate) && !self.configured.contains(&candidate) {
            pushed.push(candidate);
        }
    }

    fn all(&self) -> Vec<SeedCandidate> {
        let pushed = self.pushed.lock().unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        self.configured
            .iter()
            .chain(pushed.iter())
            .filter(|c| seen.insert(c.destination()))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SeedingSource for UriSeeding {
    async fn active_seed_routes(&self) -> Vec<SeedCandidate> {
        if self.stopped.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.all()
    }

    fn is_acceptable_peer(&self, descriptor: &PeerDescriptor) -> bool {
        if !self.use_only_seeds {
            return true;
        }
        self.all().iter().any(|seed| match seed.peer_id {
            Some(id) => id == descriptor.peer_id,
            None => descriptor.addresses.iter().any(|a| *a == seed.address),
        })
    }

    fn add_seed_route(&self, route: RouteHint) {
        self.push(SeedCandidate::from_route(route));
    }

    fn add_seed_address(&self, address: &str) {
        match SeedCandidate::parse(address) {
            Ok(candidate) => self.push(candidate),
            Err(e) => tracing::warn!(error = %e, "ignoring seed"),
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

// ── CacheSeeding ──────────────────────────────────────────────────────────────

pub struct CacheSeeding {
    cache: Arc<dyn AdvertisementCache>,
    local: PeerId,
    fallback: UriSeeding,
}

impl CacheSeeding {
    pub fn new(cache: Arc<dyn AdvertisementCache>, local: PeerId, fallback: UriSeeding) -> Self {
        Self {
            cache,
            local,
            fallback,
        }
    }
}

#[async_trait]
impl SeedingSource for CacheSeeding {
    async fn active_seed_routes(&self) -> Vec<SeedCandidate> {
        if self.fallback.stopped.load(Ordering::Acquire) {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let cached = self
            .cache
            .rendezvous_descriptors()
            .await
            .into_iter()
            .filter(|d| d.peer_id != self.local && self.fallback.is_acceptable_peer(d))
            .map(|d| SeedCandidate::from_route(d.route_hint()));

        cached
            .chain(self.fallback.active_seed_routes().await)
            .filter(|c| seen.insert(c.destination()))
            .collect()
    }

    fn is_acceptable_peer(&self, descriptor: &PeerDescriptor) -> bool {
        self.fallback.is_acceptable_peer(descriptor)
    }

    fn add_seed_route(&self, route: RouteHint) {
        self.fallback.add_seed_route(route);
    }

    fn add_seed_address(&self, address: &str) {
        self.fallback.add_seed_address(address);
    }

    fn stop(&self) {
        self.fallback.stop();
    }
}

/// Build the seeding source named by config.
pub fn build_seeding(
    config: &RendezvousConfig,
    cache: Arc<dyn AdvertisementCache>,
    local: PeerId,
) -> Result<Arc<dyn SeedingSource>, SeedingError> {
    let uri = UriSeeding::from_uris(config.seeds.as_slice(), config.use_only_seeds)?;
    Ok(match config.seeding {
        SeedingKind::Uri => Arc::new(uri),
        SeedingKind::Cache => Arc::new(CacheSeeding::new(cache, local, uri)),
    })
}
