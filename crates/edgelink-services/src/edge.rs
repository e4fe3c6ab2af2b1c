//! `EdgePeer`: the edge side of the rendezvous protocol, assembled.
//!
//! Owns the registry, lease protocol, bootstrap scheduler, monitor, and
//! propagation engine, and exposes what a host needs: seeding, explicit
//! disconnect and challenge, connection queries, propagation, and the
//! start/stop lifecycle.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use edgelink_core::config::{ConfigError, EdgeConfig};
use edgelink_core::{MembershipEvent, Message, PeerDescriptor, PeerId, RouteHint};

use crate::bootstrap::BootstrapScheduler;
use crate::cache::AdvertisementCache;
use crate::events::EventSink;
use crate::lease::{LeaseProtocol, LeaseState};
use crate::monitor::MonitorLoop;
use crate::propagate::PropagationEngine;
use crate::registry::ConnectionRegistry;
use crate::seeding::{SeedCandidate, SeedingSource};
use crate::transport::{Destination, Transport};

/// External collaborators the edge peer is built on.
#[derive(Clone)]
pub struct EdgeServices {
    pub transport: Arc<dyn Transport>,
    pub seeding: Arc<dyn SeedingSource>,
    pub cache: Arc<dyn AdvertisementCache>,
    pub events: Arc<dyn EventSink>,
}

enum Lifecycle {
    Idle,
    Running {
        monitor: JoinHandle<()>,
        shutdown: broadcast::Sender<()>,
    },
    Stopped,
}

pub struct EdgePeer {
    local: PeerDescriptor,
    registry: Arc<ConnectionRegistry>,
    lease: Arc<LeaseProtocol>,
    bootstrap: Arc<BootstrapScheduler>,
    monitor: Arc<MonitorLoop>,
    propagation: PropagationEngine,
    seeding: Arc<dyn SeedingSource>,
    events: Arc<dyn EventSink>,
    lifecycle: Mutex<Lifecycle>,
}

impl EdgePeer {
    pub fn new(config: &EdgeConfig, local: PeerDescriptor, services: EdgeServices) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let rdv = &config.rendezvous;

        let registry = Arc::new(ConnectionRegistry::new(rdv.max_connections, rdv.lease_margin()));
        let lease = Arc::new(LeaseProtocol::new(
            local.clone(),
            registry.clone(),
            services.transport.clone(),
            services.seeding.clone(),
            services.cache.clone(),
            services.events.clone(),
            config.cache.descriptor_lifetime(),
            config.cache.descriptor_expiration(),
        ));
        let bootstrap = Arc::new(BootstrapScheduler::new(
            registry.clone(),
            services.seeding.clone(),
            lease.clone(),
            rdv.max_seed_attempts_per_cycle,
        ));
        let monitor = Arc::new(MonitorLoop::new(
            registry.clone(),
            lease.clone(),
            bootstrap.clone(),
            services.transport.clone(),
            rdv,
        ));
        let propagation =
            PropagationEngine::new(local.peer_id, registry.clone(), services.transport.clone(), rdv.max_ttl);

        Ok(Arc::new(Self {
            local,
            registry,
            lease,
            bootstrap,
            monitor,
            propagation,
            seeding: services.seeding,
            events: services.events,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }))
    }

    pub fn local_descriptor(&self) -> &PeerDescriptor {
        &self.local
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Spawn the monitor. Returns false if already running or stopped;
    /// a stopped peer cannot be restarted.
    pub async fn start(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => return false,
            Lifecycle::Stopped => {
                tracing::warn!("edge peer already stopped, refusing to start");
                return false;
            }
        }

        let (shutdown, rx) = broadcast::channel(1);
        let monitor = tokio::spawn(self.monitor.clone().run(rx));
        *lifecycle = Lifecycle::Running { monitor, shutdown };

        tracing::info!(
            peer = self.local.peer_id.short(),
            max_connections = self.registry.max_connections(),
            "edge peer started"
        );
        self.events.emit(MembershipEvent::BecameEdge);
        true
    }

    /// Stop the monitor, stop seeding, and disconnect from every
    /// rendezvous. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped);

        if let Lifecycle::Stopped = previous {
            return;
        }

        self.lease.stop();
        self.monitor.stop();
        if let Lifecycle::Running { monitor, shutdown } = previous {
            let _ = shutdown.send(());
            if let Err(e) = monitor.await {
                tracing::warn!(error = %e, "monitor task ended abnormally");
            }
        }

        self.bootstrap.stop();
        self.seeding.stop();
        let disconnected = self.lease.disconnect_all().await;
        tracing::info!(disconnected, "edge peer stopped");
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running { .. })
    }

    // ── Produced interface ────────────────────────────────────────────────────

    /// Seed a rendezvous candidate and bring the next monitor cycle
    /// forward. Returns false if `address` is not a valid seed URI, if it
    /// names a different peer than `hint`, or once the peer is stopped.
    pub fn connect_to_rendezvous(&self, address: &str, hint: Option<RouteHint>) -> bool {
        if self.lease.is_stopped() {
            tracing::debug!("edge peer stopped, ignoring rendezvous seed");
            return false;
        }

        let parsed = match hint {
            Some(_) if address.is_empty() => None,
            _ => match SeedCandidate::parse(address) {
                Ok(candidate) => Some(candidate),
                Err(e) => {
                    tracing::warn!(error = %e, "rejecting rendezvous seed");
                    return false;
                }
            },
        };

        let candidate = match (hint, parsed) {
            (Some(hint), parsed) => {
                let mut candidate = SeedCandidate::from_route(hint.clone());
                if let Some(parsed) = parsed {
                    if parsed.peer_id.is_some_and(|id| id != hint.peer_id) {
                        tracing::warn!(seed = address, "seed address names another peer than its hint");
                        return false;
                    }
                    candidate.address = parsed.address;
                }
                self.seeding.add_seed_route(hint);
                candidate
            }
            (None, Some(candidate)) => {
                self.seeding.add_seed_address(address);
                candidate
            }
            (None, None) => return false,
        };

        tracing::debug!(seed = %candidate.destination(), "rendezvous seed supplied");
        self.bootstrap.enqueue_front(candidate);
        self.monitor.kick();
        true
    }

    pub async fn disconnect_from_rendezvous(&self, peer_id: &PeerId) -> bool {
        self.lease.disconnect(peer_id).await
    }

    pub fn challenge_rendezvous(&self, peer_id: &PeerId, delay_ms: i64) -> bool {
        self.lease.challenge(peer_id, delay_ms)
    }

    pub fn is_connected_to_any_rendezvous(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn connected_peer_ids(&self) -> Vec<PeerId> {
        self.registry.peer_ids()
    }

    pub fn lease_state(&self, peer_id: &PeerId) -> LeaseState {
        self.lease.state_of(peer_id)
    }

    /// Feed an inbound message. Returns true if it was a lease control
    /// message.
    pub async fn handle_message(&self, msg: &Message, from: Option<&Destination>) -> bool {
        self.lease.handle_message(msg, from).await
    }

    pub async fn propagate(&self, msg: &Message, service: &str, param: &str, ttl: u32) -> usize {
        self.propagation.propagate(msg, service, param, ttl).await
    }

    pub async fn propagate_in_group(&self, msg: &Message, service: &str, param: &str, ttl: u32) -> usize {
        self.propagation.propagate_in_group(msg, service, param, ttl).await
    }

    pub async fn propagate_to_neighbors(&self, msg: &Message, service: &str, param: &str, ttl: u32) -> bool {
        self.propagation.propagate_to_neighbors(msg, service, param, ttl).await
    }

    pub async fn walk(&self, msg: &Message, service: &str, param: &str, ttl: u32) -> usize {
        self.propagation.walk(msg, service, param, ttl).await
    }

    pub async fn walk_to(&self, dest_peers: &[PeerId], msg: &Message, service: &str, param: &str, ttl: u32) -> usize {
        self.propagation.walk_to(dest_peers, msg, service, param, ttl).await
    }
}
