//! Simulated network: an in-process `Transport` with scripted rendezvous
//! peers that answer lease requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use edgelink_core::config::EdgeConfig;
use edgelink_core::wire::{ControlMessage, LeaseReply, DISCONNECT_ELEMENT, LEASE_REQUEST_ELEMENT};
use edgelink_core::{MembershipEvent, Message, PeerDescriptor, PeerId, RouteHint};
use edgelink_services::{
    Destination, EdgePeer, EdgeServices, EventBus, MemoryCache, Transport, TransportError, UriSeeding,
};

// ── Rendezvous ────────────────────────────────────────────────────────────────

/// A scripted rendezvous peer.
pub struct SimRendezvous {
    pub descriptor: PeerDescriptor,
    lease_ms: AtomicI64,
    unreachable: AtomicBool,
    silent: AtomicBool,
    inbox: Mutex<Vec<Message>>,
    requests: AtomicUsize,
}

impl SimRendezvous {
    pub fn peer_id(&self) -> PeerId {
        self.descriptor.peer_id
    }

    pub fn address(&self) -> String {
        self.descriptor.addresses[0].clone()
    }

    /// Lease granted on every subsequent request. `<= 0` revokes.
    pub fn set_lease_ms(&self, lease_ms: i64) {
        self.lease_ms.store(lease_ms, Ordering::SeqCst);
    }

    /// Sends to this peer fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Requests are received but never answered.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn lease_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn received_with(&self, element: &str) -> Vec<Message> {
        self.inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.has_element(element))
            .cloned()
            .collect()
    }

    pub fn disconnect_notices(&self) -> usize {
        self.received_with(DISCONNECT_ELEMENT).len()
    }
}

// ── Network ───────────────────────────────────────────────────────────────────

pub struct SimNet {
    by_address: Mutex<HashMap<String, Arc<SimRendezvous>>>,
    by_peer: Mutex<HashMap<PeerId, Arc<SimRendezvous>>>,
    group: Mutex<Vec<Message>>,
    ready: AtomicBool,
    replies_tx: mpsc::UnboundedSender<(Message, Destination)>,
    replies_rx: Mutex<Option<mpsc::UnboundedReceiver<(Message, Destination)>>>,
}

impl SimNet {
    pub fn new() -> Arc<Self> {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            by_address: Mutex::new(HashMap::new()),
            by_peer: Mutex::new(HashMap::new()),
            group: Mutex::new(Vec::new()),
            ready: AtomicBool::new(true),
            replies_tx,
            replies_rx: Mutex::new(Some(replies_rx)),
        })
    }

    /// Add a rendezvous at `udp://10.0.0.<n>:9700` granting `lease_ms`.
    pub fn add_rendezvous(&self, n: u8, lease_ms: i64) -> Arc<SimRendezvous> {
        let descriptor = PeerDescriptor::new(PeerId::from_bytes([n; 32]), format!("rdv-{n}"))
            .with_address(format!("udp://10.0.0.{n}:9700"));
        let rdv = Arc::new(SimRendezvous {
            descriptor,
            lease_ms: AtomicI64::new(lease_ms),
            unreachable: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            inbox: Mutex::new(Vec::new()),
            requests: AtomicUsize::new(0),
        });
        self.by_address.lock().unwrap().insert(rdv.address(), rdv.clone());
        rdv
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn group_messages(&self) -> Vec<Message> {
        self.group.lock().unwrap().clone()
    }

    pub fn total_lease_requests(&self) -> usize {
        self.by_address
            .lock()
            .unwrap()
            .values()
            .map(|r| r.lease_requests())
            .sum()
    }

    /// Deliver replies into `edge` until the edge is dropped.
    pub fn pump(&self, edge: Arc<EdgePeer>) -> JoinHandle<()> {
        let mut rx = self
            .replies_rx
            .lock()
            .unwrap()
            .take()
            .expect("pump already attached");
        tokio::spawn(async move {
            while let Some((msg, from)) = rx.recv().await {
                edge.handle_message(&msg, Some(&from)).await;
            }
        })
    }

    fn lookup(&self, dest: &Destination) -> Option<Arc<SimRendezvous>> {
        match dest {
            Destination::Address(a) => self.by_address.lock().unwrap().get(a).cloned(),
            Destination::Peer(p) => self.by_peer.lock().unwrap().get(p).cloned(),
        }
    }
}

#[async_trait]
impl Transport for SimNet {
    async fn send(&self, dest: &Destination, message: Message) -> Result<(), TransportError> {
        let rdv = self
            .lookup(dest)
            .ok_or_else(|| TransportError::NoRoute(dest.clone()))?;
        if rdv.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable {
                dest: dest.clone(),
                reason: "simulated".into(),
            });
        }

        let is_request = message.has_element(LEASE_REQUEST_ELEMENT);
        rdv.inbox.lock().unwrap().push(message);
        if !is_request {
            return Ok(());
        }

        rdv.requests.fetch_add(1, Ordering::SeqCst);
        if rdv.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let reply = ControlMessage::LeaseReply(LeaseReply {
            peer_id: rdv.peer_id(),
            lease_ms: rdv.lease_ms.load(Ordering::SeqCst),
            descriptor: Some(rdv.descriptor.clone()),
        })
        .to_message()
        .map_err(|e| TransportError::Encode(e.to_string()))?;
        let _ = self
            .replies_tx
            .send((reply, Destination::Address(rdv.address())));
        Ok(())
    }

    async fn propagate(&self, message: Message) -> Result<(), TransportError> {
        self.group.lock().unwrap().push(message);
        Ok(())
    }

    fn routing_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn learn_route(&self, hint: &RouteHint) {
        let by_address = self.by_address.lock().unwrap();
        if let Some(rdv) = hint.addresses.iter().find_map(|a| by_address.get(a)) {
            if rdv.peer_id() == hint.peer_id {
                self.by_peer.lock().unwrap().insert(hint.peer_id, rdv.clone());
            }
        }
    }
}

// ── Edge node ─────────────────────────────────────────────────────────────────

pub const EDGE_ID: PeerId = PeerId::from_bytes([0xee; 32]);

pub struct Node {
    pub edge: Arc<EdgePeer>,
    pub events: broadcast::Receiver<MembershipEvent>,
    _pump: JoinHandle<()>,
}

/// Config with short timers: 50 ms monitor period, 10 ms kick and startup
/// retry.
pub fn fast_config(max_connections: usize, seeds: &[&Arc<SimRendezvous>]) -> EdgeConfig {
    let mut config = EdgeConfig::default();
    config.rendezvous.max_connections = max_connections;
    config.rendezvous.monitor_interval_ms = 50;
    config.rendezvous.seed_kick_delay_ms = 10;
    config.rendezvous.startup_retry_ms = 10;
    config.rendezvous.seeds = seeds.iter().map(|r| r.address()).collect();
    config
}

pub fn node(config: &EdgeConfig, net: &Arc<SimNet>) -> Node {
    let bus = EventBus::new(256);
    let events = bus.subscribe();
    let seeding = UriSeeding::from_uris(config.rendezvous.seeds.as_slice(), config.rendezvous.use_only_seeds)
        .expect("valid seeds");
    let edge = EdgePeer::new(
        config,
        PeerDescriptor::new(EDGE_ID, "edge").with_address("udp://10.9.0.1:9701"),
        EdgeServices {
            transport: net.clone(),
            seeding: Arc::new(seeding),
            cache: Arc::new(MemoryCache::default()),
            events: Arc::new(bus),
        },
    )
    .expect("valid config");
    let pump = net.pump(edge.clone());
    Node {
        edge,
        events,
        _pump: pump,
    }
}

// ── Waiting ───────────────────────────────────────────────────────────────────

/// Poll `cond` every 5 ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next event other than `BecameEdge`, or `None` on timeout.
pub async fn next_event(events: &mut broadcast::Receiver<MembershipEvent>, timeout: Duration) -> Option<MembershipEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(MembershipEvent::BecameEdge)) => continue,
            Ok(Ok(event)) => return Some(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Everything already queued, without waiting.
pub fn drain(events: &mut broadcast::Receiver<MembershipEvent>) -> Vec<MembershipEvent> {
    let mut out = Vec::new();
    while let Ok(e) = events.try_recv() {
        out.push(e);
    }
    out
}
