//! edgelinkd: edge peer daemon.
//!
//! Leases a connection to one or more rendezvous peers over UDP and keeps
//! it alive until ctrl-c.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use edgelink_core::config::EdgeConfig;
use edgelink_core::{PeerDescriptor, PeerId};
use edgelink_services::{build_seeding, EdgePeer, EdgeServices, EventBus, MemoryCache};

mod udp;

use udp::{Inbound, UdpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = EdgeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    // A missing file means defaults; a broken one stops startup.
    let config = EdgeConfig::load().context("invalid configuration")?;

    // Identity
    let peer_id = if config.identity.peer_id.is_empty() {
        PeerId::random()
    } else {
        config
            .identity
            .peer_id
            .parse()
            .context("invalid identity.peer_id")?
    };
    tracing::info!(peer = %peer_id, "edgelinkd starting");

    // Socket
    let socket = Arc::new(
        UdpSocket::bind(config.network.listen_addr.as_str())
            .await
            .with_context(|| format!("failed to bind {}", config.network.listen_addr))?,
    );
    let broadcast_addrs = config
        .network
        .broadcast_addrs
        .iter()
        .map(|a| {
            a.parse::<SocketAddr>()
                .with_context(|| format!("invalid broadcast address {a}"))
        })
        .collect::<Result<Vec<_>>>()?;
    if !broadcast_addrs.is_empty() {
        socket.set_broadcast(true).context("failed to enable broadcast")?;
    }
    let transport = Arc::new(UdpTransport::new(socket, peer_id, broadcast_addrs));

    let name = if config.identity.name.is_empty() {
        format!("edgelink-{}", peer_id.short())
    } else {
        config.identity.name.clone()
    };
    let local = PeerDescriptor::new(peer_id, name).with_address(transport.local_address()?);

    // Collaborators
    let cache = Arc::new(MemoryCache::default());
    let seeding =
        build_seeding(&config.rendezvous, cache.clone(), peer_id).context("invalid seed configuration")?;
    tracing::info!(
        seeds = config.rendezvous.seeds.len(),
        kind = ?config.rendezvous.seeding,
        "seeding ready"
    );
    let bus = EventBus::default();
    let mut events = bus.subscribe();

    let edge = EdgePeer::new(
        &config,
        local,
        EdgeServices {
            transport: transport.clone(),
            seeding,
            cache: cache.clone(),
            events: Arc::new(bus),
        },
    )
    .context("invalid rendezvous configuration")?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(1024);
    let recv_task = tokio::spawn(transport.clone().recv_loop(inbound_tx, shutdown_tx.subscribe()));

    let inbound_task = {
        let edge = edge.clone();
        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                if !edge.handle_message(&inbound.message, Some(&inbound.from)).await {
                    tracing::trace!(from = %inbound.from, "non-lease message");
                }
            }
        })
    };

    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(%event, "membership"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event logger lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let status_printer = {
        let edge = edge.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let purged = cache.purge_expired();
                let peers = edge.connected_peer_ids();
                tracing::info!(
                    connections = peers.len(),
                    routes = transport.route_count(),
                    cached = cache.len(),
                    purged,
                    "rendezvous status"
                );
                for peer in peers {
                    tracing::info!(peer = peer.short(), state = ?edge.lease_state(&peer), "  lease");
                }
            }
        })
    };

    edge.start().await;

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown signal received");
        }
        r = recv_task => tracing::error!("udp receiver exited: {:?}", r),
    }

    edge.stop().await;
    let _ = shutdown_tx.send(());
    inbound_task.abort();
    event_logger.abort();
    status_printer.abort();

    tracing::info!("edgelinkd stopped");
    Ok(())
}
