//! UDP transport: one socket, one JSON frame per datagram.
//!
//! Addresses are `udp://host:port`. Peer ids resolve through a route table
//! fed by lease replies and by the source address of every inbound frame
//! that names its sender.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use edgelink_core::{Message, PeerId, RouteHint};
use edgelink_services::{Destination, Transport, TransportError};

const SCHEME: &str = "udp://";
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Serialize, Deserialize)]
struct Frame {
    #[serde(default)]
    src: Option<PeerId>,
    message: Message,
}

/// A message received from the network.
pub struct Inbound {
    pub message: Message,
    pub from: Destination,
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: PeerId,
    routes: DashMap<PeerId, SocketAddr>,
    broadcast_addrs: Vec<SocketAddr>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, local: PeerId, broadcast_addrs: Vec<SocketAddr>) -> Self {
        Self {
            socket,
            local,
            routes: DashMap::new(),
            broadcast_addrs,
        }
    }

    pub fn local_address(&self) -> std::io::Result<String> {
        Ok(format!("{SCHEME}{}", self.socket.local_addr()?))
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Receive frames and hand them to `tx` until shutdown.
    pub async fn recv_loop(self: Arc<Self>, tx: mpsc::Sender<Inbound>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tracing::info!(addr = ?self.socket.local_addr().ok(), "udp transport listening");

        loop {
            let (len, peer_addr) = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("udp transport shutting down");
                    return;
                }
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                },
            };

            let frame: Frame = match serde_json::from_slice(&buf[..len]) {
                Ok(f) => f,
                Err(e) => {
                    tracing::trace!(addr = %peer_addr, error = %e, "undecodable datagram");
                    continue;
                }
            };

            if let Some(src) = frame.src {
                if src == self.local {
                    tracing::trace!("ignoring own datagram");
                    continue;
                }
                self.routes.insert(src, peer_addr);
            }

            let inbound = Inbound {
                message: frame.message,
                from: Destination::Address(format!("{SCHEME}{peer_addr}")),
            };
            if tx.send(inbound).await.is_err() {
                tracing::debug!("inbound receiver dropped, stopping");
                return;
            }
        }
    }

    async fn resolve(&self, dest: &Destination) -> Result<SocketAddr, TransportError> {
        match dest {
            Destination::Peer(id) => self
                .routes
                .get(id)
                .map(|r| *r.value())
                .ok_or_else(|| TransportError::NoRoute(dest.clone())),
            Destination::Address(addr) => {
                let host = addr
                    .strip_prefix(SCHEME)
                    .ok_or_else(|| TransportError::BadAddress(addr.clone()))?;
                tokio::net::lookup_host(host)
                    .await
                    .map_err(|e| TransportError::Unreachable {
                        dest: dest.clone(),
                        reason: e.to_string(),
                    })?
                    .next()
                    .ok_or_else(|| TransportError::NoRoute(dest.clone()))
            }
        }
    }

    fn encode(&self, message: Message) -> Result<Vec<u8>, TransportError> {
        let frame = Frame {
            src: Some(self.local),
            message,
        };
        let bytes = serde_json::to_vec(&frame).map_err(|e| TransportError::Encode(e.to_string()))?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(TransportError::Encode(format!("{} byte frame exceeds datagram", bytes.len())));
        }
        Ok(bytes)
    }
}

/// `udp://ip:port` → socket address, without DNS.
pub fn parse_udp_addr(addr: &str) -> Option<SocketAddr> {
    addr.strip_prefix(SCHEME)?.parse().ok()
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, dest: &Destination, message: Message) -> Result<(), TransportError> {
        let target = self.resolve(dest).await?;
        let bytes = self.encode(message)?;
        self.socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| TransportError::Unreachable {
                dest: dest.clone(),
                reason: e.to_string(),
            })?;
        tracing::trace!(%dest, addr = %target, len = bytes.len(), "datagram sent");
        Ok(())
    }

    async fn propagate(&self, message: Message) -> Result<(), TransportError> {
        if self.broadcast_addrs.is_empty() {
            return Ok(());
        }
        let bytes = self.encode(message)?;
        let mut last_err = None;
        let mut delivered = 0;
        for addr in &self.broadcast_addrs {
            match self.socket.send_to(&bytes, addr).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "broadcast send failed");
                    last_err = Some(e);
                }
            }
        }
        match (delivered, last_err) {
            (0, Some(e)) => Err(TransportError::Unreachable {
                dest: Destination::Address("broadcast".into()),
                reason: e.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn learn_route(&self, hint: &RouteHint) {
        if hint.peer_id == self.local {
            return;
        }
        if let Some(addr) = hint.addresses.iter().find_map(|a| parse_udp_addr(a)) {
            self.routes.insert(hint.peer_id, addr);
        }
    }
}
