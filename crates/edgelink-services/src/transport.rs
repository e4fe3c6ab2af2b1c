//! Transport trait: the message layer the edge peer sends through.
//!
//! Implementations own addressing, connection setup, and framing. The edge
//! peer only needs unicast to an address or a logical peer id, a wider
//! distribution path for neighbor propagation, and a readiness signal.

use std::fmt;

use async_trait::async_trait;

use edgelink_core::{Message, PeerId, RouteHint};

/// Where a unicast goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A raw transport address, e.g. `udp://10.0.0.1:9700`.
    Address(String),
    /// A logical peer; the transport picks the path.
    Peer(PeerId),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Address(a) => f.write_str(a),
            Destination::Peer(p) => write!(f, "peer:{}", p.short()),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message. May block on connection setup or backpressure;
    /// callers must not hold shared locks across this call.
    async fn send(&self, dest: &Destination, message: Message) -> Result<(), TransportError>;

    /// Distribute beyond our direct leases (e.g. local-network multicast).
    async fn propagate(&self, message: Message) -> Result<(), TransportError>;

    /// False until the routing layer can resolve destinations.
    fn routing_ready(&self) -> bool {
        true
    }

    /// Remember addresses for a peer id so `Destination::Peer` resolves.
    fn learn_route(&self, _hint: &RouteHint) {}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no route to {0}")]
    NoRoute(Destination),

    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error("{dest} unreachable: {reason}")]
    Unreachable { dest: Destination, reason: String },

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("transport closed")]
    Closed,
}
