//! Membership transitions reported to the host.

use std::fmt;

use crate::wire::PeerId;

/// A membership transition. Produced, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// First accepted lease with a rendezvous.
    Connected(PeerId),
    /// Lease renewed in place.
    Reconnected(PeerId),
    /// Voluntary end: disconnect notice, caller disconnect, or shutdown.
    Disconnected(PeerId),
    /// Lease expired, was revoked, or the rendezvous was challenged away.
    Failed(PeerId),
    BecameEdge,
    BecameRendezvous,
}

impl MembershipEvent {
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Self::Connected(p) | Self::Reconnected(p) | Self::Disconnected(p) | Self::Failed(p) => {
                Some(p)
            }
            Self::BecameEdge | Self::BecameRendezvous => None,
        }
    }
}

impl fmt::Display for MembershipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(p) => write!(f, "connected {}", p.short()),
            Self::Reconnected(p) => write!(f, "reconnected {}", p.short()),
            Self::Disconnected(p) => write!(f, "disconnected {}", p.short()),
            Self::Failed(p) => write!(f, "failed {}", p.short()),
            Self::BecameEdge => f.write_str("became edge"),
            Self::BecameRendezvous => f.write_str("became rendezvous"),
        }
    }
}
