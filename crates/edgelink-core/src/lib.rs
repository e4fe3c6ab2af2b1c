//! edgelink-core: shared types, wire messages, and configuration.
//! All other edgelink crates depend on this one.

pub mod config;
pub mod event;
pub mod header;
pub mod wire;

pub use event::MembershipEvent;
pub use header::{PropagationHeader, clamp_ttl};
pub use wire::{Message, PeerDescriptor, PeerId, RouteHint};
