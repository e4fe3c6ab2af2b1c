//! Propagation header: the per-message envelope for TTL-bounded fan-out.
//!
//! Every propagated message carries one header under `PROP_HEADER_ELEMENT`.
//! The header is attached to a *clone* of the caller's message for each
//! recipient; it is never shared between concurrent sends.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::wire::{Message, PeerId, WireError, PROP_HEADER_ELEMENT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationHeader {
    /// Duplicate-suppression id: `hex(blake3(origin || timestamp_ns_le || nonce))`.
    pub msg_id: String,
    /// Remaining hops.
    pub ttl: u32,
    /// Destination service name and parameter on receiving peers.
    pub service: String,
    pub param: String,
    /// Peers that already forwarded this message, origin first.
    #[serde(default)]
    pub path: Vec<PeerId>,
}

/// Clamp a requested hop count down to `max_ttl`. Never raises it.
pub fn clamp_ttl(requested: u32, max_ttl: u32) -> u32 {
    requested.min(max_ttl)
}

impl PropagationHeader {
    /// Header for a message that has never been propagated.
    pub fn fresh(origin: &PeerId, service: &str, param: &str, ttl: u32) -> Self {
        Self {
            msg_id: new_msg_id(origin),
            ttl,
            service: service.to_string(),
            param: param.to_string(),
            path: vec![*origin],
        }
    }

    /// Read the header from a message. `Ok(None)` if it has none.
    pub fn read(msg: &Message) -> Result<Option<Self>, WireError> {
        msg.json(PROP_HEADER_ELEMENT)
    }

    /// Write this header into `msg`, replacing any previous one.
    pub fn attach(&self, msg: &mut Message) -> Result<(), WireError> {
        msg.set_json(PROP_HEADER_ELEMENT, self)
    }

    pub fn has_visited(&self, peer: &PeerId) -> bool {
        self.path.contains(peer)
    }

    /// Build the header for sending `msg` onward from `local`.
    ///
    /// A message with no header gets a fresh one with the clamped TTL. A
    /// message that already carries a header keeps its id and is forwarded
    /// with `min(existing - 1, clamped)`. `Ok(None)` means the hop budget is
    /// spent and the message is dropped silently.
    pub fn outbound(
        msg: &Message,
        local: &PeerId,
        service: &str,
        param: &str,
        ttl: u32,
        max_ttl: u32,
    ) -> Result<Option<Self>, HeaderError> {
        let ttl = clamp_ttl(ttl, max_ttl);

        let existing = match Self::read(msg).map_err(HeaderError::Unreadable)? {
            None => return Ok(Some(Self::fresh(local, service, param, ttl))),
            Some(h) => h,
        };

        if existing.service != service || existing.param != param {
            return Err(HeaderError::Inconsistent {
                msg_id: existing.msg_id,
                header: format!("{}/{}", existing.service, existing.param),
                requested: format!("{service}/{param}"),
            });
        }
        if existing.has_visited(local) {
            return Err(HeaderError::Loop(existing.msg_id));
        }
        if existing.ttl == 0 {
            return Ok(None);
        }

        let mut next = existing;
        next.ttl = (next.ttl - 1).min(ttl);
        next.path.push(*local);
        Ok(Some(next))
    }
}

fn new_msg_id(origin: &PeerId) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let nonce: u64 = rand::random();

    let mut hasher = blake3::Hasher::new();
    hasher.update(origin.as_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&nonce.to_le_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Why a header could not be built for an outbound send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("existing propagation header unreadable: {0}")]
    Unreadable(WireError),

    #[error("message {msg_id} carries header for {header}, asked to propagate as {requested}")]
    Inconsistent {
        msg_id: String,
        header: String,
        requested: String,
    },

    #[error("message {0} already passed through this peer")]
    Loop(String),
}
