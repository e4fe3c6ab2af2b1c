//! edgelink wire format: identities, descriptors, and control messages.
//!
//! A `Message` is a bag of named byte elements. Control payloads (lease
//! request, lease reply, disconnect notice) travel as JSON under well-known
//! element names, so a single message can carry both a control payload and
//! application elements. Byte layout below the element map belongs to the
//! transport.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Peer identity ─────────────────────────────────────────────────────────────

/// Globally unique peer identifier. 32 bytes, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// A fresh random id, used when no identity is configured.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes as hex. Enough to tell peers apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| WireError::BadPeerId(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(WireError::BadPeerId(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Descriptors ───────────────────────────────────────────────────────────────

/// Snapshot of a peer's identity and reachability.
///
/// Sent in every lease request (our own) and lease reply (the rendezvous').
/// The core never interprets it beyond `peer_id` and `addresses`; acceptance
/// is decided by the seeding source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    #[serde(default)]
    pub name: String,
    /// Transport addresses, e.g. `udp://10.0.0.1:9700`.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl PeerDescriptor {
    pub fn new(peer_id: PeerId, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            addresses: Vec::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    /// Route hint for the transport: how to reach this peer by id.
    pub fn route_hint(&self) -> RouteHint {
        RouteHint {
            peer_id: self.peer_id,
            addresses: self.addresses.clone(),
        }
    }
}

/// Known addresses for a logical peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHint {
    pub peer_id: PeerId,
    #[serde(default)]
    pub addresses: Vec<String>,
}

// ── Message ───────────────────────────────────────────────────────────────────

/// An opaque overlay message: named byte elements.
///
/// Cloning is cheap (elements are `Bytes`), which is what per-recipient
/// header attachment relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    elements: BTreeMap<String, Bytes>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_element(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.set_element(name, value);
        self
    }

    pub fn set_element(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.elements.insert(name.into(), value.into());
    }

    pub fn element(&self, name: &str) -> Option<&Bytes> {
        self.elements.get(name)
    }

    pub fn remove_element(&mut self, name: &str) -> Option<Bytes> {
        self.elements.remove(name)
    }

    pub fn has_element(&self, name: &str) -> bool {
        self.elements.contains_key(name)
    }

    pub fn element_names(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Store a JSON-encoded value under `name`.
    pub fn set_json<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), WireError> {
        let bytes = serde_json::to_vec(value).map_err(|e| WireError::Encode(e.to_string()))?;
        self.set_element(name, bytes);
        Ok(())
    }

    /// Decode the JSON element `name`. `Ok(None)` if the element is absent.
    pub fn json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, WireError> {
        match self.element(name) {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| WireError::Malformed {
                    element: name.to_string(),
                    reason: e.to_string(),
                }),
        }
    }
}

// ── Control messages ──────────────────────────────────────────────────────────

pub const LEASE_REQUEST_ELEMENT: &str = "edgelink:LeaseRequest";
pub const LEASE_REPLY_ELEMENT: &str = "edgelink:LeaseReply";
pub const DISCONNECT_ELEMENT: &str = "edgelink:Disconnect";
pub const PROP_HEADER_ELEMENT: &str = "edgelink:PropHeader";

/// Edge → rendezvous: please grant (or renew) a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub descriptor: PeerDescriptor,
}

/// Rendezvous → edge: lease granted for `lease_ms`. Non-positive means revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseReply {
    pub peer_id: PeerId,
    pub lease_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<PeerDescriptor>,
}

impl LeaseReply {
    /// Granted lease, or `None` when the rendezvous revoked it.
    pub fn lease(&self) -> Option<std::time::Duration> {
        u64::try_from(self.lease_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(std::time::Duration::from_millis)
    }
}

/// Replies are parsed loosely first so that a missing field is reported as
/// such instead of as a generic decode failure.
#[derive(Deserialize)]
struct RawLeaseReply {
    peer_id: Option<String>,
    lease_ms: Option<i64>,
    descriptor: Option<PeerDescriptor>,
}

impl TryFrom<RawLeaseReply> for LeaseReply {
    type Error = WireError;

    fn try_from(raw: RawLeaseReply) -> Result<Self, Self::Error> {
        let peer_id = raw
            .peer_id
            .ok_or(WireError::MissingField("peer_id"))?
            .parse()?;
        let lease_ms = raw.lease_ms.ok_or(WireError::MissingField("lease_ms"))?;
        Ok(LeaseReply {
            peer_id,
            lease_ms,
            descriptor: raw.descriptor,
        })
    }
}

/// Either side: the lease is over, drop it now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    LeaseRequest(LeaseRequest),
    LeaseReply(LeaseReply),
    Disconnect(DisconnectNotice),
}

impl ControlMessage {
    /// Extract the control payload, if any. `Ok(None)` means the message
    /// carries no control element and belongs to someone else.
    pub fn parse(msg: &Message) -> Result<Option<Self>, WireError> {
        if let Some(raw) = msg.json::<RawLeaseReply>(LEASE_REPLY_ELEMENT)? {
            return Ok(Some(ControlMessage::LeaseReply(raw.try_into()?)));
        }
        if let Some(notice) = msg.json::<DisconnectNotice>(DISCONNECT_ELEMENT)? {
            return Ok(Some(ControlMessage::Disconnect(notice)));
        }
        if let Some(req) = msg.json::<LeaseRequest>(LEASE_REQUEST_ELEMENT)? {
            return Ok(Some(ControlMessage::LeaseRequest(req)));
        }
        Ok(None)
    }

    pub fn to_message(&self) -> Result<Message, WireError> {
        let mut msg = Message::new();
        match self {
            ControlMessage::LeaseRequest(req) => msg.set_json(LEASE_REQUEST_ELEMENT, req)?,
            ControlMessage::LeaseReply(reply) => msg.set_json(LEASE_REPLY_ELEMENT, reply)?,
            ControlMessage::Disconnect(notice) => msg.set_json(DISCONNECT_ELEMENT, notice)?,
        }
        Ok(msg)
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default number of simultaneous rendezvous leases.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1;

/// Renew this long before a lease ends (capped at half the lease).
pub const LEASE_MARGIN_MS: u64 = 5 * 60 * 1000;

/// Monitor loop period.
pub const MONITOR_INTERVAL_MS: u64 = 15_000;

/// Monitor retry delay while the transport has no routing yet.
pub const STARTUP_RETRY_MS: u64 = 2_000;

/// Monitor re-arm delay after a caller supplies a seed.
pub const SEED_KICK_DELAY_MS: u64 = 3_000;

/// Lease requests per monitor cycle, regardless of queue length.
pub const MAX_SEED_ATTEMPTS_PER_CYCLE: usize = 3;

/// An unanswered lease request is forgotten after this long.
pub const PENDING_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Upper bound for propagation hop counts.
pub const DEFAULT_MAX_TTL: u32 = 200;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed element {element}: {reason}")]
    Malformed { element: String, reason: String },

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid peer id: {0:?}")]
    BadPeerId(String),

    #[error("failed to encode: {0}")]
    Encode(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
