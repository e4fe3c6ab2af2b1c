//! Configuration system for edgelink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $EDGELINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/edgelink/config.toml
//!   3. ~/.config/edgelink/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::{
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_TTL, LEASE_MARGIN_MS, MAX_SEED_ATTEMPTS_PER_CYCLE,
    MONITOR_INTERVAL_MS, PENDING_REQUEST_TIMEOUT_MS, SEED_KICK_DELAY_MS, STARTUP_RETRY_MS,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub rendezvous: RendezvousConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex peer id. Empty = random per run.
    pub peer_id: String,
    /// Human-readable name put in our descriptor.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local UDP bind address.
    pub listen_addr: String,
    /// Where neighbor-wide propagation is sent. Empty = no wider distribution.
    pub broadcast_addrs: Vec<String>,
}

/// Which seeding source to build at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedingKind {
    /// Configured seed URIs plus caller-supplied seeds.
    #[default]
    Uri,
    /// Rendezvous descriptors from the advertisement cache, then seed URIs.
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Target number of simultaneous leases.
    pub max_connections: usize,
    /// Renew this long before lease end (capped at half the lease).
    pub lease_margin_ms: u64,
    pub monitor_interval_ms: u64,
    /// Monitor retry delay while routing is not up yet.
    pub startup_retry_ms: u64,
    /// Monitor re-arm delay after a caller supplies a seed.
    pub seed_kick_delay_ms: u64,
    pub max_seed_attempts_per_cycle: usize,
    pub pending_request_timeout_ms: u64,
    pub max_ttl: u32,
    /// Seed URIs: `udp://host:port` or `<peer-hex>@udp://host:port`.
    pub seeds: Vec<String>,
    /// Only accept rendezvous peers that appear in `seeds`.
    pub use_only_seeds: bool,
    pub seeding: SeedingKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime we publish learned descriptors with.
    pub descriptor_lifetime_ms: u64,
    /// Expiration other peers should apply to them.
    pub descriptor_expiration_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9701".to_string(),
            broadcast_addrs: Vec::new(),
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            lease_margin_ms: LEASE_MARGIN_MS,
            monitor_interval_ms: MONITOR_INTERVAL_MS,
            startup_retry_ms: STARTUP_RETRY_MS,
            seed_kick_delay_ms: SEED_KICK_DELAY_MS,
            max_seed_attempts_per_cycle: MAX_SEED_ATTEMPTS_PER_CYCLE,
            pending_request_timeout_ms: PENDING_REQUEST_TIMEOUT_MS,
            max_ttl: DEFAULT_MAX_TTL,
            seeds: Vec::new(),
            use_only_seeds: false,
            seeding: SeedingKind::Uri,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            descriptor_lifetime_ms: 2 * 60 * 60 * 1000, // 2 hours
            descriptor_expiration_ms: 20 * 60 * 1000,
        }
    }
}

impl RendezvousConfig {
    pub fn lease_margin(&self) -> Duration {
        Duration::from_millis(self.lease_margin_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn startup_retry(&self) -> Duration {
        Duration::from_millis(self.startup_retry_ms)
    }

    pub fn seed_kick_delay(&self) -> Duration {
        Duration::from_millis(self.seed_kick_delay_ms)
    }

    pub fn pending_request_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_request_timeout_ms)
    }
}

impl CacheConfig {
    pub fn descriptor_lifetime(&self) -> Duration {
        Duration::from_millis(self.descriptor_lifetime_ms)
    }

    pub fn descriptor_expiration(&self) -> Duration {
        Duration::from_millis(self.descriptor_expiration_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("edgelink")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EdgeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from `path`, or defaults if it does not exist. A file that
    /// exists but does not parse or validate is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            EdgeConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("EDGELINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&EdgeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the edge peer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rdv = &self.rendezvous;
        if rdv.max_connections == 0 {
            return Err(ConfigError::Invalid("rendezvous.max_connections", "must be at least 1".into()));
        }
        if rdv.monitor_interval_ms == 0 {
            return Err(ConfigError::Invalid("rendezvous.monitor_interval_ms", "must be positive".into()));
        }
        if rdv.max_seed_attempts_per_cycle == 0 {
            return Err(ConfigError::Invalid(
                "rendezvous.max_seed_attempts_per_cycle",
                "must be at least 1".into(),
            ));
        }
        if !self.identity.peer_id.is_empty() {
            self.identity
                .peer_id
                .parse::<crate::wire::PeerId>()
                .map_err(|e| ConfigError::Invalid("identity.peer_id", e.to_string()))?;
        }
        Ok(())
    }

    /// Apply EDGELINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("EDGELINK_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("EDGELINK_RENDEZVOUS__MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.rendezvous.max_connections = n;
            }
        }
        if let Ok(v) = std::env::var("EDGELINK_RENDEZVOUS__MAX_TTL") {
            if let Ok(n) = v.parse() {
                self.rendezvous.max_ttl = n;
            }
        }
        if let Ok(v) = std::env::var("EDGELINK_RENDEZVOUS__SEEDS") {
            self.rendezvous.seeds = split_list(&v);
        }
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
