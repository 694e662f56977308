//! Configuration system for ScopeLink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SCOPELINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/scopelink/config.toml
//!   3. ~/.config/scopelink/config.toml
//!
//! The loaded struct is handed to every endpoint constructor. Nothing reads
//! settings from global state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{DEFAULT_CHUNK_CAP, DEFAULT_PIPELINE_BUDGET, MAX_CHUNK_CAP, MAX_DATAGRAM};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeLinkConfig {
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host a client connects to.
    pub host: String,
    /// Address a server binds to.
    pub bind_host: String,
    /// Signal session port. The chunk port is base_port + 1.
    pub base_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// HARD_CHUNK_CAP: max payload bytes per chunk reply.
    pub chunk_cap: usize,
    /// PIPELINE_BUDGET: chunk requests a client keeps in flight.
    pub pipeline_budget: usize,
    /// Fixed correction added to every requested offset on the server.
    /// Works around devices that prepend a header to their frames.
    pub slice_offset: i32,
    /// Bounded wait of one socket receive.
    pub receive_timeout_ms: u64,
    /// Pending slice pulls a client accepts before `request_slice` waits.
    pub request_queue: usize,
    /// Completed slices a client buffers before it pauses pulling.
    pub completed_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the outgoing signal queue on both endpoints.
    pub queue_capacity: usize,
    /// How long `send` waits for room before dropping the signal.
    pub offer_timeout_ms: u64,
    /// Sleep of an idle loop iteration.
    pub idle_sleep_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Max bytes held by the slice cache.
    pub capacity_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Payloads above this size go through the slice cache instead of the
    /// control channel.
    pub inline_payload_limit: usize,
    /// Re-send the last stack (or acquire one) when a client signs on.
    pub acquire_on_connect: bool,
    /// Name announced in the server hello.
    pub server_name: String,
    /// Bounded wait on the hardware output queue.
    pub poll_timeout_ms: u64,
    /// Advertise the server on the discovery group while it runs.
    pub announce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Where announcements are sent and explorers listen. Usually a
    /// multicast group; a unicast address works for a single listener.
    pub group: String,
    /// Time between two announcements of a running server.
    pub interval_ms: u64,
    /// An explorer forgets a server it has not heard from for this long.
    pub ttl_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            bind_host: "0.0.0.0".to_string(),
            base_port: 4000,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_cap: DEFAULT_CHUNK_CAP,
            pipeline_budget: DEFAULT_PIPELINE_BUDGET,
            slice_offset: 0,
            receive_timeout_ms: 500,
            request_queue: 10,
            completed_queue: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            offer_timeout_ms: 5000,
            idle_sleep_ms: 200,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 2 * 1024 * 1024,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            inline_payload_limit: 1024,
            acquire_on_connect: false,
            server_name: "a microscope".to_string(),
            poll_timeout_ms: 200,
            announce: true,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: "239.255.77.77:4099".to_string(),
            interval_ms: 1000,
            ttl_ms: 5000,
        }
    }
}

impl TransferConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Reject transfer settings the chunk endpoints cannot serve.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_cap == 0 || self.chunk_cap > MAX_CHUNK_CAP {
            return Err(ConfigError::Invalid {
                field: "transfer.chunk_cap",
                reason: format!("must be in 1..={MAX_CHUNK_CAP}"),
            });
        }
        if self.pipeline_budget == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.pipeline_budget",
                reason: "must be at least 1".into(),
            });
        }
        if self.request_queue == 0 || self.completed_queue == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.request_queue",
                reason: "request and completed queues need room for one slice".into(),
            });
        }
        Ok(())
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl SessionConfig {
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

impl RemoteConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl NetworkConfig {
    pub fn signal_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.base_port)
    }

    pub fn chunk_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.base_port.wrapping_add(1))
    }

    pub fn signal_addr(&self) -> String {
        format!("{}:{}", self.host, self.base_port)
    }

    pub fn chunk_addr(&self) -> String {
        format!("{}:{}", self.host, self.base_port.wrapping_add(1))
    }
}

/// Largest payload that still fits one signal datagram when inlined.
pub const MAX_INLINE_PAYLOAD: usize = MAX_DATAGRAM / 16;

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("scopelink")
}

fn home_dir() -> PathBuf {
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
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ScopeLinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            ScopeLinkConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SCOPELINK_CONFIG")
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
            let text = toml::to_string_pretty(&ScopeLinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SCOPELINK_* overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SCOPELINK_NETWORK__HOST") {
            self.network.host = v;
        }
        if let Some(v) = lookup("SCOPELINK_NETWORK__BIND_HOST") {
            self.network.bind_host = v;
        }
        if let Some(p) = lookup("SCOPELINK_NETWORK__BASE_PORT").and_then(|v| v.parse().ok()) {
            self.network.base_port = p;
        }
        if let Some(c) = lookup("SCOPELINK_TRANSFER__CHUNK_CAP").and_then(|v| v.parse().ok()) {
            self.transfer.chunk_cap = c;
        }
        if let Some(o) = lookup("SCOPELINK_TRANSFER__SLICE_OFFSET").and_then(|v| v.parse().ok()) {
            self.transfer.slice_offset = o;
        }
        if let Some(b) = lookup("SCOPELINK_CACHE__CAPACITY_BYTES").and_then(|v| v.parse().ok()) {
            self.cache.capacity_bytes = b;
        }
        if let Some(v) = lookup("SCOPELINK_REMOTE__ACQUIRE_ON_CONNECT") {
            self.remote.acquire_on_connect = v == "true" || v == "1";
        }
        if let Some(v) = lookup("SCOPELINK_REMOTE__SERVER_NAME") {
            self.remote.server_name = v;
        }
        if let Some(v) = lookup("SCOPELINK_REMOTE__ANNOUNCE") {
            self.remote.announce = v == "true" || v == "1";
        }
        if let Some(v) = lookup("SCOPELINK_DISCOVERY__GROUP") {
            self.discovery.group = v;
        }
    }

    /// Reject settings the protocols cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer.validate()?;
        if self.session.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "session.queue_capacity",
                reason: "must be at least 1".into(),
            });
        }
        // Inlined payloads are JSON arrays nested twice, up to 16 bytes per byte.
        if self.remote.inline_payload_limit > MAX_INLINE_PAYLOAD {
            return Err(ConfigError::Invalid {
                field: "remote.inline_payload_limit",
                reason: format!("must be at most {MAX_INLINE_PAYLOAD}"),
            });
        }
        if self.discovery.interval_ms == 0 || self.discovery.ttl_ms <= self.discovery.interval_ms {
            return Err(ConfigError::Invalid {
                field: "discovery.ttl_ms",
                reason: "interval must be non-zero and shorter than the ttl".into(),
            });
        }
        Ok(())
    }
}
