// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication core.
//!
//! Configuration is passed to [`ReplicationCore::new()`](crate::ReplicationCore::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use counter_replication::config::{ReplicationConfig, PeerConfig};
//!
//! let config = ReplicationConfig {
//!     local_node_id: "node-1".into(),
//!     peers: vec![PeerConfig::new("10.0.0.2:7946")],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local_node_id: String          # Empty = random UUID at startup
//! ├── settings: ReplicationSettings
//! │   ├── fanout: FanoutConfig       # Local change → peer links
//! │   ├── peer_link: PeerLinkConfig  # Buffering, sync cadence, connect retry
//! │   ├── gc: GcConfig               # Expired counter sweep
//! │   ├── discovery: DiscoveryConfig # Peer-set reconciliation
//! │   ├── read_cache: ReadCacheConfig
//! │   └── read_only: bool
//! └── peers: Vec<PeerConfig>         # Static peer addresses
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "local_node_id": "eu-west-1a",
//!   "settings": {
//!     "peer_link": { "sync_interval": "1s", "max_buffer_size": 1000 },
//!     "gc": { "interval": "1m" }
//!   },
//!   "peers": [{ "addr": "10.0.0.2:7946" }]
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationCore::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationCore::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// The identity of the local node. Stamped on every outbound sync and
    /// returned from `Hello`. Left empty, a random UUID is generated.
    #[serde(default)]
    pub local_node_id: String,

    /// Tunable parameters.
    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Peers to replicate with. Used when no peer provider is installed.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl ReplicationConfig {
    /// Create a config with fast timings for tests.
    pub fn for_testing(local_node_id: &str) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
            settings: ReplicationSettings {
                fanout: FanoutConfig {
                    channel_capacity: 1024,
                    dispatch_timeout: "100ms".to_string(),
                    max_concurrent: 16,
                },
                peer_link: PeerLinkConfig {
                    channel_capacity: 1024,
                    max_buffer_size: 100,
                    sync_interval: "50ms".to_string(),
                    sync_timeout: "500ms".to_string(),
                    connect_interval: "20ms".to_string(),
                    connect_timeout: "200ms".to_string(),
                    connect_backoff_factor: 1.0,
                    busy_policy: BusyPolicy::DeferredRetry,
                    retry_delay: "10ms".to_string(),
                    max_retries: 3,
                },
                gc: GcConfig {
                    interval: "50ms".to_string(),
                },
                discovery: DiscoveryConfig {
                    interval: "50ms".to_string(),
                },
                read_cache: ReadCacheConfig::default(),
                read_only: false,
            },
            peers: Vec::new(),
        }
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ReplicationError::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Reject settings the core cannot run with.
    ///
    /// Duration accessors fall back to defaults on parse failure, so this is
    /// the place where a typo in a duration string surfaces.
    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;

        if s.fanout.channel_capacity == 0 {
            return Err(ReplicationError::Config("fanout.channel_capacity must be > 0".into()));
        }
        if s.fanout.max_concurrent == 0 {
            return Err(ReplicationError::Config("fanout.max_concurrent must be > 0".into()));
        }
        if s.peer_link.channel_capacity == 0 {
            return Err(ReplicationError::Config("peer_link.channel_capacity must be > 0".into()));
        }
        let factor = s.peer_link.connect_backoff_factor;
        if factor.is_nan() || factor < 1.0 {
            return Err(ReplicationError::Config(
                "peer_link.connect_backoff_factor must be >= 1.0".into(),
            ));
        }

        let durations = [
            ("fanout.dispatch_timeout", &s.fanout.dispatch_timeout),
            ("peer_link.sync_interval", &s.peer_link.sync_interval),
            ("peer_link.sync_timeout", &s.peer_link.sync_timeout),
            ("peer_link.connect_interval", &s.peer_link.connect_interval),
            ("peer_link.connect_timeout", &s.peer_link.connect_timeout),
            ("peer_link.retry_delay", &s.peer_link.retry_delay),
            ("gc.interval", &s.gc.interval),
            ("discovery.interval", &s.discovery.interval),
            ("read_cache.duration", &s.read_cache.duration),
        ];
        for (field, value) in durations {
            match humantime::parse_duration(value) {
                Ok(d) if d.is_zero() && field != "read_cache.duration" => {
                    return Err(ReplicationError::Config(format!("{field} must be non-zero")));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(ReplicationError::Config(format!(
                        "{field}: cannot parse {value:?}: {e}"
                    )));
                }
            }
        }

        if self.peers.iter().any(|p| p.addr.is_empty()) {
            return Err(ReplicationError::Config("peer addr must not be empty".into()));
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the replication logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub peer_link: PeerLinkConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub read_cache: ReadCacheConfig,

    /// Serve inbound syncs and local reads but never push to peers.
    #[serde(default)]
    pub read_only: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// FanoutConfig: local changes → every peer link
// ═══════════════════════════════════════════════════════════════════════════════

/// Fan-out queue and dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Bounded queue size. A full queue drops the update (logged, counted).
    #[serde(default = "default_fanout_capacity")]
    pub channel_capacity: usize,

    /// Per-link push timeout as a duration string.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout: String,

    /// Maximum links pushed to concurrently.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_fanout_capacity() -> usize {
    102_400
}

fn default_dispatch_timeout() -> String {
    "1s".to_string()
}

fn default_max_concurrent() -> usize {
    64
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_fanout_capacity(),
            dispatch_timeout: default_dispatch_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl FanoutConfig {
    pub fn dispatch_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.dispatch_timeout).unwrap_or(Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeerLinkConfig: per-peer buffering and sync cadence
// ═══════════════════════════════════════════════════════════════════════════════

/// What a sync trigger does when a sync to the same peer is already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Drop the trigger; the next tick picks the work up.
    Skip,
    /// Queue one retry after `retry_delay`, up to `max_retries` times.
    #[default]
    DeferredRetry,
}

/// Settings shared by every peer link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLinkConfig {
    /// Inbound dirty-counter channel size per link.
    #[serde(default = "default_link_capacity")]
    pub channel_capacity: usize,

    /// Buffer size above which a sync is triggered without waiting for the tick.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Periodic sync interval.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: String,

    /// Timeout for one Sync call.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout: String,

    /// Base delay between connect attempts.
    #[serde(default = "default_connect_interval")]
    pub connect_interval: String,

    /// Timeout for dial + Hello.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Multiplier applied to the connect delay after each failed attempt.
    /// `1.0` keeps a fixed interval.
    #[serde(default = "default_connect_backoff_factor")]
    pub connect_backoff_factor: f64,

    #[serde(default)]
    pub busy_policy: BusyPolicy,

    /// Delay before a deferred retry.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,

    /// Deferred retries per busy episode before falling back to the ticker.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_link_capacity() -> usize {
    102_400
}

fn default_max_buffer_size() -> usize {
    1000
}

fn default_sync_interval() -> String {
    "1s".to_string()
}

fn default_sync_timeout() -> String {
    "5s".to_string()
}

fn default_connect_interval() -> String {
    "1s".to_string()
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

fn default_connect_backoff_factor() -> f64 {
    1.0
}

fn default_retry_delay() -> String {
    "50ms".to_string()
}

fn default_max_retries() -> u32 {
    3
}

impl Default for PeerLinkConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_link_capacity(),
            max_buffer_size: default_max_buffer_size(),
            sync_interval: default_sync_interval(),
            sync_timeout: default_sync_timeout(),
            connect_interval: default_connect_interval(),
            connect_timeout: default_connect_timeout(),
            connect_backoff_factor: default_connect_backoff_factor(),
            busy_policy: BusyPolicy::default(),
            retry_delay: default_retry_delay(),
            max_retries: default_max_retries(),
        }
    }
}

impl PeerLinkConfig {
    pub fn sync_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.sync_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn sync_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.sync_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn connect_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn retry_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_delay).unwrap_or(Duration::from_millis(50))
    }

    /// Backoff for the connect loop. Retries until the link is stopped.
    pub fn connect_retry(&self) -> RetryConfig {
        let interval = self.connect_interval_duration();
        RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: interval,
            max_delay: interval.saturating_mul(30),
            backoff_factor: self.connect_backoff_factor,
            connection_timeout: self.connect_timeout_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GC, discovery, read cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Expired-counter garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_gc_interval")]
    pub interval: String,
}

fn default_gc_interval() -> String {
    "60s".to_string()
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: default_gc_interval(),
        }
    }
}

impl GcConfig {
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(60))
    }
}

/// Peer-set reconciliation against a `PeerProvider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_interval")]
    pub interval: String,
}

fn default_discovery_interval() -> String {
    "10s".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: default_discovery_interval(),
        }
    }
}

impl DiscoveryConfig {
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(10))
    }
}

/// Optional time-bounded cache for aggregate reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadCacheConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_read_cache_duration")]
    pub duration: String,
}

fn default_read_cache_duration() -> String {
    "100ms".to_string()
}

impl Default for ReadCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration: default_read_cache_duration(),
        }
    }
}

impl ReadCacheConfig {
    /// The cache window, or `None` when caching is off.
    pub fn window(&self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        Some(humantime::parse_duration(&self.duration).unwrap_or(Duration::from_millis(100)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// One remote node, identified by address. Its node ID is learned via `Hello`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerConfig {
    pub addr: String,
}

impl PeerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
