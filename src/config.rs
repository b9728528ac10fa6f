// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the shard router.
//!
//! Configuration is supplied once at startup, either constructed
//! programmatically or deserialized from JSON, and passed to
//! [`ShardRouter::new()`](crate::ShardRouter::new) and
//! [`ReplicaManager::new()`](crate::ReplicaManager::new).
//!
//! # Quick Start
//!
//! ```rust
//! use shard_router::config::{RouterConfig, ShardTopology};
//!
//! let config = RouterConfig {
//!     topologies: vec![
//!         ShardTopology::for_testing("users", 4),
//!         ShardTopology::for_testing("content", 4),
//!     ],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RouterConfig
//! ├── topologies: Vec<ShardTopology>    # One per shard type
//! │   ├── shards: Vec<ConnectionDescriptor>   # index == shard id
//! │   └── replicas: Vec<ReplicaDescriptor>
//! ├── entity_shard_types: Map            # Optional entity → shard type overrides
//! ├── health: HealthConfig               # Probe interval / thresholds
//! ├── pool: PoolConfig                   # Pool sizing and timeouts
//! ├── hot_keys: HotKeyConfig             # Hot-key detection and overrides
//! └── replica: ReplicaConfig             # Read-replica routing
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "topologies": [
//!     {
//!       "shard_type": "users",
//!       "shards": [
//!         { "host": "users-0.db", "database": "app_users_0" },
//!         { "host": "users-1.db", "database": "app_users_1" }
//!       ]
//!     }
//!   ],
//!   "health": { "interval": "15s", "probe_timeout": "1s" }
//! }
//! ```

use crate::error::{Result, RouterError};
use crate::replica::LoadBalancingPolicy;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ShardRouter::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterConfig {
    /// One topology per shard type ("users", "content", "ai-tasks", ...).
    pub topologies: Vec<ShardTopology>,

    /// Entity name → shard type overrides (e.g. `"post" => "users"`).
    /// Entities not listed use their built-in shard type.
    #[serde(default)]
    pub entity_shard_types: BTreeMap<String, String>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub hot_keys: HotKeyConfig,

    #[serde(default)]
    pub replica: ReplicaConfig,
}

impl RouterConfig {
    /// Create a config with one test topology of `shard_count` shards per shard type.
    pub fn for_testing(shard_types: &[&str], shard_count: usize) -> Self {
        Self {
            topologies: shard_types
                .iter()
                .map(|t| ShardTopology::for_testing(t, shard_count))
                .collect(),
            ..Default::default()
        }
    }

    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RouterError::Config(format!("invalid JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up the topology for a shard type.
    pub fn topology(&self, shard_type: &str) -> Option<&ShardTopology> {
        self.topologies.iter().find(|t| t.shard_type == shard_type)
    }

    /// Check the configuration for problems that would only surface at routing time.
    pub fn validate(&self) -> Result<()> {
        if self.topologies.is_empty() {
            return Err(RouterError::Config("no topologies configured".to_string()));
        }

        let mut seen = HashSet::new();
        for topology in &self.topologies {
            if topology.shard_type.trim().is_empty() {
                return Err(RouterError::Config("shard_type must not be empty".to_string()));
            }
            if !seen.insert(topology.shard_type.as_str()) {
                return Err(RouterError::Config(format!(
                    "duplicate topology for shard type '{}'",
                    topology.shard_type
                )));
            }
            if topology.shards.is_empty() {
                return Err(RouterError::Config(format!(
                    "shard type '{}' has no shards",
                    topology.shard_type
                )));
            }
            if topology.max_connections == Some(0) {
                return Err(RouterError::Config(format!(
                    "shard type '{}' has max_connections = 0",
                    topology.shard_type
                )));
            }
            let mut replica_ids = HashSet::new();
            for replica in &topology.replicas {
                if !replica_ids.insert(replica.replica_id.as_str()) {
                    return Err(RouterError::Config(format!(
                        "duplicate replica id '{}' in shard type '{}'",
                        replica.replica_id, topology.shard_type
                    )));
                }
            }
        }

        for (entity, shard_type) in &self.entity_shard_types {
            if self.topology(shard_type).is_none() {
                return Err(RouterError::Config(format!(
                    "entity '{}' mapped to unknown shard type '{}'",
                    entity, shard_type
                )));
            }
        }

        if let Some(dedicated) = self.hot_keys.dedicated_target() {
            if self.topologies.iter().all(|t| dedicated >= t.shard_count()) {
                return Err(RouterError::Config(format!(
                    "hot_keys.dedicated_shard {} is out of range for every topology",
                    dedicated
                )));
            }
        }

        self.health.validate()?;
        self.pool.validate()?;
        self.hot_keys.validate()?;
        self.replica.validate()?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Topology
// ═══════════════════════════════════════════════════════════════════════════════

/// Topology for one shard type.
///
/// The position of a descriptor in `shards` is its shard id, so the shard
/// count for modulo placement is `shards.len()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardTopology {
    /// Shard type name ("users", "content", "ai-tasks", "read-replica").
    pub shard_type: String,

    /// One connection descriptor per shard id.
    pub shards: Vec<ConnectionDescriptor>,

    /// Read replicas of the primary (used by the replica manager).
    #[serde(default)]
    pub replicas: Vec<ReplicaDescriptor>,

    /// Minimum time between health probes of the same shard (ms).
    /// `None` means every monitoring tick.
    #[serde(default)]
    pub health_check_interval_ms: Option<u64>,

    /// Per-shard pool size override.
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Connect attempts before giving up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    /// Initial backoff between connect attempts (ms).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Timeout for a single connect attempt (ms).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_retry_attempts() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl ShardTopology {
    /// Create a topology with `shard_count` shards on fake hosts.
    pub fn for_testing(shard_type: &str, shard_count: usize) -> Self {
        Self {
            shard_type: shard_type.to_string(),
            shards: (0..shard_count)
                .map(|i| {
                    ConnectionDescriptor::for_testing(
                        &format!("{}-{}.db.local", shard_type, i),
                        &format!("{}_{}", shard_type.replace('-', "_"), i),
                    )
                })
                .collect(),
            replicas: Vec::new(),
            health_check_interval_ms: None,
            max_connections: None,
            retry_attempts: 1,
            retry_backoff_ms: 10,
            timeout_ms: 500,
        }
    }

    /// Number of shards (the modulo divisor).
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Get the descriptor for a shard id.
    pub fn shard(&self, shard_id: u32) -> Option<&ConnectionDescriptor> {
        self.shards.get(shard_id as usize)
    }

    /// Get a replica descriptor by id.
    pub fn replica(&self, replica_id: &str) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.replica_id == replica_id)
    }

    /// Connect timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Minimum spacing between probes of one shard.
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_ms.map(Duration::from_millis)
    }

    /// Retry schedule used when opening connections to this topology.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry_backoff_ms),
            max_delay: Duration::from_millis(self.retry_backoff_ms.saturating_mul(32)),
            backoff_factor: 2.0,
            connection_timeout: self.timeout(),
        }
    }
}

/// How to reach one physical database.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    pub database: String,
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "app".to_string()
}

impl ConnectionDescriptor {
    /// Create a descriptor for testing.
    pub fn for_testing(host: &str, database: &str) -> Self {
        Self {
            host: host.to_string(),
            port: default_port(),
            user: default_user(),
            password: None,
            database: database.to_string(),
        }
    }

    /// `host:port/database`, safe to log.
    pub fn address(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

// Credentials stay out of logs.
impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}

impl std::fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}

/// A read replica of a shard type's primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    /// Unique replica id (for logging, metrics and pool keys).
    pub replica_id: String,

    pub connection: ConnectionDescriptor,

    /// Priority rank, 1 = most preferred. Used by weighted-priority selection.
    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default)]
    pub region: Option<String>,
}

fn default_priority() -> u32 {
    1
}

impl ReplicaDescriptor {
    /// Create a replica descriptor for testing.
    pub fn for_testing(replica_id: &str, priority: u32) -> Self {
        Self {
            replica_id: replica_id.to_string(),
            connection: ConnectionDescriptor::for_testing(
                &format!("{}.db.local", replica_id),
                "app_replica",
            ),
            priority,
            region: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HealthConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Shard health monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether `ShardRouter::initialize()` starts the background monitor.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Monitoring tick as a duration string (e.g., "30s").
    #[serde(default = "default_health_interval")]
    pub interval: String,

    /// Per-probe deadline as a duration string (e.g., "2s").
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,

    /// Consecutive failures that flip a shard to unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Smoothing factor for the error rate (0 < α ≤ 1).
    #[serde(default = "default_error_rate_alpha")]
    pub error_rate_alpha: f64,

    /// Capacity of the health transition broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_health_interval() -> String {
    "30s".to_string()
}

fn default_probe_timeout() -> String {
    "2s".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_error_rate_alpha() -> f64 {
    0.3
}

fn default_event_buffer() -> usize {
    256
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "30s".to_string(),
            probe_timeout: "2s".to_string(),
            failure_threshold: 3,
            error_rate_alpha: 0.3,
            event_buffer: 256,
        }
    }
}

impl HealthConfig {
    /// Parse the interval string to a Duration (falls back to 30s).
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }

    /// Parse the probe timeout string to a Duration (falls back to 2s).
    pub fn probe_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.probe_timeout).unwrap_or(Duration::from_secs(2))
    }

    fn validate(&self) -> Result<()> {
        humantime::parse_duration(&self.interval)
            .map_err(|e| RouterError::Config(format!("health.interval: {}", e)))?;
        humantime::parse_duration(&self.probe_timeout)
            .map_err(|e| RouterError::Config(format!("health.probe_timeout: {}", e)))?;
        if self.failure_threshold == 0 {
            return Err(RouterError::Config("health.failure_threshold must be > 0".to_string()));
        }
        if !(self.error_rate_alpha > 0.0 && self.error_rate_alpha <= 1.0) {
            return Err(RouterError::Config(
                "health.error_rate_alpha must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PoolConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection pool configuration (applies to every pool unless a topology overrides it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum connections per (shard type, shard id).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle connections kept by the sweeper regardless of age.
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// How long `acquire` waits on a saturated pool (ms).
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Idle connections older than this are reclaimed (seconds).
    #[serde(default = "default_idle_timeout_sec")]
    pub idle_timeout_sec: u64,

    /// How often the idle sweep runs (seconds).
    #[serde(default = "default_sweep_interval_sec")]
    pub sweep_interval_sec: u64,
}

fn default_max_connections() -> usize {
    10
}

fn default_min_idle() -> usize {
    1
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_sec() -> u64 {
    300
}

fn default_sweep_interval_sec() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_idle: 1,
            acquire_timeout_ms: 5_000,
            idle_timeout_sec: 300,
            sweep_interval_sec: 60,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_sec)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_sec)
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(RouterError::Config("pool.max_connections must be > 0".to_string()));
        }
        if self.min_idle > self.max_connections {
            return Err(RouterError::Config(
                "pool.min_idle must not exceed pool.max_connections".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HotKeyConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Hot-key detection and override configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotKeyConfig {
    /// Whether activity is tracked at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Activity score at which a key flips hot.
    #[serde(default = "default_hot_threshold")]
    pub hot_threshold: f64,

    /// Length of an activity window (ms).
    #[serde(default = "default_activity_window_ms")]
    pub activity_window_ms: u64,

    /// Minimum time a key stays hot (ms).
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Use `score·decay + 1` instead of the raw request count.
    #[serde(default = "default_false")]
    pub decay_enabled: bool,

    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,

    /// Shard id that absorbs hot keys when dedicated routing is enabled.
    #[serde(default)]
    pub dedicated_shard: Option<u32>,

    #[serde(default = "default_false")]
    pub dedicated_routing_enabled: bool,

    /// Flag hot keys for replicated handling by the caller.
    #[serde(default = "default_false")]
    pub replication_enabled: bool,

    /// Fall back to standard routing when the dedicated shard is unhealthy.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,

    /// How often stale records are purged (ms).
    #[serde(default = "default_hot_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Upper bound on tracked keys; new keys are not tracked past it.
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,
}

fn default_hot_threshold() -> f64 {
    10.0
}

fn default_activity_window_ms() -> u64 {
    60_000
}

fn default_cooldown_ms() -> u64 {
    300_000
}

fn default_decay_factor() -> f64 {
    0.95
}

fn default_hot_sweep_interval_ms() -> u64 {
    60_000
}

fn default_max_tracked_keys() -> usize {
    100_000
}

impl Default for HotKeyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_threshold: 10.0,
            activity_window_ms: 60_000,
            cooldown_ms: 300_000,
            decay_enabled: false,
            decay_factor: 0.95,
            dedicated_shard: None,
            dedicated_routing_enabled: false,
            replication_enabled: false,
            fallback_enabled: true,
            sweep_interval_ms: 60_000,
            max_tracked_keys: 100_000,
        }
    }
}

impl HotKeyConfig {
    pub fn activity_window(&self) -> Duration {
        Duration::from_millis(self.activity_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Dedicated shard id, if dedicated routing is switched on.
    pub fn dedicated_target(&self) -> Option<u32> {
        if self.dedicated_routing_enabled {
            self.dedicated_shard
        } else {
            None
        }
    }

    fn validate(&self) -> Result<()> {
        if self.hot_threshold <= 0.0 {
            return Err(RouterError::Config("hot_keys.hot_threshold must be > 0".to_string()));
        }
        if self.activity_window_ms == 0 {
            return Err(RouterError::Config(
                "hot_keys.activity_window_ms must be > 0".to_string(),
            ));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor < 1.0) {
            return Err(RouterError::Config(
                "hot_keys.decay_factor must be in (0, 1)".to_string(),
            ));
        }
        if self.dedicated_routing_enabled && self.dedicated_shard.is_none() {
            return Err(RouterError::Config(
                "hot_keys.dedicated_routing_enabled requires dedicated_shard".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicaConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-replica routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Topology whose primary/replicas the manager serves.
    #[serde(default = "default_replica_shard_type")]
    pub shard_type: String,

    /// Shard id of the primary within that topology.
    #[serde(default)]
    pub shard_id: u32,

    #[serde(default)]
    pub policy: LoadBalancingPolicy,

    /// Lag bound for `Consistency::Bounded` when the caller gives none (ms).
    #[serde(default = "default_max_lag_ms")]
    pub default_max_lag_ms: u64,

    /// Consecutive query failures that open a replica's circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an unhealthy replica is excluded before re-probing (seconds).
    #[serde(default = "default_replica_cooldown_sec")]
    pub cooldown_sec: u64,

    /// Default per-query deadline (ms).
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// How often replicas are probed (seconds).
    #[serde(default = "default_replica_health_interval_sec")]
    pub health_check_interval_sec: u64,

    /// Per-probe deadline (ms).
    #[serde(default = "default_replica_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// EWMA smoothing factor for latency.
    #[serde(default = "default_latency_alpha")]
    pub latency_alpha: f64,

    /// Samples kept for percentile estimates.
    #[serde(default = "default_latency_history")]
    pub latency_history: usize,
}

fn default_replica_shard_type() -> String {
    "read-replica".to_string()
}

fn default_max_lag_ms() -> u64 {
    1_000
}

fn default_replica_cooldown_sec() -> u64 {
    30
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_replica_health_interval_sec() -> u64 {
    10
}

fn default_replica_probe_timeout_ms() -> u64 {
    2_000
}

fn default_latency_alpha() -> f64 {
    0.2
}

fn default_latency_history() -> usize {
    100
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            shard_type: default_replica_shard_type(),
            shard_id: 0,
            policy: LoadBalancingPolicy::default(),
            default_max_lag_ms: 1_000,
            failure_threshold: 3,
            cooldown_sec: 30,
            query_timeout_ms: 5_000,
            health_check_interval_sec: 10,
            probe_timeout_ms: 2_000,
            latency_alpha: 0.2,
            latency_history: 100,
        }
    }
}

impl ReplicaConfig {
    pub fn default_max_lag(&self) -> Duration {
        Duration::from_millis(self.default_max_lag_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_sec)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_sec)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(RouterError::Config("replica.failure_threshold must be > 0".to_string()));
        }
        if !(self.latency_alpha > 0.0 && self.latency_alpha <= 1.0) {
            return Err(RouterError::Config(
                "replica.latency_alpha must be in (0, 1]".to_string(),
            ));
        }
        if self.latency_history == 0 {
            return Err(RouterError::Config("replica.latency_history must be > 0".to_string()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
