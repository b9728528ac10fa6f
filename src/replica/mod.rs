// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-replica routing.
//!
//! The [`ReplicaManager`] serves reads for one primary (a shard of the
//! configured shard type) and its replicas, choosing a replica per read under
//! a [`Consistency`] level and a [`LoadBalancingPolicy`]. Writes always go to
//! the primary.
//!
//! # Read path
//!
//! ```text
//! read(query, options)
//!   ├─ Strong ─────────────────────────────────────────────► primary
//!   └─ Eventual / Bounded
//!        ├─ candidates = available replicas (lag < max_lag for Bounded)
//!        ├─ policy picks one ── ok ─────────────────────────► replica
//!        │                   └─ fails → one retry elsewhere ► replica
//!        └─ nothing left ── fallback counter ───────────────► primary
//! ```
//!
//! Replica failures are absorbed. Only a failing primary surfaces an error.

pub mod policy;
pub mod state;

pub use policy::{Candidate, LoadBalancingPolicy, ReplicaSelector};
pub use state::{ReplicaSnapshot, ReplicaState};

use crate::backend::Row;
use crate::config::ReplicaConfig;
use crate::error::{Result, RouterError};
use crate::health::state::epoch_millis;
use crate::metrics;
use crate::pool::{ConnectionPoolManager, PoolKey, PooledConnection};
use crate::topology::TopologyRegistry;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Read consistency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Any available replica.
    #[default]
    Eventual,
    /// Only replicas whose measured lag is below the bound.
    Bounded,
    /// Primary only.
    Strong,
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub consistency: Consistency,
    /// Lag bound for `Bounded`; the configured default when `None`.
    pub max_lag: Option<Duration>,
    /// Query deadline; the configured default when `None`.
    pub timeout: Option<Duration>,
}

impl ReadOptions {
    pub fn eventual() -> Self {
        Self::default()
    }

    pub fn strong() -> Self {
        Self {
            consistency: Consistency::Strong,
            ..Default::default()
        }
    }

    pub fn bounded(max_lag: Duration) -> Self {
        Self {
            consistency: Consistency::Bounded,
            max_lag: Some(max_lag),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Rows from a read plus where they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub rows: Vec<Row>,
    pub latency: Duration,
    pub served_by_replica: bool,
    /// `None` when the primary served the read.
    pub replica_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub rows: Vec<Row>,
    pub latency: Duration,
}

/// Counters and per-replica state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaStatistics {
    pub policy: LoadBalancingPolicy,
    pub replica_reads: u64,
    pub primary_reads: u64,
    pub writes: u64,
    /// Reads that wanted a replica but were served by the primary.
    pub fallbacks: u64,
    /// Reads retried on a second replica.
    pub retries: u64,
    /// Why the most recent fallback happened.
    pub last_fallback: Option<String>,
    pub available_replicas: usize,
    pub replicas: Vec<ReplicaSnapshot>,
}

#[derive(Debug, Default)]
struct Counters {
    replica_reads: AtomicU64,
    primary_reads: AtomicU64,
    writes: AtomicU64,
    fallbacks: AtomicU64,
    retries: AtomicU64,
}

struct HealthTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Routes reads across replicas of one primary.
pub struct ReplicaManager {
    config: ReplicaConfig,
    pools: Arc<ConnectionPoolManager>,
    replicas: RwLock<Vec<ReplicaState>>,
    selector: ReplicaSelector,
    counters: Counters,
    last_fallback: Mutex<Option<String>>,
    health_task: Mutex<Option<HealthTask>>,
}

impl ReplicaManager {
    /// Create a manager for the topology named by `config.shard_type`.
    ///
    /// Fails with `NoConfiguration` if that topology does not exist and with
    /// `Config` if `config.shard_id` is out of range.
    pub fn new(
        config: ReplicaConfig,
        topology: Arc<TopologyRegistry>,
        pools: Arc<ConnectionPoolManager>,
    ) -> Result<Self> {
        let primary = topology.require(&config.shard_type)?;
        if config.shard_id >= primary.shard_count() {
            return Err(RouterError::Config(format!(
                "replica primary shard {} out of range for '{}' ({} shards)",
                config.shard_id,
                config.shard_type,
                primary.shard_count()
            )));
        }
        if primary.replicas.is_empty() {
            warn!(
                shard_type = %config.shard_type,
                "No replicas configured; every read will use the primary"
            );
        }

        let replicas = primary
            .replicas
            .iter()
            .map(|r| ReplicaState::new(r, config.latency_alpha, config.latency_history))
            .collect();

        info!(
            shard_type = %config.shard_type,
            shard_id = config.shard_id,
            replicas = primary.replicas.len(),
            policy = %config.policy,
            "Replica manager created"
        );

        Ok(Self {
            selector: ReplicaSelector::new(config.policy),
            config,
            pools,
            replicas: RwLock::new(replicas),
            counters: Counters::default(),
            last_fallback: Mutex::new(None),
            health_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Run a read under the requested consistency level.
    ///
    /// # Errors
    ///
    /// Only primary failures surface (`Query`, `Timeout`, `Connection`,
    /// `PoolExhausted`, `Shutdown`).
    pub async fn read(
        &self,
        query: &str,
        params: &[Value],
        options: ReadOptions,
    ) -> Result<ReadResult> {
        let query_timeout = options.timeout.unwrap_or_else(|| self.config.query_timeout());

        let max_lag = match options.consistency {
            Consistency::Strong => {
                return self.read_primary(query, params, query_timeout).await;
            }
            Consistency::Bounded => Some(
                options
                    .max_lag
                    .unwrap_or_else(|| self.config.default_max_lag()),
            ),
            Consistency::Eventual => None,
        };

        let mut tried: Vec<String> = Vec::new();
        for attempt in 0..2 {
            let Some(replica_id) = self.pick(max_lag, &tried) else {
                break;
            };
            if attempt > 0 {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                metrics::record_replica_retry();
            }

            match self.query_replica(&replica_id, query, params, query_timeout).await {
                Ok((rows, latency)) => {
                    self.counters.replica_reads.fetch_add(1, Ordering::Relaxed);
                    return Ok(ReadResult {
                        rows,
                        latency,
                        served_by_replica: true,
                        replica_id: Some(replica_id),
                    });
                }
                Err(e) => {
                    warn!(
                        replica_id = %replica_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Replica read failed"
                    );
                    tried.push(replica_id);
                }
            }
        }

        let (label, unavailable) = if tried.is_empty() {
            (
                "no_candidate",
                RouterError::ReplicaUnavailable {
                    reason: format!("no replica eligible for {:?} read", options.consistency),
                },
            )
        } else {
            (
                "replica_failed",
                RouterError::ReplicaUnavailable {
                    reason: format!("tried {}", tried.join(", ")),
                },
            )
        };
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        metrics::record_replica_fallback(label);
        debug!(
            consistency = ?options.consistency,
            reason = label,
            error = %unavailable,
            "Falling back to primary"
        );
        *self.last_fallback.lock() = Some(unavailable.to_string());
        self.read_primary(query, params, query_timeout).await
    }

    /// Run a write on the primary.
    pub async fn write(&self, query: &str, params: &[Value]) -> Result<WriteResult> {
        let (rows, latency) = self
            .query_primary("write", query, params, self.config.query_timeout())
            .await?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(WriteResult { rows, latency })
    }

    async fn read_primary(
        &self,
        query: &str,
        params: &[Value],
        query_timeout: Duration,
    ) -> Result<ReadResult> {
        let (rows, latency) = self
            .query_primary("read", query, params, query_timeout)
            .await?;
        self.counters.primary_reads.fetch_add(1, Ordering::Relaxed);
        Ok(ReadResult {
            rows,
            latency,
            served_by_replica: false,
            replica_id: None,
        })
    }

    async fn query_primary(
        &self,
        operation: &str,
        query: &str,
        params: &[Value],
        query_timeout: Duration,
    ) -> Result<(Vec<Row>, Duration)> {
        let started = Instant::now();
        let result = match self
            .pools
            .acquire(self.config.shard_id, &self.config.shard_type)
            .await
        {
            Ok(conn) => run_query(conn, "query", query, params, query_timeout).await,
            Err(e) => Err(e),
        };
        let latency = started.elapsed();
        metrics::record_primary_query(operation, result.is_ok(), latency);
        result.map(|rows| (rows, latency))
    }

    async fn query_replica(
        &self,
        replica_id: &str,
        query: &str,
        params: &[Value],
        query_timeout: Duration,
    ) -> Result<(Vec<Row>, Duration)> {
        let started = Instant::now();
        let result = match self
            .pools
            .acquire_replica(&self.config.shard_type, self.config.shard_id, replica_id)
            .await
        {
            Ok(conn) => run_query(conn, "query", query, params, query_timeout).await,
            Err(e) => Err(e),
        };
        let latency = started.elapsed();
        metrics::record_replica_query(replica_id, result.is_ok(), latency);

        let mut replicas = self.replicas.write();
        if let Some(state) = replicas.iter_mut().find(|r| r.replica_id == replica_id) {
            match &result {
                Ok(_) => state.record_success(latency),
                // Busy is not broken
                Err(RouterError::PoolExhausted { .. }) => {
                    debug!(replica_id = %replica_id, "Replica pool saturated, not counted as a failure");
                }
                Err(_) => {
                    let opened = state.record_failure(
                        Instant::now(),
                        self.config.failure_threshold,
                        self.config.cooldown(),
                    );
                    if opened {
                        circuit_opened(state, self.config.cooldown());
                    }
                }
            }
        }
        drop(replicas);

        result.map(|rows| (rows, latency))
    }

    /// Choose a replica, skipping those already tried.
    fn pick(&self, max_lag: Option<Duration>, exclude: &[String]) -> Option<String> {
        let replicas = self.replicas.read();
        let candidates: Vec<Candidate<'_>> = replicas
            .iter()
            .filter(|r| r.is_available())
            .filter(|r| !exclude.contains(&r.replica_id))
            .filter(|r| match max_lag {
                // Unknown lag never qualifies
                Some(max) => r.lag().map(|lag| lag < max).unwrap_or(false),
                None => true,
            })
            .map(|r| Candidate {
                replica_id: &r.replica_id,
                priority: r.priority,
                ewma_latency: r.ewma_latency(),
            })
            .collect();

        self.selector
            .select(&candidates)
            .map(|i| candidates[i].replica_id.to_string())
    }

    /// Probe every replica once, concurrently. Returns the updated snapshots.
    pub async fn probe_replicas(&self) -> Vec<ReplicaSnapshot> {
        let ids: Vec<String> = self
            .replicas
            .read()
            .iter()
            .map(|r| r.replica_id.clone())
            .collect();

        join_all(ids.iter().map(|id| self.probe_replica(id)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn probe_replica(&self, replica_id: &str) -> Option<ReplicaSnapshot> {
        let probe_timeout = self.config.probe_timeout();
        let outcome = match timeout(probe_timeout, self.ping_replica(replica_id)).await {
            Ok(result) => result,
            Err(_) => Err(RouterError::timeout("probe", replica_id, probe_timeout)),
        };

        let now = Instant::now();
        let mut replicas = self.replicas.write();
        let state = replicas.iter_mut().find(|r| r.replica_id == replica_id)?;

        match outcome {
            Ok(lag) => {
                if let Some(lag) = lag {
                    metrics::set_replica_lag_ms(replica_id, lag.as_millis() as u64);
                }
                if state.record_probe_success(lag, now, epoch_millis()) {
                    metrics::record_replica_circuit(replica_id, "closed");
                    info!(replica_id = %replica_id, "Replica circuit closed after successful probe");
                }
                debug!(
                    replica_id = %replica_id,
                    lag_ms = lag.map(|l| l.as_millis() as u64),
                    "Replica probe succeeded"
                );
            }
            Err(e) => {
                warn!(replica_id = %replica_id, error = %e, "Replica probe failed");
                let opened = state.record_probe_failure(
                    now,
                    epoch_millis(),
                    self.config.failure_threshold,
                    self.config.cooldown(),
                );
                if opened {
                    circuit_opened(state, self.config.cooldown());
                }
            }
        }
        Some(state.snapshot())
    }

    async fn ping_replica(&self, replica_id: &str) -> Result<Option<Duration>> {
        let key = PoolKey::replica(&self.config.shard_type, self.config.shard_id, replica_id);
        let mut conn = self.pools.acquire_for_probe(&key).await?;
        if let Err(e) = conn.ping().await {
            conn.invalidate();
            return Err(RouterError::Query {
                target: conn.key().to_string(),
                message: e.to_string(),
            });
        }
        match conn.replication_lag().await {
            Ok(lag) => Ok(lag),
            Err(e) => {
                debug!(replica_id = %replica_id, error = %e, "Replica did not report lag");
                Ok(None)
            }
        }
    }

    /// Start periodic replica probes. Returns `false` if already running.
    pub fn start_health_checks(self: &Arc<Self>) -> bool {
        let mut slot = self.health_task.lock();
        if slot.is_some() {
            return false;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let period = self.config.health_check_interval();

        info!(
            interval_ms = period.as_millis() as u64,
            "Starting replica health checks"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshots = manager.probe_replicas().await;
                        let available = snapshots.iter().filter(|s| s.available).count();
                        debug!(probed = snapshots.len(), available, "Replica health check complete");
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Replica health checks stopping");
                            break;
                        }
                    }
                }
            }
        });

        *slot = Some(HealthTask { shutdown, handle });
        true
    }

    /// Stop periodic probes and wait for the task to exit.
    pub async fn stop_health_checks(&self) {
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Replica health task ended abnormally");
            }
        }
    }

    pub fn is_checking_health(&self) -> bool {
        self.health_task.lock().is_some()
    }

    /// Snapshot of one replica.
    pub fn replica(&self, replica_id: &str) -> Option<ReplicaSnapshot> {
        self.replicas
            .read()
            .iter()
            .find(|r| r.replica_id == replica_id)
            .map(ReplicaState::snapshot)
    }

    pub fn statistics(&self) -> ReplicaStatistics {
        let replicas: Vec<ReplicaSnapshot> =
            self.replicas.read().iter().map(ReplicaState::snapshot).collect();
        ReplicaStatistics {
            policy: self.selector.policy(),
            replica_reads: self.counters.replica_reads.load(Ordering::Relaxed),
            primary_reads: self.counters.primary_reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            last_fallback: self.last_fallback.lock().clone(),
            available_replicas: replicas.iter().filter(|r| r.available).count(),
            replicas,
        }
    }
}

impl std::fmt::Debug for ReplicaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaManager")
            .field("shard_type", &self.config.shard_type)
            .field("shard_id", &self.config.shard_id)
            .field("policy", &self.selector.policy())
            .field("replicas", &self.replicas.read().len())
            .finish()
    }
}

fn circuit_opened(state: &ReplicaState, cooldown: Duration) {
    metrics::record_replica_circuit(&state.replica_id, "open");
    warn!(
        replica_id = %state.replica_id,
        failures = state.consecutive_failures(),
        cooldown_sec = cooldown.as_secs(),
        "Replica circuit opened"
    );
}

/// Run one query on a checked-out connection. Broken connections are discarded.
async fn run_query(
    mut conn: PooledConnection,
    operation: &str,
    query: &str,
    params: &[Value],
    query_timeout: Duration,
) -> Result<Vec<Row>> {
    let target = conn.key().to_string();
    match timeout(query_timeout, conn.query(query, params)).await {
        Ok(Ok(rows)) => Ok(rows),
        Ok(Err(e)) => {
            conn.invalidate();
            Err(RouterError::Query {
                target,
                message: e.to_string(),
            })
        }
        Err(_) => {
            conn.invalidate();
            Err(RouterError::timeout(operation, target, query_timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BoxFuture, Connection, Connector};
    use crate::config::{ConnectionDescriptor, PoolConfig, ReplicaDescriptor, ShardTopology};
    use serde_json::json;
    use std::collections::{HashMap, HashSet};

    /// Hosts listed in `failing` fail queries and pings.
    #[derive(Default)]
    struct Backend {
        failing: parking_lot::Mutex<HashSet<String>>,
        lag: parking_lot::Mutex<HashMap<String, Duration>>,
    }

    struct ScriptedConnector(Arc<Backend>);

    struct ScriptedConnection {
        host: String,
        backend: Arc<Backend>,
    }

    impl ScriptedConnection {
        fn failing(&self) -> bool {
            self.backend.failing.lock().contains(&self.host)
        }
    }

    impl Connection for ScriptedConnection {
        fn ping(&mut self) -> BoxFuture<'_, ()> {
            let failing = self.failing();
            Box::pin(async move {
                if failing {
                    Err("connection reset".into())
                } else {
                    Ok(())
                }
            })
        }

        fn query<'a>(&'a mut self, _sql: &'a str, _params: &'a [Value]) -> BoxFuture<'a, Vec<Row>> {
            let failing = self.failing();
            Box::pin(async move {
                if failing {
                    Err("query failed".into())
                } else {
                    Ok(vec![json!({ "host": self.host })])
                }
            })
        }

        fn replication_lag(&mut self) -> BoxFuture<'_, Option<Duration>> {
            let lag = self
                .backend
                .lag
                .lock()
                .get(&self.host)
                .copied()
                .unwrap_or(Duration::ZERO);
            Box::pin(async move { Ok(Some(lag)) })
        }
    }

    impl Connector for ScriptedConnector {
        fn connect<'a>(
            &'a self,
            descriptor: &'a ConnectionDescriptor,
        ) -> BoxFuture<'a, Box<dyn Connection>> {
            let backend = Arc::clone(&self.0);
            Box::pin(async move {
                Ok(Box::new(ScriptedConnection {
                    host: descriptor.host.clone(),
                    backend,
                }) as Box<dyn Connection>)
            })
        }
    }

    fn manager_with(policy: LoadBalancingPolicy, replicas: &[&str]) -> (ReplicaManager, Arc<Backend>) {
        build(policy, replicas, None)
    }

    fn build(
        policy: LoadBalancingPolicy,
        replicas: &[&str],
        max_connections: Option<usize>,
    ) -> (ReplicaManager, Arc<Backend>) {
        let mut topology = ShardTopology::for_testing("read-replica", 1);
        topology.max_connections = max_connections;
        for (i, id) in replicas.iter().enumerate() {
            topology
                .replicas
                .push(ReplicaDescriptor::for_testing(id, i as u32 + 1));
        }
        let registry = Arc::new(TopologyRegistry::new(vec![topology]));
        let backend = Arc::new(Backend::default());
        let pools = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&registry),
            Arc::new(ScriptedConnector(Arc::clone(&backend))),
            PoolConfig {
                acquire_timeout_ms: 50,
                ..Default::default()
            },
        ));
        let config = ReplicaConfig {
            policy,
            ..Default::default()
        };
        let manager = ReplicaManager::new(config, registry, pools).unwrap();
        (manager, backend)
    }

    fn manager(replicas: &[&str]) -> (ReplicaManager, Arc<Backend>) {
        manager_with(LoadBalancingPolicy::RoundRobin, replicas)
    }

    fn fail(backend: &Backend, host: &str) {
        backend.failing.lock().insert(host.to_string());
    }

    fn heal(backend: &Backend, host: &str) {
        backend.failing.lock().remove(host);
    }

    #[test]
    fn test_read_options() {
        assert_eq!(ReadOptions::default().consistency, Consistency::Eventual);
        assert_eq!(ReadOptions::strong().consistency, Consistency::Strong);
        let bounded = ReadOptions::bounded(Duration::from_millis(250))
            .with_timeout(Duration::from_secs(1));
        assert_eq!(bounded.max_lag, Some(Duration::from_millis(250)));
        assert_eq!(bounded.timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_new_requires_topology() {
        let registry = Arc::new(TopologyRegistry::new(vec![ShardTopology::for_testing("users", 1)]));
        let pools = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&registry),
            Arc::new(crate::backend::NoOpConnector),
            PoolConfig::default(),
        ));
        let err = ReplicaManager::new(ReplicaConfig::default(), Arc::clone(&registry), Arc::clone(&pools))
            .unwrap_err();
        assert!(matches!(err, RouterError::NoConfiguration { .. }));

        let config = ReplicaConfig {
            shard_type: "users".to_string(),
            shard_id: 5,
            ..Default::default()
        };
        assert!(matches!(
            ReplicaManager::new(config, registry, pools),
            Err(RouterError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_eventual_read_served_by_replica() {
        let (manager, _) = manager(&["r1", "r2"]);
        let result = manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
        assert!(result.served_by_replica);
        assert_eq!(result.replica_id.as_deref(), Some("r1"));
        assert_eq!(result.rows[0]["host"], "r1.db.local");

        let result = manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
        assert_eq!(result.replica_id.as_deref(), Some("r2"));
        assert_eq!(manager.statistics().replica_reads, 2);
    }

    #[tokio::test]
    async fn test_strong_read_uses_primary() {
        let (manager, _) = manager(&["r1", "r2"]);
        for _ in 0..10 {
            let result = manager.read("SELECT 1", &[], ReadOptions::strong()).await.unwrap();
            assert!(!result.served_by_replica);
            assert!(result.replica_id.is_none());
            assert_eq!(result.rows[0]["host"], "read-replica-0.db.local");
        }
        let stats = manager.statistics();
        assert_eq!(stats.primary_reads, 10);
        assert_eq!(stats.fallbacks, 0);
    }

    #[tokio::test]
    async fn test_write_uses_primary() {
        let (manager, _) = manager(&["r1"]);
        let result = manager.write("UPDATE t SET x = 1", &[json!(1)]).await.unwrap();
        assert_eq!(result.rows[0]["host"], "read-replica-0.db.local");
        assert_eq!(manager.statistics().writes, 1);
    }

    #[tokio::test]
    async fn test_no_replicas_falls_back() {
        let (manager, _) = manager(&[]);
        let result = manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
        assert!(!result.served_by_replica);
        assert_eq!(manager.statistics().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_fallback_reason_reported() {
        let (manager, _) = manager(&[]);
        assert_eq!(manager.statistics().last_fallback, None);

        manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
        let reason = manager.statistics().last_fallback.unwrap();
        assert_eq!(reason, "No replica available: no replica eligible for Eventual read");
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_replica_keeps_circuit_closed() {
        let (manager, _) = build(LoadBalancingPolicy::RoundRobin, &["r1"], Some(1));
        let _held = manager
            .pools
            .acquire_replica("read-replica", 0, "r1")
            .await
            .unwrap();

        for _ in 0..3 {
            let result = manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
            assert!(!result.served_by_replica);
        }

        let r1 = manager.replica("r1").unwrap();
        assert!(!r1.circuit_open);
        assert!(r1.available);
        assert_eq!(r1.failures, 0);
        assert_eq!(r1.consecutive_failures, 0);

        let stats = manager.statistics();
        assert_eq!(stats.fallbacks, 3);
        assert_eq!(stats.last_fallback.as_deref(), Some("No replica available: tried r1"));

        // Probes do not queue behind application traffic
        let snapshots = manager.probe_replicas().await;
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].healthy);
        assert_eq!(snapshots[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_failed_replica_retried_elsewhere() {
        let (manager, backend) = manager(&["r1", "r2"]);
        fail(&backend, "r1.db.local");

        let result = manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
        assert_eq!(result.replica_id.as_deref(), Some("r2"));

        let stats = manager.statistics();
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.fallbacks, 0);
        assert_eq!(manager.replica("r1").unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_all_replicas_failing_falls_back_to_primary() {
        let (manager, backend) = manager(&["r1", "r2"]);
        fail(&backend, "r1.db.local");
        fail(&backend, "r2.db.local");

        let result = manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
        assert!(!result.served_by_replica);
        let stats = manager.statistics();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.primary_reads, 1);
    }

    #[tokio::test]
    async fn test_primary_failure_surfaces() {
        let (manager, backend) = manager(&[]);
        fail(&backend, "read-replica-0.db.local");
        let err = manager.read("SELECT 1", &[], ReadOptions::strong()).await.unwrap_err();
        assert!(matches!(err, RouterError::Query { .. }));
        assert!(manager.write("DELETE", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_bounded_needs_measured_lag() {
        let (manager, backend) = manager(&["r1", "r2"]);

        // Lag unknown before the first probe
        let result = manager
            .read("SELECT 1", &[], ReadOptions::bounded(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(!result.served_by_replica);

        backend
            .lag
            .lock()
            .insert("r1.db.local".to_string(), Duration::from_secs(5));
        manager.probe_replicas().await;

        for _ in 0..5 {
            let result = manager
                .read("SELECT 1", &[], ReadOptions::bounded(Duration::from_secs(1)))
                .await
                .unwrap();
            assert_eq!(result.replica_id.as_deref(), Some("r2"));
        }
        assert_eq!(manager.replica("r1").unwrap().lag_ms, Some(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_needs_probe() {
        let (manager, backend) = manager(&["r1"]);
        fail(&backend, "r1.db.local");

        for _ in 0..3 {
            let result = manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
            assert!(!result.served_by_replica);
        }
        let r1 = manager.replica("r1").unwrap();
        assert!(r1.circuit_open);
        assert_eq!(r1.failures, 3);

        // Open circuit: not even tried
        heal(&backend, "r1.db.local");
        manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
        assert_eq!(manager.replica("r1").unwrap().queries, 3);

        // Cooldown over, still excluded until a probe succeeds
        tokio::time::advance(Duration::from_secs(31)).await;
        let result = manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
        assert!(!result.served_by_replica);

        manager.probe_replicas().await;
        let result = manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
        assert_eq!(result.replica_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_probe_failure_excludes_replica() {
        let (manager, backend) = manager(&["r1", "r2"]);
        fail(&backend, "r2.db.local");
        let snapshots = manager.probe_replicas().await;
        assert_eq!(snapshots.len(), 2);

        let stats = manager.statistics();
        assert_eq!(stats.available_replicas, 1);
        for _ in 0..4 {
            let result = manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
            assert_eq!(result.replica_id.as_deref(), Some("r1"));
        }
    }

    #[tokio::test]
    async fn test_latency_recorded() {
        let (manager, _) = manager_with(LoadBalancingPolicy::LatencyBased, &["r1", "r2", "r3"]);
        for _ in 0..20 {
            manager.read("SELECT 1", &[], ReadOptions::eventual()).await.unwrap();
        }
        let stats = manager.statistics();
        assert_eq!(stats.policy, LoadBalancingPolicy::LatencyBased);
        assert_eq!(stats.replica_reads, 20);
        let served: u64 = stats.replicas.iter().map(|r| r.queries).sum();
        assert_eq!(served, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_checks_start_stop() {
        let (manager, _) = manager(&["r1"]);
        let manager = Arc::new(manager);
        assert!(manager.start_health_checks());
        assert!(!manager.start_health_checks());

        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.replica("r1").unwrap().last_checked_ms.is_some());

        manager.stop_health_checks().await;
        assert!(!manager.is_checking_health());
    }
}
