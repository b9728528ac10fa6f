// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard health monitoring.
//!
//! The [`HealthMonitor`] owns one [`ShardHealthRecord`] per
//! (shard type, shard id). Records are only written here: by live probes
//! ([`check_health`](HealthMonitor::check_health), the background monitor)
//! or by data-access code reporting an observed outcome
//! ([`record_probe`](HealthMonitor::record_probe)).
//!
//! The routing hot path only reads the cache
//! ([`cached_health`](HealthMonitor::cached_health),
//! [`is_routable`](HealthMonitor::is_routable)) and never waits on I/O.
//!
//! # Probing
//!
//! ```text
//! tick ──► for every shard (respecting per-topology spacing)
//!            └─ timeout(probe_timeout, pool.acquire_for_probe + ping)
//!          join_all (one slow shard cannot hold up the others beyond its deadline)
//!          └─► transition() ──► record updated ──► HealthEvent on broadcast
//! ```

pub mod state;

pub use state::{HealthEvent, HealthState, ProbeOutcome};

use crate::config::HealthConfig;
use crate::error::{Result, RouterError};
use crate::metrics;
use crate::pool::{ConnectionPoolManager, PoolKey};
use crate::topology::TopologyRegistry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use state::{transition, HealthCounters, TransitionParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Cached health of one shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardHealthRecord {
    pub shard_type: String,
    pub shard_id: u32,
    pub state: HealthState,
    /// `false` exactly when the state is `Unhealthy`.
    pub is_healthy: bool,
    pub last_response_time: Option<Duration>,
    /// Epoch ms of the last probe, `None` if never probed.
    pub last_checked: Option<u64>,
    pub consecutive_failures: u32,
    /// Exponentially smoothed failure rate in `[0, 1]`.
    pub error_rate: f64,
    pub last_error: Option<String>,
}

impl ShardHealthRecord {
    /// A never-probed record.
    pub fn new(shard_type: &str, shard_id: u32) -> Self {
        Self {
            shard_type: shard_type.to_string(),
            shard_id,
            state: HealthState::Unknown,
            is_healthy: true,
            last_response_time: None,
            last_checked: None,
            consecutive_failures: 0,
            error_rate: 0.0,
            last_error: None,
        }
    }

    fn counters(&self) -> HealthCounters {
        HealthCounters {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            error_rate: self.error_rate,
        }
    }

    fn apply(&mut self, outcome: &ProbeOutcome, params: &TransitionParams) -> Option<HealthEvent> {
        let (next, event) = transition(
            &self.shard_type,
            self.shard_id,
            self.counters(),
            outcome,
            params,
        );
        self.state = next.state;
        self.is_healthy = next.state.is_routable();
        self.consecutive_failures = next.consecutive_failures;
        self.error_rate = next.error_rate;
        self.last_checked = Some(state::epoch_millis());
        self.last_response_time = outcome.latency();
        if let ProbeOutcome::Failure { error, .. } = outcome {
            self.last_error = Some(error.clone());
        }
        event
    }
}

/// Count of shards per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub unknown: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

impl HealthSummary {
    pub fn total(&self) -> usize {
        self.unknown + self.healthy + self.degraded + self.unhealthy
    }
}

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Probes shards and caches their health.
pub struct HealthMonitor {
    topology: Arc<TopologyRegistry>,
    pools: Arc<ConnectionPoolManager>,
    config: HealthConfig,
    params: TransitionParams,
    records: DashMap<(String, u32), ShardHealthRecord>,
    last_probe: DashMap<(String, u32), Instant>,
    events: broadcast::Sender<HealthEvent>,
    monitor: Mutex<Option<MonitorTask>>,
}

impl HealthMonitor {
    pub fn new(
        topology: Arc<TopologyRegistry>,
        pools: Arc<ConnectionPoolManager>,
        config: HealthConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let params = TransitionParams {
            failure_threshold: config.failure_threshold.max(1),
            alpha: config.error_rate_alpha,
        };
        Self {
            topology,
            pools,
            config,
            params,
            records: DashMap::new(),
            last_probe: DashMap::new(),
            events,
            monitor: Mutex::new(None),
        }
    }

    /// Subscribe to health transitions.
    ///
    /// Slow receivers that fall more than `event_buffer` events behind see
    /// `RecvError::Lagged` and skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Create an `Unknown` record for a shard if none exists.
    pub fn register(&self, shard_id: u32, shard_type: &str) {
        self.records
            .entry((shard_type.to_string(), shard_id))
            .or_insert_with(|| ShardHealthRecord::new(shard_type, shard_id));
    }

    /// Register every shard of every topology.
    pub fn register_all(&self) {
        for (shard_type, shard_id) in self.topology.all_shards() {
            self.register(shard_id, &shard_type);
        }
    }

    /// Cached record, without I/O.
    pub fn cached_health(&self, shard_id: u32, shard_type: &str) -> Option<ShardHealthRecord> {
        self.records
            .get(&(shard_type.to_string(), shard_id))
            .map(|r| r.value().clone())
    }

    /// Whether routing may use the shard. Shards without a record are routable.
    pub fn is_routable(&self, shard_id: u32, shard_type: &str) -> bool {
        self.records
            .get(&(shard_type.to_string(), shard_id))
            .map(|r| r.is_healthy)
            .unwrap_or(true)
    }

    /// Probe a shard now and return its updated record.
    ///
    /// Probe failures are recorded, not returned. Only an unknown shard type
    /// or shard id is an error.
    pub async fn check_health(&self, shard_id: u32, shard_type: &str) -> Result<ShardHealthRecord> {
        let topology = self.topology.require(shard_type)?;
        if shard_id >= topology.shard_count() {
            return Err(RouterError::Config(format!(
                "shard {} out of range for '{}' ({} shards)",
                shard_id,
                shard_type,
                topology.shard_count()
            )));
        }

        let started = Instant::now();
        let probe_timeout = self.config.probe_timeout_duration();
        let deadline = started + probe_timeout;

        let outcome = match timeout_at(deadline, self.probe(shard_id, shard_type, deadline)).await {
            Ok(Ok(())) => ProbeOutcome::Success {
                latency: started.elapsed(),
            },
            Ok(Err(e)) => ProbeOutcome::Failure {
                error: e.to_string(),
                latency: Some(started.elapsed()),
            },
            Err(_) => ProbeOutcome::Failure {
                error: format!("probe timed out after {}ms", probe_timeout.as_millis()),
                latency: None,
            },
        };

        self.last_probe
            .insert((shard_type.to_string(), shard_id), Instant::now());
        Ok(self.record_probe(shard_id, shard_type, outcome))
    }

    async fn probe(&self, shard_id: u32, shard_type: &str, deadline: Instant) -> Result<()> {
        let mut conn = self
            .pools
            .acquire_for_probe(&PoolKey::shard(shard_type, shard_id))
            .await?;
        let target = conn.key().to_string();

        match timeout_at(deadline, conn.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                conn.invalidate();
                Err(RouterError::Query {
                    target,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                conn.invalidate();
                Err(RouterError::Timeout {
                    operation: "ping".to_string(),
                    target,
                    timeout_ms: self.config.probe_timeout_duration().as_millis() as u64,
                })
            }
        }
    }

    /// Apply a probe outcome through the state machine.
    ///
    /// Also used by data-access code that observed a connection failure.
    pub fn record_probe(
        &self,
        shard_id: u32,
        shard_type: &str,
        outcome: ProbeOutcome,
    ) -> ShardHealthRecord {
        let (record, event) = {
            let mut entry = self
                .records
                .entry((shard_type.to_string(), shard_id))
                .or_insert_with(|| ShardHealthRecord::new(shard_type, shard_id));
            let event = entry.apply(&outcome, &self.params);
            (entry.value().clone(), event)
        };

        metrics::record_health_probe(
            shard_type,
            shard_id,
            outcome.is_success(),
            outcome.latency().unwrap_or_default(),
        );
        metrics::set_shard_health_state(shard_type, shard_id, record.state.as_str());

        match &outcome {
            ProbeOutcome::Success { latency } => debug!(
                shard_type = %shard_type,
                shard_id,
                latency_ms = latency.as_millis() as u64,
                "Health probe succeeded"
            ),
            ProbeOutcome::Failure { error, .. } => warn!(
                shard_type = %shard_type,
                shard_id,
                consecutive_failures = record.consecutive_failures,
                error = %error,
                "Health probe failed"
            ),
        }

        if let Some(event) = event {
            self.publish(event);
        }
        record
    }

    fn publish(&self, event: HealthEvent) {
        metrics::record_health_transition(&event.shard_type, event.to.as_str());
        if event.is_outage() {
            error!(
                shard_type = %event.shard_type,
                shard_id = event.shard_id,
                consecutive_failures = event.consecutive_failures,
                "Shard marked unhealthy"
            );
        } else if event.is_recovery() {
            info!(
                shard_type = %event.shard_type,
                shard_id = event.shard_id,
                "Shard recovered"
            );
        } else {
            debug!(
                shard_type = %event.shard_type,
                shard_id = event.shard_id,
                from = %event.from,
                to = %event.to,
                "Shard health changed"
            );
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Probe every registered shard once, concurrently.
    ///
    /// Shards whose topology sets `health_check_interval_ms` are skipped if
    /// they were probed more recently than that.
    pub async fn probe_all(&self) -> Vec<ShardHealthRecord> {
        let now = Instant::now();
        let due: Vec<(String, u32)> = self
            .topology
            .all_shards()
            .into_iter()
            .filter(|(shard_type, shard_id)| self.is_due(shard_type, *shard_id, now))
            .collect();

        let results = join_all(
            due.iter()
                .map(|(shard_type, shard_id)| self.check_health(*shard_id, shard_type)),
        )
        .await;

        results.into_iter().filter_map(|r| r.ok()).collect()
    }

    fn is_due(&self, shard_type: &str, shard_id: u32, now: Instant) -> bool {
        let spacing = match self
            .topology
            .get(shard_type)
            .and_then(|t| t.health_check_interval())
        {
            Some(spacing) => spacing,
            None => return true,
        };
        match self.last_probe.get(&(shard_type.to_string(), shard_id)) {
            Some(last) => now.saturating_duration_since(*last) >= spacing,
            None => true,
        }
    }

    /// Start the background monitor. Returns `false` if it is already running.
    pub fn start_monitoring(self: &Arc<Self>) -> bool {
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return false;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let period = self.config.interval_duration();

        info!(interval_ms = period.as_millis() as u64, "Starting health monitor");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let records = monitor.probe_all().await;
                        let unhealthy = records.iter().filter(|r| !r.is_healthy).count();
                        debug!(probed = records.len(), unhealthy, "Health monitor tick complete");
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Health monitor stopping");
                            break;
                        }
                    }
                }
            }
        });

        *slot = Some(MonitorTask { shutdown, handle });
        true
    }

    /// Stop the background monitor and wait for it to exit.
    pub async fn stop_monitoring(&self) {
        let task = self.monitor.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Every record, sorted by (shard type, shard id).
    pub fn snapshot(&self) -> Vec<ShardHealthRecord> {
        let mut records: Vec<ShardHealthRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| (&a.shard_type, a.shard_id).cmp(&(&b.shard_type, b.shard_id)));
        records
    }

    pub fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for record in self.records.iter() {
            match record.state {
                HealthState::Unknown => summary.unknown += 1,
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Degraded => summary.degraded += 1,
                HealthState::Unhealthy => summary.unhealthy += 1,
            }
        }
        summary
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("records", &self.records.len())
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BoxFuture, Connection, Connector, Row};
    use crate::config::{ConnectionDescriptor, PoolConfig, ShardTopology};
    use serde_json::Value;
    use std::collections::HashSet;

    /// Pings succeed unless the host is in `down`; hosts in `hang` never answer.
    #[derive(Default)]
    struct FlakyConnector {
        down: Mutex<HashSet<String>>,
        hang: Mutex<HashSet<String>>,
    }

    struct FlakyConnection {
        host: String,
        connector: Arc<FlakyConnector>,
    }

    impl Connection for FlakyConnection {
        fn ping(&mut self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                if self.connector.hang.lock().contains(&self.host) {
                    std::future::pending::<()>().await;
                }
                if self.connector.down.lock().contains(&self.host) {
                    return Err("server closed the connection".into());
                }
                Ok(())
            })
        }

        fn query<'a>(&'a mut self, _sql: &'a str, _params: &'a [Value]) -> BoxFuture<'a, Vec<Row>> {
            Box::pin(async move { Ok(Vec::new()) })
        }
    }

    struct SharedFlaky(Arc<FlakyConnector>);

    impl Connector for SharedFlaky {
        fn connect<'a>(
            &'a self,
            descriptor: &'a ConnectionDescriptor,
        ) -> BoxFuture<'a, Box<dyn Connection>> {
            Box::pin(async move {
                Ok(Box::new(FlakyConnection {
                    host: descriptor.host.clone(),
                    connector: Arc::clone(&self.0),
                }) as Box<dyn Connection>)
            })
        }
    }

    fn monitor(topologies: Vec<ShardTopology>) -> (Arc<HealthMonitor>, Arc<FlakyConnector>) {
        let flaky = Arc::new(FlakyConnector::default());
        let registry = Arc::new(TopologyRegistry::new(topologies));
        let pools = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&registry),
            Arc::new(SharedFlaky(Arc::clone(&flaky))),
            PoolConfig::default(),
        ));
        let config = HealthConfig {
            interval: "1s".to_string(),
            probe_timeout: "200ms".to_string(),
            ..Default::default()
        };
        (Arc::new(HealthMonitor::new(registry, pools, config)), flaky)
    }

    #[tokio::test]
    async fn test_unprobed_shard_is_routable() {
        let (monitor, _) = monitor(vec![ShardTopology::for_testing("users", 2)]);
        assert!(monitor.cached_health(0, "users").is_none());
        assert!(monitor.is_routable(0, "users"));

        monitor.register_all();
        let record = monitor.cached_health(1, "users").unwrap();
        assert_eq!(record.state, HealthState::Unknown);
        assert!(record.is_healthy);
        assert_eq!(monitor.summary().unknown, 2);
    }

    #[tokio::test]
    async fn test_check_health_success() {
        let (monitor, _) = monitor(vec![ShardTopology::for_testing("users", 2)]);
        let record = monitor.check_health(1, "users").await.unwrap();
        assert_eq!(record.state, HealthState::Healthy);
        assert!(record.is_healthy);
        assert!(record.last_checked.is_some());
        assert!(record.last_response_time.is_some());
        assert_eq!(monitor.cached_health(1, "users"), Some(record));
    }

    #[tokio::test]
    async fn test_three_failures_mark_unhealthy_then_recover() {
        let (monitor, flaky) = monitor(vec![ShardTopology::for_testing("users", 4)]);
        flaky.down.lock().insert("users-2.db.local".to_string());

        for expected in [1, 2] {
            let record = monitor.check_health(2, "users").await.unwrap();
            assert_eq!(record.consecutive_failures, expected);
            assert_eq!(record.state, HealthState::Degraded);
            assert!(monitor.is_routable(2, "users"));
        }

        let record = monitor.check_health(2, "users").await.unwrap();
        assert_eq!(record.state, HealthState::Unhealthy);
        assert!(!record.is_healthy);
        assert!(record.last_error.unwrap().contains("server closed"));
        assert!(!monitor.is_routable(2, "users"));

        flaky.down.lock().clear();
        let record = monitor.check_health(2, "users").await.unwrap();
        assert!(record.is_healthy);
        assert_eq!(record.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_times_out() {
        let (monitor, flaky) = monitor(vec![ShardTopology::for_testing("users", 2)]);
        flaky.hang.lock().insert("users-0.db.local".to_string());

        let record = monitor.check_health(0, "users").await.unwrap();
        assert_eq!(record.consecutive_failures, 1);
        assert!(record.last_error.unwrap().contains("200ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_all_isolates_hanging_shard() {
        let (monitor, flaky) = monitor(vec![ShardTopology::for_testing("users", 3)]);
        flaky.hang.lock().insert("users-1.db.local".to_string());

        let records = monitor.probe_all().await;
        assert_eq!(records.len(), 3);
        assert!(monitor.cached_health(0, "users").unwrap().state == HealthState::Healthy);
        assert!(monitor.cached_health(2, "users").unwrap().state == HealthState::Healthy);
        assert_eq!(
            monitor.cached_health(1, "users").unwrap().state,
            HealthState::Degraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_stays_healthy() {
        let mut topology = ShardTopology::for_testing("users", 1);
        topology.max_connections = Some(1);
        let (monitor, _) = monitor(vec![topology]);
        let _held = monitor.pools.acquire(0, "users").await.unwrap();

        for _ in 0..3 {
            let record = monitor.check_health(0, "users").await.unwrap();
            assert_eq!(record.state, HealthState::Healthy);
            assert_eq!(record.consecutive_failures, 0);
        }
        assert!(monitor.is_routable(0, "users"));
        assert_eq!(monitor.pools.stats(0, "users").active, 1);
    }

    #[tokio::test]
    async fn test_check_health_unknown_shard_type() {
        let (monitor, _) = monitor(vec![ShardTopology::for_testing("users", 1)]);
        assert!(matches!(
            monitor.check_health(0, "content").await,
            Err(RouterError::NoConfiguration { .. })
        ));
        assert!(monitor.check_health(5, "users").await.is_err());
    }

    #[tokio::test]
    async fn test_events_published_on_transition() {
        let (monitor, _) = monitor(vec![ShardTopology::for_testing("users", 1)]);
        let mut events = monitor.subscribe();

        for _ in 0..3 {
            monitor.record_probe(
                0,
                "users",
                ProbeOutcome::Failure {
                    error: "reset".to_string(),
                    latency: None,
                },
            );
        }

        let first = events.recv().await.unwrap();
        assert_eq!((first.from, first.to), (HealthState::Unknown, HealthState::Degraded));
        let second = events.recv().await.unwrap();
        assert_eq!(second.to, HealthState::Unhealthy);
        assert!(second.is_outage());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_interval_spacing() {
        let mut users = ShardTopology::for_testing("users", 1);
        users.health_check_interval_ms = Some(10_000);
        let (monitor, _) = monitor(vec![users, ShardTopology::for_testing("content", 1)]);

        assert_eq!(monitor.probe_all().await.len(), 2);
        // users probed too recently, content has no spacing
        assert_eq!(monitor.probe_all().await.len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(monitor.probe_all().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_loop_probes_and_stops() {
        let (monitor, flaky) = monitor(vec![ShardTopology::for_testing("users", 2)]);
        flaky.down.lock().insert("users-0.db.local".to_string());

        assert!(monitor.start_monitoring());
        assert!(!monitor.start_monitoring());
        assert!(monitor.is_monitoring());

        // First tick is immediate; two more ticks at 1s intervals
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let record = monitor.cached_health(0, "users").unwrap();
        assert_eq!(record.state, HealthState::Unhealthy);
        assert!(monitor.cached_health(1, "users").unwrap().is_healthy);

        monitor.stop_monitoring().await;
        assert!(!monitor.is_monitoring());
    }

    #[tokio::test]
    async fn test_snapshot_and_summary() {
        let (monitor, _) = monitor(vec![
            ShardTopology::for_testing("users", 2),
            ShardTopology::for_testing("content", 1),
        ]);
        monitor.register_all();
        monitor.check_health(0, "users").await.unwrap();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].shard_type, "content");
        assert_eq!((snapshot[1].shard_type.as_str(), snapshot[1].shard_id), ("users", 0));

        let summary = monitor.summary();
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unknown, 2);
        assert_eq!(summary.total(), 3);
    }
}
