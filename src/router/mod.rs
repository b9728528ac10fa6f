// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard router.
//!
//! Ties together:
//! - Routing-key derivation and placement hashing via [`entity`]
//! - A pluggable [`ShardStrategy`] (modulo, or the [`HotKeyStrategy`] decorator)
//! - The cached view of the [`HealthMonitor`](crate::health::HealthMonitor)
//! - Lazily created connection pools via [`ConnectionPoolManager`]
//!
//! # Routing
//!
//! ```text
//! route(entity, key)
//!   ├─ routing key   (owner prefix for content entities)
//!   ├─ topology      (entity → shard type → shard count)
//!   ├─ strategy      (hash % shard_count, hot-key overrides)
//!   ├─ health gate   (cached record only, never probes)
//!   └─ RouteResult   (shard id + connection descriptor)
//! ```
//!
//! `route` is synchronous and performs no I/O. Use
//! [`connect`](ShardRouter::connect) to also check out a pooled connection.

pub mod entity;
pub mod hot_key;
pub mod strategy;
mod types;

pub use entity::{placement_hash, shard_for, EntityType, RoutingKey};
pub use hot_key::{ActivityRecord, HotKeyStats, HotKeyStrategy, SweepReport};
pub use strategy::{ModuloStrategy, SelectionContext, ShardSelection, ShardStrategy};
pub use types::{RouteResult, RouterState, RouterStats};

use crate::backend::Connector;
use crate::config::{ConnectionDescriptor, RouterConfig, ShardTopology};
use crate::error::{Result, RouterError};
use crate::health::HealthMonitor;
use crate::metrics;
use crate::pool::{ConnectionPoolManager, PooledConnection};
use crate::replica::ReplicaManager;
use crate::topology::TopologyRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct RouterCounters {
    routed: AtomicU64,
    rejected: AtomicU64,
    unavailable: AtomicU64,
    degraded_colocation: AtomicU64,
    overridden: AtomicU64,
    /// Per entity type, set once the first degraded route has been warned about.
    degraded_warned: [AtomicBool; EntityType::ALL.len()],
}

/// Routes entities to shards.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct ShardRouter<S: ShardStrategy = ModuloStrategy> {
    config: RouterConfig,

    /// Entity → shard type, with config overrides applied.
    shard_types: HashMap<EntityType, String>,

    topology: Arc<TopologyRegistry>,
    pools: Arc<ConnectionPoolManager>,
    health: Arc<HealthMonitor>,
    strategy: S,

    /// Router state (broadcast to watchers)
    state_tx: watch::Sender<RouterState>,
    state_rx: watch::Receiver<RouterState>,

    /// Stops background tasks
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: RouterCounters,
}

impl ShardRouter<ModuloStrategy> {
    /// Create a router with plain modulo placement.
    pub fn new(config: RouterConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::with_strategy(config, connector, ModuloStrategy)
    }
}

impl ShardRouter<HotKeyStrategy<ModuloStrategy>> {
    /// Create a router with hot-key tracking over modulo placement,
    /// configured from `config.hot_keys`.
    pub fn with_hot_keys(config: RouterConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let strategy = HotKeyStrategy::new(config.hot_keys.clone());
        Self::with_strategy(config, connector, strategy)
    }
}

impl<S: ShardStrategy> ShardRouter<S> {
    /// Create a router with a custom strategy.
    pub fn with_strategy(
        config: RouterConfig,
        connector: Arc<dyn Connector>,
        strategy: S,
    ) -> Result<Self> {
        config.validate()?;

        let mut shard_types: HashMap<EntityType, String> = EntityType::ALL
            .iter()
            .map(|e| (*e, e.default_shard_type().to_string()))
            .collect();
        for (entity, shard_type) in &config.entity_shard_types {
            let entity: EntityType = entity
                .parse()
                .map_err(|_| RouterError::Config(format!("unknown entity type '{}'", entity)))?;
            shard_types.insert(entity, shard_type.clone());
        }

        let topology = Arc::new(TopologyRegistry::new(config.topologies.clone()));
        let pools = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&topology),
            connector,
            config.pool.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&topology),
            Arc::clone(&pools),
            config.health.clone(),
        ));

        let (state_tx, state_rx) = watch::channel(RouterState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            shard_types,
            topology,
            pools,
            health,
            strategy,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
            counters: RouterCounters::default(),
        })
    }

    /// Get current router state.
    pub fn state(&self) -> RouterState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<RouterState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RouterState::Running
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    pub fn topology_registry(&self) -> &Arc<TopologyRegistry> {
        &self.topology
    }

    /// Shard type an entity is placed on.
    pub fn shard_type_for(&self, entity_type: EntityType) -> &str {
        self.shard_types
            .get(&entity_type)
            .map(String::as_str)
            .unwrap_or_else(|| entity_type.default_shard_type())
    }

    /// Start background work.
    ///
    /// 1. Registers every shard with the health monitor
    /// 2. Runs one probe round so the health cache starts warm
    /// 3. Spawns the health monitor (if enabled), the pool sweeper and
    ///    any strategy maintenance
    ///
    /// Probe failures are recorded, never returned.
    pub async fn initialize(&self) -> Result<()> {
        if self.state() != RouterState::Created {
            return Err(RouterError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            shard_types = ?self.topology.shard_types(),
            strategy = self.strategy.name(),
            "Initializing shard router"
        );

        self.health.register_all();
        let records = self.health.probe_all().await;
        let unhealthy = records.iter().filter(|r| !r.is_healthy).count();
        let degraded = records.iter().filter(|r| r.consecutive_failures > 0).count();
        if degraded > 0 {
            warn!(
                probed = records.len(),
                degraded,
                unhealthy,
                "Some shards failed their initial probe"
            );
        }

        if self.config.health.enabled {
            self.health.start_monitoring();
        }

        let mut tasks = self.tasks.lock();
        tasks.push(self.pools.start_sweeper(self.shutdown_rx.clone()));
        if let Some(handle) = self.strategy.start_background(self.shutdown_rx.clone()) {
            tasks.push(handle);
        }
        drop(tasks);

        let _ = self.state_tx.send(RouterState::Running);
        metrics::set_router_state("Running");
        info!(shards = records.len(), "Shard router running");
        Ok(())
    }

    /// Stop background tasks and close every pool.
    ///
    /// Safe to call from any state; a second call is a no-op.
    pub async fn shutdown(&self) {
        if self.state() == RouterState::Stopped {
            return;
        }

        info!("Shutting down shard router");
        let _ = self.state_tx.send(RouterState::ShuttingDown);
        metrics::set_router_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);
        self.health.stop_monitoring().await;

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let drain_timeout = Duration::from_secs(5);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        self.pools.close_all();

        let _ = self.state_tx.send(RouterState::Stopped);
        metrics::set_router_state("Stopped");
        info!("Shard router stopped");
    }

    /// Route an entity to its shard.
    ///
    /// # Errors
    ///
    /// - `InvalidInput`: empty key, or content key with an empty owner id
    /// - `NoConfiguration`: no topology for the entity's shard type
    /// - `ShardUnavailable`: the selected shard's cached health is negative
    /// - `Shutdown`: the router is shutting down or stopped
    pub fn route(&self, entity_type: EntityType, key: &str) -> Result<RouteResult> {
        let shard_type = self.shard_type_for(entity_type);
        match self.try_route(entity_type, shard_type, key) {
            Ok(result) => {
                self.counters.routed.fetch_add(1, Ordering::Relaxed);
                metrics::record_route(&result.shard_type, result.shard_id);
                Ok(result)
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                if matches!(e, RouterError::ShardUnavailable { .. }) {
                    self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
                }
                metrics::record_route_rejected(shard_type, e.kind());
                debug!(
                    entity_type = %entity_type,
                    key = %key,
                    error = %e,
                    "Route rejected"
                );
                Err(e)
            }
        }
    }

    /// Route with the entity type given by name ("user", "post", ...).
    pub fn route_named(&self, entity_type: &str, key: &str) -> Result<RouteResult> {
        let entity_type: EntityType = entity_type.parse().inspect_err(|_| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::record_route_rejected("unknown", "invalid_input");
        })?;
        self.route(entity_type, key)
    }

    fn try_route(
        &self,
        entity_type: EntityType,
        shard_type: &str,
        key: &str,
    ) -> Result<RouteResult> {
        if !self.state().accepts_routes() {
            return Err(RouterError::Shutdown);
        }

        let routing = entity_type.routing_key(key)?;
        if !routing.co_located {
            self.counters
                .degraded_colocation
                .fetch_add(1, Ordering::Relaxed);
            metrics::record_colocation_degraded(entity_type.as_str());
            if !self.counters.degraded_warned[entity_type as usize].swap(true, Ordering::Relaxed) {
                warn!(
                    entity_type = %entity_type,
                    key = %key,
                    "Content key has no owner prefix; routing on the whole key (further occurrences logged at debug)"
                );
            } else {
                debug!(
                    entity_type = %entity_type,
                    key = %key,
                    "Content key has no owner prefix; routing on the whole key"
                );
            }
        }

        let topology = self.topology.require(shard_type)?;
        let shard_count = topology.shard_count();
        if shard_count == 0 {
            return Err(RouterError::no_configuration(shard_type));
        }

        let ctx = SelectionContext {
            entity_type,
            entity_key: key,
            routing_key: routing.key,
            shard_type,
            shard_count,
            health: &self.health,
        };
        let selection = self.strategy.select_shard(&ctx);

        if !self.health.is_routable(selection.shard_id, shard_type) {
            return Err(RouterError::ShardUnavailable {
                shard_type: shard_type.to_string(),
                shard_id: selection.shard_id,
                entity_type: entity_type.to_string(),
                key: key.to_string(),
            });
        }

        let connection = topology.shard(selection.shard_id).cloned().ok_or_else(|| {
            RouterError::Internal(format!(
                "strategy '{}' selected shard {} outside 0..{} for '{}'",
                self.strategy.name(),
                selection.shard_id,
                shard_count,
                shard_type
            ))
        })?;

        if selection.overridden {
            self.counters.overridden.fetch_add(1, Ordering::Relaxed);
        }

        Ok(RouteResult {
            shard_id: selection.shard_id,
            shard_type: shard_type.to_string(),
            entity_type,
            entity_key: key.to_string(),
            routing_key: routing.key.to_string(),
            connection,
            hot: selection.hot,
            replicated: selection.replicated,
        })
    }

    /// Route and check out a pooled connection to the shard.
    ///
    /// A connection-level failure while acquiring is reported to the health
    /// monitor so repeated failures gate the shard.
    pub async fn connect(
        &self,
        entity_type: EntityType,
        key: &str,
    ) -> Result<(RouteResult, PooledConnection)> {
        let route = self.route(entity_type, key)?;
        match self.pools.acquire(route.shard_id, &route.shard_type).await {
            Ok(conn) => Ok((route, conn)),
            Err(e) => {
                if matches!(e, RouterError::Connection { .. } | RouterError::Timeout { .. }) {
                    self.health.record_probe(
                        route.shard_id,
                        &route.shard_type,
                        crate::health::ProbeOutcome::Failure {
                            error: e.to_string(),
                            latency: None,
                        },
                    );
                }
                Err(e)
            }
        }
    }

    /// Cached health of a shard. Unknown shards count as healthy.
    pub fn is_healthy(&self, shard_id: u32, shard_type: &str) -> bool {
        self.health.is_routable(shard_id, shard_type)
    }

    /// Number of shards of a type that currently pass the health gate.
    pub fn active_shard_count(&self, shard_type: &str) -> usize {
        match self.topology.shard_count(shard_type) {
            Some(count) => (0..count)
                .filter(|id| self.health.is_routable(*id, shard_type))
                .count(),
            None => 0,
        }
    }

    /// Configured shard count for a shard type.
    pub fn shard_count(&self, shard_type: &str) -> Option<u32> {
        self.topology.shard_count(shard_type)
    }

    /// Append a shard. Remaps most keys of that shard type.
    pub fn add_shard(&self, shard_type: &str, descriptor: ConnectionDescriptor) -> Result<u32> {
        let shard_id = self.topology.add_shard(shard_type, descriptor)?;
        self.health.register(shard_id, shard_type);
        Ok(shard_id)
    }

    /// Request shard removal. The shard keeps serving traffic; see
    /// [`TopologyRegistry::remove_shard`].
    pub fn remove_shard(&self, shard_type: &str, shard_id: u32) -> Result<()> {
        self.topology.remove_shard(shard_type, shard_id)
    }

    pub fn pending_decommission(&self) -> Vec<(String, u32)> {
        self.topology.pending_decommission()
    }

    /// Build a replica manager from `config.replica`, sharing this router's
    /// topology and pools.
    pub fn replica_manager(&self) -> Result<ReplicaManager> {
        ReplicaManager::new(
            self.config.replica.clone(),
            Arc::clone(&self.topology),
            Arc::clone(&self.pools),
        )
    }

    /// Snapshot of every topology, for the migration orchestrator.
    pub fn topology(&self) -> Vec<ShardTopology> {
        self.topology.snapshot()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.counters.routed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            unavailable: self.counters.unavailable.load(Ordering::Relaxed),
            degraded_colocation: self.counters.degraded_colocation.load(Ordering::Relaxed),
            overridden: self.counters.overridden.load(Ordering::Relaxed),
        }
    }
}

impl<S: ShardStrategy> std::fmt::Debug for ShardRouter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRouter")
            .field("state", &self.state())
            .field("strategy", &self.strategy.name())
            .field("shard_types", &self.topology.shard_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoOpConnector;
    use crate::health::ProbeOutcome;

    fn router() -> ShardRouter {
        ShardRouter::new(
            RouterConfig::for_testing(&["users", "content", "ai-tasks"], 4),
            Arc::new(NoOpConnector),
        )
        .unwrap()
    }

    fn fail(router: &ShardRouter<impl ShardStrategy>, shard_id: u32, shard_type: &str) {
        for _ in 0..3 {
            router.health().record_probe(
                shard_id,
                shard_type,
                ProbeOutcome::Failure {
                    error: "refused".to_string(),
                    latency: None,
                },
            );
        }
    }

    #[test]
    fn test_initial_state() {
        let router = router();
        assert_eq!(router.state(), RouterState::Created);
        assert!(!router.is_running());
        assert_eq!(*router.state_receiver().borrow(), RouterState::Created);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = ShardRouter::new(RouterConfig::default(), Arc::new(NoOpConnector));
        assert!(matches!(result, Err(RouterError::Config(_))));
    }

    #[test]
    fn test_route_is_deterministic() {
        let router = router();
        let first = router.route(EntityType::User, "alice").unwrap();
        for _ in 0..100 {
            assert_eq!(router.route(EntityType::User, "alice").unwrap().shard_id, first.shard_id);
        }
        assert_eq!(first.shard_id, shard_for("alice", 4));
        assert_eq!(first.shard_type, "users");
        assert_eq!(first.routing_key, "alice");
        assert_eq!(
            first.connection.host,
            format!("users-{}.db.local", first.shard_id)
        );
    }

    #[test]
    fn test_content_co_located_with_owner() {
        let router = router();
        let user = router.route(EntityType::User, "alice").unwrap();
        let post = router.route(EntityType::Post, "alice:post-1").unwrap();
        assert_eq!(post.shard_id, user.shard_id);
        assert_eq!(post.shard_type, "content");
        assert_eq!(post.routing_key, "alice");
        assert_eq!(post.entity_key, "alice:post-1");
    }

    #[test]
    fn test_degraded_colocation_counted() {
        let router = router();
        router.route(EntityType::Thread, "no-owner").unwrap();
        assert_eq!(router.stats().degraded_colocation, 1);
    }

    #[test]
    fn test_degraded_colocation_warned_once_per_entity() {
        let router = router();
        let warned = |entity: EntityType| {
            router.counters.degraded_warned[entity as usize].load(Ordering::Relaxed)
        };

        for _ in 0..5 {
            router.route(EntityType::Post, "no-owner").unwrap();
        }
        assert!(warned(EntityType::Post));
        assert!(!warned(EntityType::Thread));
        assert_eq!(router.stats().degraded_colocation, 5);

        router.route(EntityType::Thread, "no-owner").unwrap();
        assert!(warned(EntityType::Thread));
        assert!(!warned(EntityType::Comment));
    }

    #[test]
    fn test_invalid_input() {
        let router = router();
        assert!(matches!(
            router.route(EntityType::User, ""),
            Err(RouterError::InvalidInput { .. })
        ));
        assert!(matches!(
            router.route_named("invoice", "alice"),
            Err(RouterError::InvalidInput { .. })
        ));
        assert_eq!(router.route_named("user", "alice").unwrap().entity_type, EntityType::User);
        assert_eq!(router.stats().rejected, 2);
    }

    #[test]
    fn test_no_configuration() {
        let router = ShardRouter::new(
            RouterConfig::for_testing(&["users"], 2),
            Arc::new(NoOpConnector),
        )
        .unwrap();
        assert!(matches!(
            router.route(EntityType::BackgroundTask, "task-1"),
            Err(RouterError::NoConfiguration { .. })
        ));
    }

    #[test]
    fn test_entity_shard_type_override() {
        let mut config = RouterConfig::for_testing(&["users"], 4);
        config
            .entity_shard_types
            .insert("post".to_string(), "users".to_string());
        let router = ShardRouter::new(config, Arc::new(NoOpConnector)).unwrap();

        let route = router.route(EntityType::Post, "alice:p1").unwrap();
        assert_eq!(route.shard_type, "users");
        assert_eq!(router.shard_type_for(EntityType::Thread), "content");
    }

    #[test]
    fn test_override_with_unknown_entity_rejected() {
        let mut config = RouterConfig::for_testing(&["users"], 4);
        config
            .entity_shard_types
            .insert("invoice".to_string(), "users".to_string());
        assert!(ShardRouter::new(config, Arc::new(NoOpConnector)).is_err());
    }

    #[test]
    fn test_health_gate() {
        let router = router();
        let shard = router.route(EntityType::User, "alice").unwrap().shard_id;

        fail(&router, shard, "users");
        assert!(!router.is_healthy(shard, "users"));
        assert_eq!(router.active_shard_count("users"), 3);

        match router.route(EntityType::User, "alice") {
            Err(RouterError::ShardUnavailable { shard_id, entity_type, key, .. }) => {
                assert_eq!(shard_id, shard);
                assert_eq!(entity_type, "user");
                assert_eq!(key, "alice");
            }
            other => panic!("expected ShardUnavailable, got {:?}", other),
        }
        assert_eq!(router.stats().unavailable, 1);

        router.health().record_probe(
            shard,
            "users",
            ProbeOutcome::Success {
                latency: Duration::from_millis(1),
            },
        );
        assert!(router.route(EntityType::User, "alice").is_ok());
    }

    #[test]
    fn test_active_shard_count_unknown_type() {
        assert_eq!(router().active_shard_count("nope"), 0);
        assert_eq!(router().active_shard_count("users"), 4);
    }

    #[test]
    fn test_add_and_remove_shard() {
        let router = router();
        let id = router
            .add_shard(
                "users",
                ConnectionDescriptor::for_testing("users-4.db.local", "users_4"),
            )
            .unwrap();
        assert_eq!(id, 4);
        assert_eq!(router.shard_count("users"), Some(5));
        assert_eq!(
            router.route(EntityType::User, "alice").unwrap().shard_id,
            shard_for("alice", 5)
        );

        router.remove_shard("users", 1).unwrap();
        assert_eq!(router.shard_count("users"), Some(5));
        assert_eq!(router.pending_decommission(), vec![("users".to_string(), 1)]);
    }

    #[test]
    fn test_topology_snapshot() {
        let topology = router().topology();
        assert_eq!(topology.len(), 3);
        assert_eq!(topology[0].shard_type, "ai-tasks");
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let router = router();
        router.initialize().await.unwrap();
        assert!(router.is_running());
        assert_eq!(router.health().summary().healthy, 12);

        let err = router.initialize().await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidState { .. }));

        router.shutdown().await;
        assert_eq!(router.state(), RouterState::Stopped);
        assert!(matches!(
            router.route(EntityType::User, "alice"),
            Err(RouterError::Shutdown)
        ));

        // Idempotent
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let router = router();
        router.shutdown().await;
        assert_eq!(router.state(), RouterState::Stopped);
    }

    #[tokio::test]
    async fn test_connect_returns_pooled_connection() {
        let router = router();
        let (route, mut conn) = router.connect(EntityType::Session, "sess-42").await.unwrap();
        assert_eq!(conn.key().shard_id, route.shard_id);
        assert!(conn.ping().await.is_ok());
        assert_eq!(router.pools().stats(route.shard_id, "users").active, 1);
    }

    #[test]
    fn test_hot_key_router() {
        let mut config = RouterConfig::for_testing(&["users"], 4);
        config.hot_keys.hot_threshold = 3.0;
        let router = ShardRouter::with_hot_keys(config, Arc::new(NoOpConnector)).unwrap();

        let results: Vec<RouteResult> = (0..3)
            .map(|_| router.route(EntityType::User, "zoe").unwrap())
            .collect();
        assert!(!results[1].hot);
        assert!(results[2].hot);
        assert!(router.strategy().is_hot("zoe"));
        assert_eq!(results[0].shard_id, results[2].shard_id);
    }
}
