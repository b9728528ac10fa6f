// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection pools, one per shard (and one per replica).
//!
//! Pools are created lazily on first acquisition and sized from the shard
//! type's `max_connections` (falling back to [`PoolConfig::max_connections`]).
//! Each pool is a [`Bulkhead`] plus a LIFO queue of idle connections:
//!
//! ```text
//! acquire() ──► bulkhead permit (wait ≤ acquire_timeout) ──► idle conn? ──► PooledConnection
//!                     │                                         │ no
//!                     └─ timeout: PoolExhausted                 └─► Connector::connect (retry/backoff)
//!
//! drop(PooledConnection) ──► idle queue (unless invalidated or pool closed) + permit released
//! ```
//!
//! Health probes go through [`ConnectionPoolManager::acquire_for_probe`],
//! which never waits for a permit. A saturated pool is busy, not broken, so a
//! probe that finds no free slot runs over a detached connection instead.
//!
//! Idle connections beyond `min_idle` that have been idle longer than
//! `idle_timeout` are reclaimed by [`ConnectionPoolManager::sweep_idle`].

use crate::backend::{Connection, Connector};
use crate::config::{ConnectionDescriptor, PoolConfig, ShardTopology};
use crate::error::{Result, RouterError};
use crate::metrics;
use crate::resilience::{Bulkhead, RetryConfig};
use crate::topology::TopologyRegistry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Identifies one pool: a shard, or a replica of a shard type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub shard_type: String,
    pub shard_id: u32,
    /// Set for replica pools.
    pub replica_id: Option<String>,
}

impl PoolKey {
    pub fn shard(shard_type: impl Into<String>, shard_id: u32) -> Self {
        Self {
            shard_type: shard_type.into(),
            shard_id,
            replica_id: None,
        }
    }

    pub fn replica(
        shard_type: impl Into<String>,
        shard_id: u32,
        replica_id: impl Into<String>,
    ) -> Self {
        Self {
            shard_type: shard_type.into(),
            shard_id,
            replica_id: Some(replica_id.into()),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.replica_id {
            Some(replica_id) => write!(f, "{}/{}@{}", self.shard_type, self.shard_id, replica_id),
            None => write!(f, "{}/{}", self.shard_type, self.shard_id),
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently checked out.
    pub active: usize,
    /// Connections parked in the idle queue.
    pub idle: usize,
    /// `active + idle`.
    pub total: usize,
    /// Tasks blocked waiting for a permit.
    pub waiting: usize,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    since: Instant,
}

struct ShardPool {
    key: PoolKey,
    bulkhead: Bulkhead,
    idle: Mutex<VecDeque<IdleConnection>>,
    active: AtomicUsize,
    waiting: AtomicUsize,
    closed: AtomicBool,
}

/// Decrements the waiting counter when the acquire future completes or is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ShardPool {
    fn new(key: PoolKey, max_connections: usize) -> Self {
        Self {
            key,
            bulkhead: Bulkhead::new(max_connections),
            idle: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // Most recently used first, so the oldest connections age out.
    fn take_idle(&self) -> Option<Box<dyn Connection>> {
        self.idle.lock().pop_back().map(|idle| idle.conn)
    }

    fn give_back(&self, conn: Box<dyn Connection>) {
        if self.is_closed() {
            return;
        }
        self.idle.lock().push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }

    fn stats(&self) -> PoolStats {
        let active = self.active.load(Ordering::Acquire);
        let idle = self.idle.lock().len();
        PoolStats {
            active,
            idle,
            total: active + idle,
            waiting: self.waiting.load(Ordering::Acquire),
        }
    }

    fn reclaim_idle(&self, min_idle: usize, idle_timeout: Duration) -> usize {
        let mut idle = self.idle.lock();
        let mut reclaimed = 0;
        while idle.len() > min_idle {
            match idle.front() {
                Some(oldest) if oldest.since.elapsed() >= idle_timeout => {
                    idle.pop_front();
                    reclaimed += 1;
                }
                _ => break,
            }
        }
        reclaimed
    }

    fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        self.bulkhead.close();
        let mut idle = self.idle.lock();
        let drained = idle.len();
        idle.clear();
        drained
    }
}

/// A connection checked out of a pool.
///
/// Dropping it returns the connection to the pool. Call
/// [`invalidate`](Self::invalidate) after a connection-level failure so the
/// connection is discarded instead.
///
/// A detached connection holds no permit and is closed on drop.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<ShardPool>,
    invalidated: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    /// Pool this connection belongs to.
    pub fn key(&self) -> &PoolKey {
        &self.pool.key
    }

    /// Discard the connection instead of returning it to the pool.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// `true` if the connection was opened outside the pool's limit.
    pub fn is_detached(&self) -> bool {
        self.permit.is_none()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_deref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection is only taken on drop"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_deref_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection is only taken on drop"),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.key)
            .field("invalidated", &self.invalidated)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.permit.is_none() {
            debug!(pool = %self.pool.key, "Closing detached connection");
            return;
        }
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(conn) = self.conn.take() {
            if self.invalidated {
                debug!(pool = %self.pool.key, "Discarding invalidated connection");
            } else {
                self.pool.give_back(conn);
            }
        }
    }
}

/// Owns every connection pool.
pub struct ConnectionPoolManager {
    topology: Arc<TopologyRegistry>,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    pools: DashMap<PoolKey, Arc<ShardPool>>,
}

impl ConnectionPoolManager {
    pub fn new(
        topology: Arc<TopologyRegistry>,
        connector: Arc<dyn Connector>,
        config: PoolConfig,
    ) -> Self {
        Self {
            topology,
            connector,
            config,
            pools: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection to a shard.
    pub async fn acquire(&self, shard_id: u32, shard_type: &str) -> Result<PooledConnection> {
        self.acquire_key(&PoolKey::shard(shard_type, shard_id)).await
    }

    /// Check out a connection to a replica of a shard type.
    pub async fn acquire_replica(
        &self,
        shard_type: &str,
        shard_id: u32,
        replica_id: &str,
    ) -> Result<PooledConnection> {
        self.acquire_key(&PoolKey::replica(shard_type, shard_id, replica_id))
            .await
    }

    /// Check out a connection for any pool key.
    pub async fn acquire_key(&self, key: &PoolKey) -> Result<PooledConnection> {
        let (descriptor, topology) = self.topology.resolve(key)?;
        let pool = self.pool_for(key, &topology);
        let started = Instant::now();
        let acquire_timeout = self.config.acquire_timeout();

        let permit = {
            let _waiting = WaitingGuard::enter(&pool.waiting);
            match timeout(acquire_timeout, pool.bulkhead.acquire()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    metrics::record_pool_acquire(&key.shard_type, "closed", started.elapsed());
                    return Err(RouterError::Shutdown);
                }
                Err(_) => {
                    metrics::record_pool_acquire(&key.shard_type, "exhausted", started.elapsed());
                    warn!(
                        pool = %key,
                        waited_ms = acquire_timeout.as_millis() as u64,
                        max_connections = pool.bulkhead.max_concurrent(),
                        "Connection pool exhausted"
                    );
                    return Err(RouterError::PoolExhausted {
                        shard_type: key.shard_type.clone(),
                        shard_id: key.shard_id,
                        waited_ms: acquire_timeout.as_millis() as u64,
                    });
                }
            }
        };

        self.checkout(key, pool, &descriptor, &topology, permit, started)
            .await
    }

    /// Check out a connection for a health probe without waiting on the pool.
    ///
    /// Takes a free slot when there is one. Otherwise opens a detached
    /// connection that bypasses `max_connections` and is closed once the
    /// probe drops it, so saturation never reads as an outage.
    pub async fn acquire_for_probe(&self, key: &PoolKey) -> Result<PooledConnection> {
        let (descriptor, topology) = self.topology.resolve(key)?;
        let pool = self.pool_for(key, &topology);
        let started = Instant::now();

        if let Some(permit) = pool.bulkhead.try_acquire() {
            return self
                .checkout(key, pool, &descriptor, &topology, permit, started)
                .await;
        }
        if pool.is_closed() {
            return Err(RouterError::Shutdown);
        }

        debug!(pool = %key, "Pool saturated, probing over a detached connection");
        let conn = self
            .connect_with_retry(key, &descriptor, &topology.retry_config())
            .await?;
        metrics::record_pool_acquire(&key.shard_type, "detached", started.elapsed());

        Ok(PooledConnection {
            conn: Some(conn),
            pool,
            invalidated: false,
            permit: None,
        })
    }

    async fn checkout(
        &self,
        key: &PoolKey,
        pool: Arc<ShardPool>,
        descriptor: &ConnectionDescriptor,
        topology: &ShardTopology,
        permit: OwnedSemaphorePermit,
        started: Instant,
    ) -> Result<PooledConnection> {
        if pool.is_closed() {
            return Err(RouterError::Shutdown);
        }

        let conn = match pool.take_idle() {
            Some(conn) => conn,
            None => {
                match self
                    .connect_with_retry(key, descriptor, &topology.retry_config())
                    .await
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        metrics::record_pool_acquire(
                            &key.shard_type,
                            "connect_error",
                            started.elapsed(),
                        );
                        return Err(e);
                    }
                }
            }
        };

        pool.active.fetch_add(1, Ordering::AcqRel);
        metrics::record_pool_acquire(&key.shard_type, "success", started.elapsed());

        Ok(PooledConnection {
            conn: Some(conn),
            pool,
            invalidated: false,
            permit: Some(permit),
        })
    }

    /// Return a connection to its pool. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Occupancy of a shard's pool. All zeros if the pool was never used.
    pub fn stats(&self, shard_id: u32, shard_type: &str) -> PoolStats {
        self.stats_for(&PoolKey::shard(shard_type, shard_id))
    }

    pub fn stats_for(&self, key: &PoolKey) -> PoolStats {
        self.pools
            .get(key)
            .map(|pool| pool.stats())
            .unwrap_or_default()
    }

    /// Occupancy of every live pool, sorted by key.
    pub fn all_stats(&self) -> Vec<(PoolKey, PoolStats)> {
        let mut stats: Vec<(PoolKey, PoolStats)> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Close a shard's pool. Pending acquirers fail with `Shutdown`.
    pub fn close(&self, shard_id: u32, shard_type: &str) {
        self.close_key(&PoolKey::shard(shard_type, shard_id));
    }

    pub fn close_key(&self, key: &PoolKey) {
        if let Some((_, pool)) = self.pools.remove(key) {
            let drained = pool.close();
            info!(pool = %key, drained, "Closed connection pool");
        }
    }

    /// Close every pool.
    pub fn close_all(&self) {
        let keys: Vec<PoolKey> = self.pools.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.close_key(key);
        }
    }

    /// Reclaim idle connections older than `idle_timeout`, keeping `min_idle` per pool.
    pub fn sweep_idle(&self) -> usize {
        let mut reclaimed = 0;
        for entry in self.pools.iter() {
            let pool = entry.value();
            let count = pool.reclaim_idle(self.config.min_idle, self.config.idle_timeout());
            if count > 0 {
                debug!(pool = %pool.key, reclaimed = count, "Reclaimed idle connections");
            }
            let stats = pool.stats();
            metrics::set_pool_stats(&pool.key.to_string(), stats.active, stats.idle, stats.waiting);
            reclaimed += count;
        }
        metrics::record_pool_reclaimed(reclaimed);
        reclaimed
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `sweep_interval` until shutdown.
    pub fn start_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep_idle();
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            debug!("Pool sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn pool_for(&self, key: &PoolKey, topology: &ShardTopology) -> Arc<ShardPool> {
        let max_connections = topology
            .max_connections
            .unwrap_or(self.config.max_connections)
            .max(1);
        self.pools
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(pool = %key, max_connections, "Creating connection pool");
                Arc::new(ShardPool::new(key.clone(), max_connections))
            })
            .clone()
    }

    async fn connect_with_retry(
        &self,
        key: &PoolKey,
        descriptor: &ConnectionDescriptor,
        retry: &RetryConfig,
    ) -> Result<Box<dyn Connection>> {
        let target = key.to_string();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let delay = retry.delay_for_attempt(attempt);

            match timeout(retry.connection_timeout, self.connector.connect(descriptor)).await {
                Ok(Ok(conn)) => {
                    metrics::record_connect(&target, true);
                    if attempt > 1 {
                        info!(pool = %key, address = %descriptor, attempt, "Connected after retry");
                    } else {
                        debug!(pool = %key, address = %descriptor, "Opened connection");
                    }
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    metrics::record_connect(&target, false);
                    if attempt >= retry.max_attempts {
                        error!(
                            pool = %key,
                            address = %descriptor,
                            attempt,
                            error = %e,
                            "Failed to connect after max retries"
                        );
                        return Err(RouterError::Connection {
                            target,
                            message: format!("connection failed after {} attempts: {}", attempt, e),
                        });
                    }
                    warn!(
                        pool = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                }
                Err(_) => {
                    metrics::record_connect(&target, false);
                    if attempt >= retry.max_attempts {
                        error!(
                            pool = %key,
                            address = %descriptor,
                            attempt,
                            timeout_ms = retry.connection_timeout.as_millis() as u64,
                            "Connection timed out after max retries"
                        );
                        return Err(RouterError::timeout("connect", target, retry.connection_timeout));
                    }
                    warn!(
                        pool = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        timeout_ms = retry.connection_timeout.as_millis() as u64,
                        "Connection attempt timed out, retrying"
                    );
                }
            }

            tokio::time::sleep(delay).await;
        }
    }
}

impl fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("pools", &self.pools.len())
            .field("config", &self.config)
            .finish()
    }
}
