// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hot-key-aware shard selection.
//!
//! [`HotKeyStrategy`] wraps another strategy (modulo by default) and tracks
//! per-routing-key activity. Keys whose activity score reaches
//! `hot_threshold` are flagged hot and may be routed to a dedicated shard or
//! flagged for replicated handling.
//!
//! # Activity scoring
//!
//! ```text
//! observe(key):
//!   idle > activity_window   → count = 1, score = 1
//!   otherwise                → count += 1
//!                              score = decay_enabled ? score·decay + 1 : count
//!   !hot && score ≥ threshold → hot (hot_since = now)
//! ```
//!
//! # Hysteresis
//!
//! A hot key turns cold only once `cooldown` has passed since it became hot
//! **and** its effective score is under the threshold. A key idle for more
//! than one window has an effective score of zero. Records idle for two
//! windows are purged by [`sweep`](HotKeyStrategy::sweep).
//!
//! Keys marked with [`mark_hot`](HotKeyStrategy::mark_hot) stay hot until
//! [`mark_cold`](HotKeyStrategy::mark_cold).

use super::strategy::{ModuloStrategy, SelectionContext, ShardSelection, ShardStrategy};
use crate::config::HotKeyConfig;
use crate::metrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Activity of one routing key.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    /// Requests in the current window.
    pub request_count: u64,
    pub score: f64,
    pub hot: bool,
    pub hot_since: Option<Instant>,
    pub last_seen: Instant,
    /// Set by `mark_hot`; pins the key hot.
    pub manual: bool,
}

impl ActivityRecord {
    fn new(now: Instant) -> Self {
        Self {
            request_count: 0,
            score: 0.0,
            hot: false,
            hot_since: None,
            last_seen: now,
            manual: false,
        }
    }

    /// Score as of `now`; zero once the record has been idle for a full window.
    pub fn effective_score(&self, now: Instant, window: Duration) -> f64 {
        if now.saturating_duration_since(self.last_seen) > window {
            0.0
        } else {
            self.score
        }
    }
}

/// Counters for the hot-key strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HotKeyStats {
    pub tracked_keys: usize,
    pub hot_keys: usize,
    pub promotions: u64,
    pub demotions: u64,
    pub dedicated_routes: u64,
    pub replicated_routes: u64,
    pub fallbacks: u64,
    /// Observations dropped because `max_tracked_keys` was reached.
    pub untracked: u64,
}

/// Outcome of one [`sweep`](HotKeyStrategy::sweep).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cooled: usize,
    pub purged: usize,
    pub remaining: usize,
}

#[derive(Debug, Default)]
struct Counters {
    promotions: AtomicU64,
    demotions: AtomicU64,
    dedicated_routes: AtomicU64,
    replicated_routes: AtomicU64,
    fallbacks: AtomicU64,
    untracked: AtomicU64,
}

/// State shared with the background sweeper.
#[derive(Debug)]
struct Tracker {
    config: HotKeyConfig,
    records: DashMap<String, ActivityRecord>,
    counters: Counters,
}

impl Tracker {
    /// Record one request; returns whether the key is hot afterwards.
    fn observe(&self, key: &str, now: Instant) -> bool {
        let window = self.config.activity_window();

        if !self.records.contains_key(key) && self.records.len() >= self.config.max_tracked_keys {
            self.counters.untracked.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| ActivityRecord::new(now));

        if record.request_count == 0 || now.saturating_duration_since(record.last_seen) > window {
            record.request_count = 1;
            record.score = 1.0;
        } else {
            record.request_count += 1;
            record.score = if self.config.decay_enabled {
                record.score * self.config.decay_factor + 1.0
            } else {
                record.request_count as f64
            };
        }
        record.last_seen = now;

        if !record.hot && record.score >= self.config.hot_threshold {
            record.hot = true;
            record.hot_since = Some(now);
            self.promoted(key, record.score);
        } else if self.should_cool(&record, now) {
            Self::cool(&mut record);
            self.demoted(key);
        }
        record.hot
    }

    fn should_cool(&self, record: &ActivityRecord, now: Instant) -> bool {
        if !record.hot || record.manual {
            return false;
        }
        let cooled_down = record
            .hot_since
            .map(|since| now.saturating_duration_since(since) >= self.config.cooldown())
            .unwrap_or(true);
        cooled_down
            && record.effective_score(now, self.config.activity_window()) < self.config.hot_threshold
    }

    fn cool(record: &mut ActivityRecord) {
        record.hot = false;
        record.hot_since = None;
        record.manual = false;
    }

    fn promoted(&self, key: &str, score: f64) {
        self.counters.promotions.fetch_add(1, Ordering::Relaxed);
        metrics::record_hot_key_transition("hot");
        info!(routing_key = %key, score, "Key became hot");
    }

    fn demoted(&self, key: &str) {
        self.counters.demotions.fetch_add(1, Ordering::Relaxed);
        metrics::record_hot_key_transition("cold");
        info!(routing_key = %key, "Key cooled down");
    }

    fn sweep(&self, now: Instant) -> SweepReport {
        let window = self.config.activity_window();
        let mut report = SweepReport::default();

        for mut entry in self.records.iter_mut() {
            if self.should_cool(&entry, now) {
                Self::cool(&mut entry);
                self.demoted(entry.key());
                report.cooled += 1;
            }
        }

        self.records.retain(|_, record| {
            let stale = !record.hot && now.saturating_duration_since(record.last_seen) > window * 2;
            if stale {
                report.purged += 1;
            }
            !stale
        });

        report.remaining = self.records.len();
        let hot = self.records.iter().filter(|r| r.hot).count();
        metrics::set_hot_key_counts(report.remaining, hot);
        report
    }
}

/// Decorator adding hot-key tracking to an inner strategy.
#[derive(Debug)]
pub struct HotKeyStrategy<S = ModuloStrategy> {
    inner: S,
    tracker: Arc<Tracker>,
}

impl HotKeyStrategy<ModuloStrategy> {
    /// Hot-key tracking over plain modulo placement.
    pub fn new(config: HotKeyConfig) -> Self {
        Self::with_inner(ModuloStrategy, config)
    }
}

impl<S: ShardStrategy> HotKeyStrategy<S> {
    pub fn with_inner(inner: S, config: HotKeyConfig) -> Self {
        Self {
            inner,
            tracker: Arc::new(Tracker {
                config,
                records: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &HotKeyConfig {
        &self.tracker.config
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Whether a routing key is currently hot.
    pub fn is_hot(&self, key: &str) -> bool {
        self.tracker.records.get(key).map(|r| r.hot).unwrap_or(false)
    }

    /// Copy of a key's activity record.
    pub fn activity(&self, key: &str) -> Option<ActivityRecord> {
        self.tracker.records.get(key).map(|r| r.value().clone())
    }

    /// All hot routing keys, sorted.
    pub fn hot_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .tracker
            .records
            .iter()
            .filter(|r| r.hot)
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Force a key hot until [`mark_cold`](Self::mark_cold).
    pub fn mark_hot(&self, key: &str) {
        let now = Instant::now();
        let mut record = self
            .tracker
            .records
            .entry(key.to_string())
            .or_insert_with(|| ActivityRecord::new(now));
        let was_hot = record.hot;
        record.hot = true;
        record.manual = true;
        record.hot_since = Some(now);
        record.last_seen = now;
        if !was_hot {
            self.tracker.promoted(key, record.score);
        }
    }

    /// Force a key cold and reset its activity.
    pub fn mark_cold(&self, key: &str) {
        if let Some(mut record) = self.tracker.records.get_mut(key) {
            let was_hot = record.hot;
            Tracker::cool(&mut record);
            record.request_count = 0;
            record.score = 0.0;
            if was_hot {
                self.tracker.demoted(key);
            }
        }
    }

    /// Cool keys past their cooldown and purge stale records.
    pub fn sweep(&self) -> SweepReport {
        self.tracker.sweep(Instant::now())
    }

    pub fn stats(&self) -> HotKeyStats {
        let counters = &self.tracker.counters;
        HotKeyStats {
            tracked_keys: self.tracker.records.len(),
            hot_keys: self.tracker.records.iter().filter(|r| r.hot).count(),
            promotions: counters.promotions.load(Ordering::Relaxed),
            demotions: counters.demotions.load(Ordering::Relaxed),
            dedicated_routes: counters.dedicated_routes.load(Ordering::Relaxed),
            replicated_routes: counters.replicated_routes.load(Ordering::Relaxed),
            fallbacks: counters.fallbacks.load(Ordering::Relaxed),
            untracked: counters.untracked.load(Ordering::Relaxed),
        }
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until shutdown.
    pub fn start_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let tracker = Arc::clone(&self.tracker);
        let period = tracker.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = tracker.sweep(Instant::now());
                        debug!(
                            cooled = report.cooled,
                            purged = report.purged,
                            remaining = report.remaining,
                            "Hot-key sweep complete"
                        );
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            debug!("Hot-key sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn route_hot(&self, ctx: &SelectionContext<'_>, inner: ShardSelection) -> ShardSelection {
        let config = &self.tracker.config;
        let counters = &self.tracker.counters;

        if let Some(dedicated) = config.dedicated_target() {
            if dedicated < ctx.shard_count {
                if ctx.health.is_routable(dedicated, ctx.shard_type) || !config.fallback_enabled {
                    counters.dedicated_routes.fetch_add(1, Ordering::Relaxed);
                    metrics::record_hot_key_override("dedicated");
                    return ShardSelection {
                        shard_id: dedicated,
                        hot: true,
                        replicated: false,
                        overridden: dedicated != inner.shard_id,
                    };
                }
                debug!(
                    shard_type = %ctx.shard_type,
                    dedicated_shard = dedicated,
                    routing_key = %ctx.routing_key,
                    "Dedicated hot shard unhealthy, using standard placement"
                );
            }
            counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            metrics::record_hot_key_override("fallback");
            return ShardSelection { hot: true, ..inner };
        }

        if config.replication_enabled {
            counters.replicated_routes.fetch_add(1, Ordering::Relaxed);
            metrics::record_hot_key_override("replicated");
            return ShardSelection {
                hot: true,
                replicated: true,
                ..inner
            };
        }

        ShardSelection { hot: true, ..inner }
    }
}

impl<S: ShardStrategy> ShardStrategy for HotKeyStrategy<S> {
    fn name(&self) -> &'static str {
        "hot-key"
    }

    fn select_shard(&self, ctx: &SelectionContext<'_>) -> ShardSelection {
        let inner = self.inner.select_shard(ctx);
        if !self.tracker.config.enabled {
            return inner;
        }
        if self.tracker.observe(ctx.routing_key, Instant::now()) {
            self.route_hot(ctx, inner)
        } else {
            inner
        }
    }

    fn start_background(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.tracker.config.enabled {
            return None;
        }
        Some(self.start_sweeper(shutdown))
    }
}
