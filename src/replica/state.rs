// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-replica health, latency and circuit state.
//!
//! # Circuit
//!
//! ```text
//!            N consecutive failures            cooldown expired
//! Closed ─────────────────────────→ Open ───────────────────────→ Open (awaiting probe)
//!   ↑                                                                │
//!   └──────────────────────── successful probe ──────────────────────┘
//! ```
//!
//! An open replica is never selected. Expiry of the cooldown alone does not
//! close the circuit; a health probe has to succeed first.

use crate::config::ReplicaDescriptor;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Mutable state for one replica. Owned by the replica manager.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    pub replica_id: String,
    pub priority: u32,
    pub region: Option<String>,

    /// Result of the most recent probe (optimistic before the first one).
    healthy: bool,
    ewma_latency: Option<Duration>,
    history: VecDeque<Duration>,
    history_capacity: usize,
    alpha: f64,
    lag: Option<Duration>,
    consecutive_failures: u32,
    circuit_open: bool,
    cooldown_until: Option<Instant>,
    queries: u64,
    failures: u64,
    last_checked_ms: Option<u64>,
}

impl ReplicaState {
    pub fn new(descriptor: &ReplicaDescriptor, alpha: f64, history_capacity: usize) -> Self {
        Self {
            replica_id: descriptor.replica_id.clone(),
            priority: descriptor.priority,
            region: descriptor.region.clone(),
            healthy: true,
            ewma_latency: None,
            history: VecDeque::with_capacity(history_capacity.min(1_024)),
            history_capacity: history_capacity.max(1),
            alpha,
            lag: None,
            consecutive_failures: 0,
            circuit_open: false,
            cooldown_until: None,
            queries: 0,
            failures: 0,
            last_checked_ms: None,
        }
    }

    /// Whether the replica may be selected for a read.
    pub fn is_available(&self) -> bool {
        self.healthy && !self.circuit_open
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_open
    }

    /// Whether the cooldown has run out (the circuit still needs a probe to close).
    pub fn cooldown_expired(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| now >= until).unwrap_or(true)
    }

    pub fn lag(&self) -> Option<Duration> {
        self.lag
    }

    pub fn ewma_latency(&self) -> Option<Duration> {
        self.ewma_latency
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a successful query.
    pub fn record_success(&mut self, latency: Duration) {
        self.queries += 1;
        self.consecutive_failures = 0;
        self.observe_latency(latency);
    }

    /// Record a failed query. Returns `true` if this failure opened the circuit.
    pub fn record_failure(&mut self, now: Instant, threshold: u32, cooldown: Duration) -> bool {
        self.queries += 1;
        self.failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.trip_if_needed(now, threshold, cooldown)
    }

    /// Record a successful probe. Returns `true` if this probe closed the circuit.
    pub fn record_probe_success(&mut self, lag: Option<Duration>, now: Instant, at_ms: u64) -> bool {
        self.healthy = true;
        self.lag = lag;
        self.last_checked_ms = Some(at_ms);

        if self.circuit_open && self.cooldown_expired(now) {
            self.circuit_open = false;
            self.cooldown_until = None;
            self.consecutive_failures = 0;
            return true;
        }
        if !self.circuit_open {
            self.consecutive_failures = 0;
        }
        false
    }

    /// Record a failed probe. Returns `true` if this failure opened the circuit.
    pub fn record_probe_failure(
        &mut self,
        now: Instant,
        at_ms: u64,
        threshold: u32,
        cooldown: Duration,
    ) -> bool {
        self.healthy = false;
        self.last_checked_ms = Some(at_ms);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.trip_if_needed(now, threshold, cooldown)
    }

    fn trip_if_needed(&mut self, now: Instant, threshold: u32, cooldown: Duration) -> bool {
        if self.circuit_open || self.consecutive_failures < threshold {
            return false;
        }
        self.circuit_open = true;
        self.cooldown_until = Some(now + cooldown);
        true
    }

    fn observe_latency(&mut self, latency: Duration) {
        self.ewma_latency = Some(match self.ewma_latency {
            None => latency,
            Some(previous) => Duration::from_secs_f64(
                self.alpha * latency.as_secs_f64() + (1.0 - self.alpha) * previous.as_secs_f64(),
            ),
        });
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(latency);
    }

    /// Nearest-rank percentile over the latency history.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        if self.history.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.history.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted.get(rank.saturating_sub(1)).copied()
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            replica_id: self.replica_id.clone(),
            priority: self.priority,
            region: self.region.clone(),
            healthy: self.healthy,
            available: self.is_available(),
            circuit_open: self.circuit_open,
            ewma_latency_ms: self.ewma_latency.map(|d| d.as_secs_f64() * 1_000.0),
            p50_ms: self.percentile(50.0).map(millis),
            p95_ms: self.percentile(95.0).map(millis),
            p99_ms: self.percentile(99.0).map(millis),
            lag_ms: self.lag.map(millis),
            consecutive_failures: self.consecutive_failures,
            queries: self.queries,
            failures: self.failures,
            last_checked_ms: self.last_checked_ms,
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Point-in-time copy of a replica's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaSnapshot {
    pub replica_id: String,
    pub priority: u32,
    pub region: Option<String>,
    pub healthy: bool,
    /// Selectable right now (healthy and circuit closed).
    pub available: bool,
    pub circuit_open: bool,
    pub ewma_latency_ms: Option<f64>,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub lag_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub queries: u64,
    pub failures: u64,
    pub last_checked_ms: Option<u64>,
}
