// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Routing decisions and rejections
//! - Hot-key detection and overrides
//! - Shard health probes and state transitions
//! - Connection pool saturation
//! - Replica reads, fallbacks and circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `shard_router_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration in seconds)
//!
//! No recorder is installed here; the embedding application chooses one.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

// =============================================================================
// Routing
// =============================================================================

/// Record a successful routing decision.
pub fn record_route(shard_type: &str, shard_id: u32) {
    counter!(
        "shard_router_routes_total",
        "shard_type" => shard_type.to_string(),
        "shard_id" => shard_id.to_string()
    )
    .increment(1);
}

/// Record a rejected routing request by error kind.
pub fn record_route_rejected(shard_type: &str, reason: &str) {
    counter!(
        "shard_router_routes_rejected_total",
        "shard_type" => shard_type.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a content key routed without an owner prefix.
pub fn record_colocation_degraded(entity_type: &str) {
    counter!(
        "shard_router_colocation_degraded_total",
        "entity_type" => entity_type.to_string()
    )
    .increment(1);
}

/// Set router lifecycle gauge.
pub fn set_router_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("shard_router_state").set(value);
}

// =============================================================================
// Hot keys
// =============================================================================

/// Record a key flipping hot or cold.
pub fn record_hot_key_transition(state: &str) {
    counter!("shard_router_hot_key_transitions_total", "state" => state.to_string()).increment(1);
}

/// Record a hot-key routing override ("dedicated", "replicated", "fallback").
pub fn record_hot_key_override(kind: &str) {
    counter!("shard_router_hot_key_overrides_total", "kind" => kind.to_string()).increment(1);
}

/// Gauges for tracked/hot key counts after a sweep.
pub fn set_hot_key_counts(tracked: usize, hot: usize) {
    gauge!("shard_router_tracked_keys").set(tracked as f64);
    gauge!("shard_router_hot_keys").set(hot as f64);
}

// =============================================================================
// Health
// =============================================================================

/// Record a shard health probe result and its latency.
pub fn record_health_probe(shard_type: &str, shard_id: u32, success: bool, latency: Duration) {
    let shard_type = shard_type.to_string();
    let shard_id = shard_id.to_string();
    counter!(
        "shard_router_health_probes_total",
        "shard_type" => shard_type.clone(),
        "shard_id" => shard_id.clone(),
        "status" => status(success)
    )
    .increment(1);
    histogram!(
        "shard_router_health_probe_duration_seconds",
        "shard_type" => shard_type,
        "shard_id" => shard_id
    )
    .record(latency.as_secs_f64());
}

/// Set the shard health state gauge (0=unknown, 1=healthy, 2=degraded, 3=unhealthy).
pub fn set_shard_health_state(shard_type: &str, shard_id: u32, state: &str) {
    let value = match state {
        "unknown" => 0.0,
        "healthy" => 1.0,
        "degraded" => 2.0,
        "unhealthy" => 3.0,
        _ => -1.0,
    };
    gauge!(
        "shard_router_shard_health_state",
        "shard_type" => shard_type.to_string(),
        "shard_id" => shard_id.to_string()
    )
    .set(value);
}

/// Record a health state transition.
pub fn record_health_transition(shard_type: &str, to: &str) {
    counter!(
        "shard_router_health_transitions_total",
        "shard_type" => shard_type.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

// =============================================================================
// Pools
// =============================================================================

/// Record a pool acquisition ("success", "exhausted", "closed", "connect_error").
pub fn record_pool_acquire(shard_type: &str, outcome: &str, wait: Duration) {
    counter!(
        "shard_router_pool_acquires_total",
        "shard_type" => shard_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "shard_router_pool_acquire_wait_seconds",
        "shard_type" => shard_type.to_string()
    )
    .record(wait.as_secs_f64());
}

/// Set pool occupancy gauges.
pub fn set_pool_stats(pool: &str, active: usize, idle: usize, waiting: usize) {
    let pool = pool.to_string();
    gauge!("shard_router_pool_active", "pool" => pool.clone()).set(active as f64);
    gauge!("shard_router_pool_idle", "pool" => pool.clone()).set(idle as f64);
    gauge!("shard_router_pool_waiting", "pool" => pool).set(waiting as f64);
}

/// Record idle connections reclaimed by a sweep.
pub fn record_pool_reclaimed(count: usize) {
    if count > 0 {
        counter!("shard_router_pool_reclaimed_total").increment(count as u64);
    }
}

/// Record a connection attempt to a shard or replica.
pub fn record_connect(target: &str, success: bool) {
    counter!(
        "shard_router_connects_total",
        "target" => target.to_string(),
        "status" => status(success)
    )
    .increment(1);
}

// =============================================================================
// Replicas
// =============================================================================

/// Record a query against a replica.
pub fn record_replica_query(replica_id: &str, success: bool, latency: Duration) {
    counter!(
        "shard_router_replica_queries_total",
        "replica_id" => replica_id.to_string(),
        "status" => status(success)
    )
    .increment(1);
    histogram!(
        "shard_router_replica_query_duration_seconds",
        "replica_id" => replica_id.to_string()
    )
    .record(latency.as_secs_f64());
}

/// Record a query against the primary ("read" or "write").
pub fn record_primary_query(operation: &str, success: bool, latency: Duration) {
    counter!(
        "shard_router_primary_queries_total",
        "operation" => operation.to_string(),
        "status" => status(success)
    )
    .increment(1);
    histogram!(
        "shard_router_primary_query_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(latency.as_secs_f64());
}

/// Record a read that fell back to the primary.
pub fn record_replica_fallback(reason: &str) {
    counter!("shard_router_replica_fallbacks_total", "reason" => reason.to_string()).increment(1);
}

/// Record a retry against an alternate replica.
pub fn record_replica_retry() {
    counter!("shard_router_replica_retries_total").increment(1);
}

/// Record a replica circuit transition ("open" / "closed").
pub fn record_replica_circuit(replica_id: &str, state: &str) {
    counter!(
        "shard_router_replica_circuit_transitions_total",
        "replica_id" => replica_id.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Set measured replication lag for a replica.
pub fn set_replica_lag_ms(replica_id: &str, lag_ms: u64) {
    gauge!("shard_router_replica_lag_ms", "replica_id" => replica_id.to_string())
        .set(lag_ms as f64);
}
