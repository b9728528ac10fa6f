// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard health state machine.
//!
//! # State Transitions
//!
//! ```text
//!              success                 failure (< threshold)
//! Unknown ─────────────→ Healthy ──────────────────────────→ Degraded
//!    │                      ↑  ↑                                │
//!    │ failure              │  └──────── success ───────────────┤
//!    ↓                      │                                   │ failure (≥ threshold)
//! Degraded / Unhealthy      └──────── success ──── Unhealthy ←──┘
//! ```
//!
//! - **Unknown**: registered but never probed. Routable.
//! - **Healthy**: last probe succeeded.
//! - **Degraded**: recent failures, still below the threshold. Routable.
//! - **Unhealthy**: `consecutive_failures >= failure_threshold`. Not routable
//!   until a fresh probe succeeds.
//!
//! [`transition`] is a pure function: given the current counters and a probe
//! outcome it returns the next state and, when the state changed, the
//! [`HealthEvent`] to publish.

use serde::Serialize;
use std::time::Duration;

/// Health of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    /// Whether the router may send traffic to a shard in this state.
    pub fn is_routable(self) -> bool {
        !matches!(self, HealthState::Unhealthy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success { latency: Duration },
    Failure { error: String, latency: Option<Duration> },
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }

    pub fn latency(&self) -> Option<Duration> {
        match self {
            ProbeOutcome::Success { latency } => Some(*latency),
            ProbeOutcome::Failure { latency, .. } => *latency,
        }
    }
}

/// Tunables for [`transition`].
#[derive(Debug, Clone, Copy)]
pub struct TransitionParams {
    pub failure_threshold: u32,
    /// Error-rate smoothing factor.
    pub alpha: f64,
}

impl Default for TransitionParams {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            alpha: 0.3,
        }
    }
}

/// Counters carried between probes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthCounters {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub error_rate: f64,
}

impl HealthCounters {
    pub const INITIAL: HealthCounters = HealthCounters {
        state: HealthState::Unknown,
        consecutive_failures: 0,
        error_rate: 0.0,
    };
}

/// A state change, published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthEvent {
    pub shard_type: String,
    pub shard_id: u32,
    pub from: HealthState,
    pub to: HealthState,
    pub consecutive_failures: u32,
    pub error: Option<String>,
    /// Wall-clock time of the transition (epoch ms).
    pub at_ms: u64,
}

impl HealthEvent {
    /// Shard became routable again.
    pub fn is_recovery(&self) -> bool {
        !self.from.is_routable() && self.to.is_routable()
    }

    /// Shard stopped being routable.
    pub fn is_outage(&self) -> bool {
        self.from.is_routable() && !self.to.is_routable()
    }
}

/// Compute the next counters for a probe outcome.
///
/// Returns the new counters and, if the state changed, the event describing it.
pub fn transition(
    shard_type: &str,
    shard_id: u32,
    current: HealthCounters,
    outcome: &ProbeOutcome,
    params: &TransitionParams,
) -> (HealthCounters, Option<HealthEvent>) {
    let alpha = params.alpha;
    let (next, error) = match outcome {
        ProbeOutcome::Success { .. } => (
            HealthCounters {
                state: HealthState::Healthy,
                consecutive_failures: 0,
                error_rate: (1.0 - alpha) * current.error_rate,
            },
            None,
        ),
        ProbeOutcome::Failure { error, .. } => {
            let consecutive_failures = current.consecutive_failures.saturating_add(1);
            let state = if consecutive_failures >= params.failure_threshold {
                HealthState::Unhealthy
            } else {
                HealthState::Degraded
            };
            (
                HealthCounters {
                    state,
                    consecutive_failures,
                    error_rate: alpha + (1.0 - alpha) * current.error_rate,
                },
                Some(error.clone()),
            )
        }
    };

    let event = (next.state != current.state).then(|| HealthEvent {
        shard_type: shard_type.to_string(),
        shard_id,
        from: current.state,
        to: next.state,
        consecutive_failures: next.consecutive_failures,
        error,
        at_ms: epoch_millis(),
    });

    (next, event)
}

/// Get current epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
