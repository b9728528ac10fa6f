// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the shard router.
//!
//! Errors are categorized by who has to act on them. Caller bugs and
//! configuration problems are never retried; availability problems are
//! surfaced with enough context (entity type, key, shard/replica id) for the
//! caller to back off and retry or translate into a domain response.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `InvalidInput` | No | Empty/malformed routing key or unknown entity type |
//! | `NoConfiguration` | No | No topology registered for a shard type |
//! | `ShardUnavailable` | Yes | Cached health of the selected shard is negative |
//! | `PoolExhausted` | Yes | Acquire timed out waiting for a pooled connection |
//! | `ReplicaUnavailable` | No | No replica meets the constraints (normally absorbed) |
//! | `Connection` | Yes | Opening a connection to a shard or replica failed |
//! | `Query` | Yes | The backing store rejected or failed a query |
//! | `Timeout` | Yes | A probe, query or connect exceeded its deadline |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Router lifecycle violation |
//! | `Shutdown` | No | Router or pool is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The router itself never retries `ShardUnavailable`; use
//! [`RouterError::is_retryable()`] at the call site to decide whether to back
//! off and try again.

use thiserror::Error;

/// Result type alias for routing operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors that can occur while routing, pooling or serving replica reads.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The routing key or entity type is unusable.
    ///
    /// A caller bug. Not retryable.
    #[error("Invalid input for {entity_type} (key {key:?}): {reason}")]
    InvalidInput {
        entity_type: String,
        key: String,
        reason: String,
    },

    /// No topology is registered for the shard type.
    ///
    /// A startup/configuration bug, fatal at the call site.
    #[error("No topology configured for shard type '{shard_type}'")]
    NoConfiguration { shard_type: String },

    /// The selected shard is known to be unhealthy.
    ///
    /// Retryable by the caller after backoff. The router never retries internally.
    #[error("Shard {shard_type}/{shard_id} unavailable for {entity_type} key {key:?}")]
    ShardUnavailable {
        shard_type: String,
        shard_id: u32,
        entity_type: String,
        key: String,
    },

    /// Timed out waiting for a connection from a saturated pool.
    #[error("Connection pool {shard_type}/{shard_id} exhausted after waiting {waited_ms}ms")]
    PoolExhausted {
        shard_type: String,
        shard_id: u32,
        waited_ms: u64,
    },

    /// No replica satisfies the requested consistency constraints.
    ///
    /// The replica manager absorbs this by falling back to the primary and
    /// reports it in `ReplicaStatistics::last_fallback`.
    #[error("No replica available: {reason}")]
    ReplicaUnavailable { reason: String },

    /// Opening a connection failed.
    #[error("Connection error ({target}): {message}")]
    Connection { target: String, message: String },

    /// The backing store failed a query.
    #[error("Query error ({target}): {message}")]
    Query { target: String, message: String },

    /// An operation exceeded its deadline.
    #[error("Timeout during {operation} on {target} after {timeout_ms}ms")]
    Timeout {
        operation: String,
        target: String,
        timeout_ms: u64,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress (or the pool was closed).
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Create an `InvalidInput` error.
    pub fn invalid_input(
        entity_type: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidInput {
            entity_type: entity_type.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a `NoConfiguration` error.
    pub fn no_configuration(shard_type: impl Into<String>) -> Self {
        Self::NoConfiguration {
            shard_type: shard_type.into(),
        }
    }

    /// Create a `Timeout` error from a `Duration`.
    pub fn timeout(
        operation: impl Into<String>,
        target: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            target: target.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ShardUnavailable { .. } => true,
            Self::PoolExhausted { .. } => true, // Backpressure
            Self::Connection { .. } => true,
            Self::Query { .. } => true,
            Self::Timeout { .. } => true,
            Self::InvalidInput { .. } => false, // Caller bug
            Self::NoConfiguration { .. } => false,
            Self::ReplicaUnavailable { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short, stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::NoConfiguration { .. } => "no_configuration",
            Self::ShardUnavailable { .. } => "shard_unavailable",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::ReplicaUnavailable { .. } => "replica_unavailable",
            Self::Connection { .. } => "connection",
            Self::Query { .. } => "query",
            Self::Timeout { .. } => "timeout",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
