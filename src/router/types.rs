// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Router result and lifecycle types.
//!
//! # State Transitions
//!
//! ```text
//!              initialize()                 shutdown()
//! Created ───────────────────→ Running ───────────────────→ ShuttingDown
//!    │                                                          │
//!    │ shutdown()                                               │ (tasks joined,
//!    └──────────────────────────→ Stopped ←─────────────────────┘  pools closed)
//! ```
//!
//! - **Created**: after `ShardRouter::new()`. Routing already works against
//!   an empty health cache (every shard routable).
//! - **Running**: background health monitor and sweepers are active.
//! - **ShuttingDown**: background tasks are being stopped. Routing is refused.
//! - **Stopped**: pools closed. Routing is refused.

use super::entity::EntityType;
use crate::config::ConnectionDescriptor;
use serde::Serialize;

/// Lifecycle of a [`ShardRouter`](super::ShardRouter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouterState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl RouterState {
    /// Whether `route` may serve requests.
    pub fn accepts_routes(self) -> bool {
        matches!(self, RouterState::Created | RouterState::Running)
    }
}

impl std::fmt::Display for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterState::Created => write!(f, "Created"),
            RouterState::Running => write!(f, "Running"),
            RouterState::ShuttingDown => write!(f, "ShuttingDown"),
            RouterState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Where an entity lives.
///
/// For a fixed topology the shard id is a pure function of the routing key
/// unless `hot` routing overrode it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteResult {
    pub shard_id: u32,
    pub shard_type: String,
    pub entity_type: EntityType,
    pub entity_key: String,
    /// Key that was hashed (owner id for content entities).
    pub routing_key: String,
    pub connection: ConnectionDescriptor,
    /// The routing key is currently hot.
    pub hot: bool,
    /// The caller should use replicated handling for this key.
    pub replicated: bool,
}

/// Routing counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub routed: u64,
    /// All rejected requests, any error kind.
    pub rejected: u64,
    /// Rejections caused by a negative health gate.
    pub unavailable: u64,
    /// Content keys routed without an owner prefix.
    pub degraded_colocation: u64,
    /// Routes whose shard was changed by the strategy.
    pub overridden: u64,
}
