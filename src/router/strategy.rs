// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard selection strategies.
//!
//! A strategy only picks a shard id. Input validation, the health gate,
//! descriptor resolution and metrics stay in
//! [`ShardRouter`](super::ShardRouter), so alternative strategies cannot skip
//! them.

use super::entity::{shard_for, EntityType};
use crate::health::HealthMonitor;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Everything a strategy may look at when choosing a shard.
pub struct SelectionContext<'a> {
    pub entity_type: EntityType,
    pub entity_key: &'a str,
    /// Key after owner-prefix extraction.
    pub routing_key: &'a str,
    pub shard_type: &'a str,
    /// Always non-zero.
    pub shard_count: u32,
    /// Cached health only; strategies must not probe.
    pub health: &'a HealthMonitor,
}

/// A strategy's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardSelection {
    pub shard_id: u32,
    /// The routing key is currently hot.
    pub hot: bool,
    /// The caller should use replicated handling for this key.
    pub replicated: bool,
    /// The shard differs from plain modulo placement.
    pub overridden: bool,
}

impl ShardSelection {
    pub fn standard(shard_id: u32) -> Self {
        Self {
            shard_id,
            ..Default::default()
        }
    }
}

/// Picks a shard id for a routing key.
pub trait ShardStrategy: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Choose a shard in `0..ctx.shard_count`.
    fn select_shard(&self, ctx: &SelectionContext<'_>) -> ShardSelection;

    /// Start any background maintenance. Called once by `ShardRouter::initialize()`.
    fn start_background(&self, _shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        None
    }
}

/// Plain `hash(routing_key) % shard_count` placement. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuloStrategy;

impl ShardStrategy for ModuloStrategy {
    fn name(&self) -> &'static str {
        "modulo"
    }

    fn select_shard(&self, ctx: &SelectionContext<'_>) -> ShardSelection {
        ShardSelection::standard(shard_for(ctx.routing_key, ctx.shard_count))
    }
}

impl<S: ShardStrategy> ShardStrategy for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn select_shard(&self, ctx: &SelectionContext<'_>) -> ShardSelection {
        (**self).select_shard(ctx)
    }

    fn start_background(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        (**self).start_background(shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoOpConnector;
    use crate::config::{HealthConfig, PoolConfig, ShardTopology};
    use crate::pool::ConnectionPoolManager;
    use crate::topology::TopologyRegistry;

    fn health() -> HealthMonitor {
        let registry = Arc::new(TopologyRegistry::new(vec![ShardTopology::for_testing("users", 4)]));
        let pools = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&registry),
            Arc::new(NoOpConnector),
            PoolConfig::default(),
        ));
        HealthMonitor::new(registry, pools, HealthConfig::default())
    }

    #[test]
    fn test_modulo_matches_hash() {
        let health = health();
        let ctx = SelectionContext {
            entity_type: EntityType::User,
            entity_key: "alice",
            routing_key: "alice",
            shard_type: "users",
            shard_count: 4,
            health: &health,
        };
        let selection = ModuloStrategy.select_shard(&ctx);
        assert_eq!(selection, ShardSelection::standard(shard_for("alice", 4)));
        assert!(!selection.hot);
        assert!(!selection.overridden);
    }

    #[test]
    fn test_arc_strategy_delegates() {
        let health = health();
        let ctx = SelectionContext {
            entity_type: EntityType::Post,
            entity_key: "bob:p1",
            routing_key: "bob",
            shard_type: "users",
            shard_count: 4,
            health: &health,
        };
        let strategy = Arc::new(ModuloStrategy);
        assert_eq!(strategy.name(), "modulo");
        assert_eq!(
            strategy.select_shard(&ctx),
            ModuloStrategy.select_shard(&ctx)
        );
    }
}
