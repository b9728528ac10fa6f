// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Shard Router
//!
//! Decides which physical database partition (shard) or replica serves each
//! data access, tracks the health of every partition, and adapts routing to
//! load and failure conditions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               shard-router                               │
//! │                                                                          │
//! │  route(entity, key)                                                      │
//! │     │                                                                    │
//! │     ▼                                                                    │
//! │  ┌─────────────┐   ┌──────────────────┐   ┌───────────────────────────┐  │
//! │  │ ShardRouter │──►│ ShardStrategy    │──►│ HealthMonitor (cache only)│  │
//! │  │ (entity →   │   │ modulo / hot-key │   │ probes in the background  │  │
//! │  │  shard type)│   └──────────────────┘   └─────────────┬─────────────┘  │
//! │  └──────┬──────┘                                        │                │
//! │         │ connect()                                     │ ping           │
//! │         ▼                                               ▼                │
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │ ConnectionPoolManager (per shard / replica, bounded, lazy)       │    │
//! │  └──────────────────────────────────────────────────────────────────┘    │
//! │         ▲                                                                │
//! │         │ read / write                                                   │
//! │  ┌──────┴─────────┐                                                      │
//! │  │ ReplicaManager │  consistency levels, load balancing, circuit         │
//! │  └────────────────┘                                                      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shard_router::{EntityType, RouterConfig, ShardRouter};
//! use shard_router::backend::NoOpConnector;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RouterConfig::for_testing(&["users", "content", "ai-tasks"], 4);
//!     let router = ShardRouter::new(config, Arc::new(NoOpConnector)).expect("valid config");
//!     router.initialize().await.expect("Failed to start");
//!
//!     let user = router.route(EntityType::User, "alice").unwrap();
//!     let post = router.route(EntityType::Post, "alice:post-1").unwrap();
//!     assert_eq!(user.shard_id, post.shard_id);
//!
//!     router.shutdown().await;
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod replica;
pub mod resilience;
pub mod router;
pub mod topology;

// Re-exports for convenience
pub use backend::{Connection, Connector, NoOpConnector};
pub use config::{
    ConnectionDescriptor, HealthConfig, HotKeyConfig, PoolConfig, ReplicaConfig,
    ReplicaDescriptor, RouterConfig, ShardTopology,
};
pub use error::{Result, RouterError};
pub use health::{HealthMonitor, HealthState, ShardHealthRecord};
pub use pool::{ConnectionPoolManager, PoolKey, PoolStats, PooledConnection};
pub use replica::{
    Consistency, LoadBalancingPolicy, ReadOptions, ReadResult, ReplicaManager, ReplicaStatistics,
    WriteResult,
};
pub use router::{
    EntityType, HotKeyStrategy, ModuloStrategy, RouteResult, RouterState, ShardRouter,
    ShardStrategy,
};
pub use topology::TopologyRegistry;
