// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A scriptable mock backend (down / hanging hosts, replication lag)
//! - Topology and router builders
//! - Opt-in log output via `RUST_LOG`

#![allow(dead_code)]

pub mod mock_backend;

pub use mock_backend::*;

use shard_router::config::{ReplicaDescriptor, RouterConfig, ShardTopology};
use shard_router::ShardRouter;
use std::sync::Arc;

/// Install a test log subscriber once (honours `RUST_LOG`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// users / content / ai-tasks with `shard_count` shards each.
pub fn standard_config(shard_count: usize) -> RouterConfig {
    RouterConfig::for_testing(&["users", "content", "ai-tasks"], shard_count)
}

/// Config with a "read-replica" topology (one primary) and the given replicas.
pub fn replica_config(replicas: &[&str]) -> RouterConfig {
    let mut primary = ShardTopology::for_testing("read-replica", 1);
    primary.replicas = replicas
        .iter()
        .enumerate()
        .map(|(i, id)| ReplicaDescriptor::for_testing(id, i as u32 + 1))
        .collect();
    let mut config = standard_config(4);
    config.topologies.push(primary);
    config
}

pub fn router(config: RouterConfig, backend: &Arc<MockBackend>) -> ShardRouter {
    ShardRouter::new(config, backend.connector()).expect("valid test config")
}
