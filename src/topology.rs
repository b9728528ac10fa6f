// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared, mostly-immutable view of the shard topology.
//!
//! One [`TopologyRegistry`] is created from the configuration and shared by
//! the router, the health monitor and the pool manager. Reads are
//! synchronous and lock-light (a `parking_lot` read lock plus an `Arc`
//! clone) because they sit on the routing hot path.
//!
//! # Administrative changes
//!
//! - [`add_shard`](TopologyRegistry::add_shard) appends a descriptor. With
//!   modulo placement this reshuffles the whole keyspace for that shard type;
//!   data must be migrated externally before it is called.
//! - [`remove_shard`](TopologyRegistry::remove_shard) only marks the shard as
//!   pending decommission and logs a warning. Routing is unchanged so keys are
//!   never silently sent to a different shard.

use crate::config::{ConnectionDescriptor, ShardTopology};
use crate::error::{Result, RouterError};
use crate::pool::PoolKey;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Registry of topologies keyed by shard type.
#[derive(Debug, Default)]
pub struct TopologyRegistry {
    topologies: RwLock<HashMap<String, Arc<ShardTopology>>>,
    pending_decommission: RwLock<BTreeSet<(String, u32)>>,
}

impl TopologyRegistry {
    /// Build a registry from configured topologies.
    pub fn new(topologies: impl IntoIterator<Item = ShardTopology>) -> Self {
        let map = topologies
            .into_iter()
            .map(|t| (t.shard_type.clone(), Arc::new(t)))
            .collect();
        Self {
            topologies: RwLock::new(map),
            pending_decommission: RwLock::new(BTreeSet::new()),
        }
    }

    /// Register a topology for a new shard type.
    pub fn register(&self, topology: ShardTopology) -> Result<()> {
        let mut topologies = self.topologies.write();
        if topologies.contains_key(&topology.shard_type) {
            return Err(RouterError::Config(format!(
                "topology for shard type '{}' already registered",
                topology.shard_type
            )));
        }
        info!(
            shard_type = %topology.shard_type,
            shard_count = topology.shards.len(),
            replicas = topology.replicas.len(),
            "Registered shard topology"
        );
        topologies.insert(topology.shard_type.clone(), Arc::new(topology));
        Ok(())
    }

    /// Get the topology for a shard type.
    pub fn get(&self, shard_type: &str) -> Option<Arc<ShardTopology>> {
        self.topologies.read().get(shard_type).cloned()
    }

    /// Get the topology or fail with `NoConfiguration`.
    pub fn require(&self, shard_type: &str) -> Result<Arc<ShardTopology>> {
        self.get(shard_type)
            .ok_or_else(|| RouterError::no_configuration(shard_type))
    }

    /// Number of shards for a shard type.
    pub fn shard_count(&self, shard_type: &str) -> Option<u32> {
        self.get(shard_type).map(|t| t.shard_count())
    }

    /// All registered shard types, sorted.
    pub fn shard_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.topologies.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Every (shard type, shard id) pair, sorted.
    pub fn all_shards(&self) -> Vec<(String, u32)> {
        let topologies = self.topologies.read();
        let mut shards: Vec<(String, u32)> = topologies
            .values()
            .flat_map(|t| (0..t.shard_count()).map(move |id| (t.shard_type.clone(), id)))
            .collect();
        shards.sort();
        shards
    }

    /// Resolve a pool key to the descriptor it should connect to.
    pub fn resolve(&self, key: &PoolKey) -> Result<(ConnectionDescriptor, Arc<ShardTopology>)> {
        let topology = self.require(&key.shard_type)?;
        let descriptor = match &key.replica_id {
            None => topology.shard(key.shard_id).cloned().ok_or_else(|| {
                RouterError::Config(format!(
                    "shard {} out of range for '{}' ({} shards)",
                    key.shard_id,
                    key.shard_type,
                    topology.shard_count()
                ))
            })?,
            Some(replica_id) => topology
                .replica(replica_id)
                .map(|r| r.connection.clone())
                .ok_or_else(|| {
                    RouterError::Config(format!(
                        "unknown replica '{}' for shard type '{}'",
                        replica_id, key.shard_type
                    ))
                })?,
        };
        Ok((descriptor, topology))
    }

    /// Append a shard to a shard type. Returns the new shard id.
    ///
    /// Changing the shard count remaps most keys; callers must have migrated
    /// data for the new modulus first.
    pub fn add_shard(&self, shard_type: &str, descriptor: ConnectionDescriptor) -> Result<u32> {
        let mut topologies = self.topologies.write();
        let current = topologies
            .get(shard_type)
            .ok_or_else(|| RouterError::no_configuration(shard_type))?;

        let mut updated = (**current).clone();
        updated.shards.push(descriptor);
        let shard_id = updated.shard_count() - 1;

        warn!(
            shard_type = %shard_type,
            shard_id,
            new_shard_count = updated.shard_count(),
            "Shard added: modulo placement for this shard type has changed"
        );
        topologies.insert(shard_type.to_string(), Arc::new(updated));
        Ok(shard_id)
    }

    /// Request decommission of a shard.
    ///
    /// Decommission is not implemented: the shard is recorded as pending and
    /// keeps receiving traffic.
    pub fn remove_shard(&self, shard_type: &str, shard_id: u32) -> Result<()> {
        let topology = self.require(shard_type)?;
        if shard_id >= topology.shard_count() {
            return Err(RouterError::Config(format!(
                "shard {} out of range for '{}' ({} shards)",
                shard_id,
                shard_type,
                topology.shard_count()
            )));
        }

        warn!(
            shard_type = %shard_type,
            shard_id,
            "Shard removal requested but live decommission is not supported; shard stays in rotation"
        );
        self.pending_decommission
            .write()
            .insert((shard_type.to_string(), shard_id));
        Ok(())
    }

    /// Shards with an outstanding removal request.
    pub fn pending_decommission(&self) -> Vec<(String, u32)> {
        self.pending_decommission.read().iter().cloned().collect()
    }

    /// Copy of every topology (for the external migration orchestrator).
    pub fn snapshot(&self) -> Vec<ShardTopology> {
        let mut topologies: Vec<ShardTopology> = self
            .topologies
            .read()
            .values()
            .map(|t| (**t).clone())
            .collect();
        topologies.sort_by(|a, b| a.shard_type.cmp(&b.shard_type));
        topologies
    }
}
