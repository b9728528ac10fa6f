// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mock backing store for testing.
//!
//! Hosts can be switched down (connect, ping and query fail), hanging
//! (ping and query never complete) or given a replication lag. Every query is
//! recorded with the host that served it.

use serde_json::{json, Value};
use shard_router::backend::{BoxFuture, Connection, Connector, Row};
use shard_router::config::ConnectionDescriptor;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A recorded query() call.
#[derive(Debug, Clone)]
pub struct QueryCall {
    pub host: String,
    pub sql: String,
}

/// Shared state behind every [`MockConnection`].
///
/// # Example
/// ```rust,ignore
/// let backend = MockBackend::new();
/// backend.set_down("users-1.db.local", true);
///
/// let router = ShardRouter::new(config, backend.connector()).unwrap();
/// // ...
/// assert_eq!(backend.queries_on("users-0.db.local"), 1);
/// ```
#[derive(Default)]
pub struct MockBackend {
    down: parking_lot::Mutex<HashSet<String>>,
    hanging: parking_lot::Mutex<HashSet<String>>,
    lag: parking_lot::Mutex<HashMap<String, Duration>>,
    queries: parking_lot::Mutex<Vec<QueryCall>>,
    connects: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector(Arc::clone(self)))
    }

    pub fn set_down(&self, host: &str, down: bool) {
        let mut hosts = self.down.lock();
        if down {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    pub fn set_hanging(&self, host: &str, hanging: bool) {
        let mut hosts = self.hanging.lock();
        if hanging {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    pub fn set_lag(&self, host: &str, lag: Duration) {
        self.lag.lock().insert(host.to_string(), lag);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<QueryCall> {
        self.queries.lock().clone()
    }

    pub fn queries_on(&self, host: &str) -> usize {
        self.queries.lock().iter().filter(|q| q.host == host).count()
    }

    fn is_down(&self, host: &str) -> bool {
        self.down.lock().contains(host)
    }

    fn is_hanging(&self, host: &str) -> bool {
        self.hanging.lock().contains(host)
    }
}

/// Host name that `ShardTopology::for_testing` gives a shard.
pub fn shard_host(shard_type: &str, shard_id: u32) -> String {
    format!("{}-{}.db.local", shard_type, shard_id)
}

/// Host name that `ReplicaDescriptor::for_testing` gives a replica.
pub fn replica_host(replica_id: &str) -> String {
    format!("{}.db.local", replica_id)
}

pub struct MockConnector(Arc<MockBackend>);

impl Connector for MockConnector {
    fn connect<'a>(
        &'a self,
        descriptor: &'a ConnectionDescriptor,
    ) -> BoxFuture<'a, Box<dyn Connection>> {
        Box::pin(async move {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if self.0.is_down(&descriptor.host) {
                return Err(format!("connection refused: {}", descriptor.host).into());
            }
            Ok(Box::new(MockConnection {
                host: descriptor.host.clone(),
                backend: Arc::clone(&self.0),
            }) as Box<dyn Connection>)
        })
    }
}

pub struct MockConnection {
    host: String,
    backend: Arc<MockBackend>,
}

impl Connection for MockConnection {
    fn ping(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.backend.is_hanging(&self.host) {
                std::future::pending::<()>().await;
            }
            if self.backend.is_down(&self.host) {
                return Err("connection reset by peer".into());
            }
            Ok(())
        })
    }

    fn query<'a>(&'a mut self, sql: &'a str, _params: &'a [Value]) -> BoxFuture<'a, Vec<Row>> {
        Box::pin(async move {
            if self.backend.is_hanging(&self.host) {
                std::future::pending::<()>().await;
            }
            if self.backend.is_down(&self.host) {
                return Err("server closed the connection unexpectedly".into());
            }
            self.backend.queries.lock().push(QueryCall {
                host: self.host.clone(),
                sql: sql.to_string(),
            });
            Ok(vec![json!({ "host": self.host })])
        })
    }

    fn replication_lag(&mut self) -> BoxFuture<'_, Option<Duration>> {
        Box::pin(async move { Ok(self.backend.lag.lock().get(&self.host).copied()) })
    }
}
