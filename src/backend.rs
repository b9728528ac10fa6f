// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backing store integration traits.
//!
//! The router never talks to a database driver directly. The embedding
//! application supplies a [`Connector`] that turns a
//! [`ConnectionDescriptor`] into a live [`Connection`]; pools, health probes
//! and replica reads all go through these two traits.
//!
//! # Example
//!
//! ```rust,no_run
//! use shard_router::backend::{BoxFuture, Connection, Connector, Row};
//! use shard_router::config::ConnectionDescriptor;
//! use serde_json::Value;
//!
//! struct MyConnection;
//!
//! impl Connection for MyConnection {
//!     fn ping(&mut self) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn query<'a>(&'a mut self, _sql: &'a str, _params: &'a [Value]) -> BoxFuture<'a, Vec<Row>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//! }
//!
//! struct MyConnector;
//!
//! impl Connector for MyConnector {
//!     fn connect<'a>(&'a self, _descriptor: &'a ConnectionDescriptor) -> BoxFuture<'a, Box<dyn Connection>> {
//!         Box::pin(async move { Ok(Box::new(MyConnection) as Box<dyn Connection>) })
//!     }
//! }
//! ```

use crate::config::ConnectionDescriptor;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// One result row. The router does not interpret rows.
pub type Row = Value;

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Simplified error for backend operations.
#[derive(Debug, Clone)]
pub struct BackendError(pub String);

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackendError {}

impl From<String> for BackendError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for BackendError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// A live connection to one shard or replica.
pub trait Connection: Send + 'static {
    /// Cheap liveness check (e.g. `SELECT 1`).
    fn ping(&mut self) -> BoxFuture<'_, ()>;

    /// Execute a query and return its rows.
    fn query<'a>(&'a mut self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Vec<Row>>;

    /// Replication lag behind the primary, if this is a replica that can report it.
    ///
    /// Default implementation reports "unknown".
    fn replication_lag(&mut self) -> BoxFuture<'_, Option<Duration>> {
        Box::pin(async move { Ok(None) })
    }
}

/// Opens connections from descriptors.
///
/// The application provides an implementation; this trait allows testing
/// with mocks and decouples the router from any particular driver.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        descriptor: &'a ConnectionDescriptor,
    ) -> BoxFuture<'a, Box<dyn Connection>>;
}

/// No-op connector for standalone use and tests.
///
/// Every connection answers pings and returns empty result sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpConnector;

/// Connection handed out by [`NoOpConnector`].
#[derive(Debug, Default)]
pub struct NoOpConnection;

impl Connection for NoOpConnection {
    fn ping(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn query<'a>(&'a mut self, _sql: &'a str, _params: &'a [Value]) -> BoxFuture<'a, Vec<Row>> {
        Box::pin(async move { Ok(Vec::new()) })
    }

    fn replication_lag(&mut self) -> BoxFuture<'_, Option<Duration>> {
        Box::pin(async move { Ok(Some(Duration::ZERO)) })
    }
}

impl Connector for NoOpConnector {
    fn connect<'a>(
        &'a self,
        _descriptor: &'a ConnectionDescriptor,
    ) -> BoxFuture<'a, Box<dyn Connection>> {
        Box::pin(async move { Ok(Box::new(NoOpConnection) as Box<dyn Connection>) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_connector_round_trip() {
        let connector = NoOpConnector;
        let descriptor = ConnectionDescriptor::for_testing("db", "app");
        let mut conn = connector.connect(&descriptor).await.unwrap();

        assert!(conn.ping().await.is_ok());
        assert!(conn.query("SELECT 1", &[]).await.unwrap().is_empty());
        assert_eq!(conn.replication_lag().await.unwrap(), Some(Duration::ZERO));
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::from("connection reset");
        assert_eq!(err.to_string(), "connection reset");
        let err: BackendError = String::from("boom").into();
        assert_eq!(err.0, "boom");
    }
}
