//! Driver-facing traits.
//!
//! The connection manager never talks to sqlx directly; it goes through a
//! [`Connector`] that opens [`Database`] pools, which in turn hand out
//! [`Transaction`]s. [`SqlxConnector`](super::SqlxConnector) is the production
//! implementation; tests install their own.

use crate::config::PoolOptions;
use crate::error::DbResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Opens pooled connections to a target.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a pool for `target`, applying whichever knobs in `pool` are set.
    async fn open(&self, target: &str, pool: &PoolOptions) -> DbResult<Arc<dyn Database>>;
}

/// A pooled connection to one database instance.
#[async_trait]
pub trait Database: Send + Sync + fmt::Debug {
    /// Short system name recorded on spans ("postgresql", "mysql", "sqlite").
    fn system(&self) -> &'static str;

    async fn begin(&self) -> DbResult<Box<dyn Transaction>>;

    /// Run a statement and return the number of rows affected.
    async fn execute(&self, sql: &str) -> DbResult<u64>;

    /// First column of the first row as an integer, `None` when no row matched.
    async fn fetch_scalar(&self, sql: &str) -> DbResult<Option<i64>>;

    /// Liveness check.
    async fn ping(&self) -> DbResult<()>;

    async fn close(&self) -> DbResult<()>;
}

/// An open physical transaction.
#[async_trait]
pub trait Transaction: Send + fmt::Debug {
    async fn execute(&mut self, sql: &str) -> DbResult<u64>;

    async fn fetch_scalar(&mut self, sql: &str) -> DbResult<Option<i64>>;

    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}
