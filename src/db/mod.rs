//! Database abstraction layer.
//!
//! This module provides:
//! - Driver traits and their sqlx implementation
//! - The database handle with read replica routing
//! - The shared connection manager
//! - The transaction coordinator
//! - Database dispatch macros for reducing code duplication

pub mod backend;
pub mod handle;
#[macro_use]
pub mod macros;
pub mod manager;
pub mod pool;
pub mod replica;
pub mod transaction;

pub use backend::{Connector, Database, Transaction};
pub use handle::DbHandle;
pub use manager::{ConnectionManager, ConnectionResult, NO_CONNECTION_MESSAGE};
pub use pool::{DbPool, SqlxConnector, SqlxDatabase};
pub use replica::{RandomPolicy, ReplicaPolicy, ReplicaResolver};
