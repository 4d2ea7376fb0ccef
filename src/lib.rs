//! dbgate library
//!
//! One lazily built, shared database connection (optionally fronted by read
//! replicas), request contexts that carry the current handle down a call
//! chain, and a transaction helper that is safe to nest.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod trace;

pub use config::{Config, PoolOptions, TracingOptions};
pub use context::{Context, ContextKey, set_from_context, with_context};
pub use db::{ConnectionManager, ConnectionResult, DbHandle};
pub use error::{DbError, DbResult};
pub use trace::{DEFAULT_TRACING_SERVICE_NAME, TracingPlugin, start_span};
