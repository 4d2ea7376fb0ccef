//! Data models for dbgate.

pub mod connection;

pub use connection::{DatabaseType, mask_connection_string};
