//! Configuration handling for dbgate.
//!
//! [`Config`] is the immutable record the connection manager is initialized
//! from. [`Cli`] is the command line / environment surface of the `dbgate`
//! binary and only assembles a [`Config`]; the library never reads the
//! environment itself.

use crate::error::{DbError, DbResult};
use clap::Parser;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Decides whether an error is flagged on a trace span.
pub type ErrorCheck = Arc<dyn Fn(&DbError) -> bool + Send + Sync>;

/// Connection pool knobs forwarded to the driver.
///
/// `None` leaves the driver default in place; it is never treated as zero.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum number of open connections.
    pub max_open_conns: Option<u32>,
    /// Cap on idle connections. sqlx pools have no such cap, so the sqlx
    /// connector does not apply it.
    pub max_idle_conns: Option<u32>,
    /// Maximum lifetime of a single connection.
    pub conn_max_lifetime: Option<Duration>,
    /// Maximum time a connection may sit idle before it is closed.
    pub conn_max_idle_time: Option<Duration>,
}

impl PoolOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Open-connection cap to apply to a pool. Zero means unlimited and
    /// leaves the driver default in place.
    pub fn open_limit(&self) -> Option<u32> {
        self.max_open_conns.filter(|&open| open > 0)
    }
}

/// Tracing settings; only meaningful when `enabled` is true.
#[derive(Clone, Default)]
pub struct TracingOptions {
    pub enabled: bool,
    /// Service name recorded on spans. Empty means the tracing default.
    pub service_name: String,
    /// Fraction of traces sent to analytics. `None` means the tracing default.
    pub analytics_rate: Option<f64>,
    /// `None` flags every error.
    pub error_check: Option<ErrorCheck>,
}

impl fmt::Debug for TracingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingOptions")
            .field("enabled", &self.enabled)
            .field("service_name", &self.service_name)
            .field("analytics_rate", &self.analytics_rate)
            .field("has_error_check", &self.error_check.is_some())
            .finish()
    }
}

/// Settings for the shared connection.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Data source for the primary (read-write) instance. Required.
    pub primary_dsn: String,
    /// Read-only replicas. Reads that are not forced to the primary are
    /// spread across these at random.
    pub replicas_dsn: Vec<String>,
    pub pool: PoolOptions,
    pub tracing: TracingOptions,
}

impl Config {
    pub fn new(primary_dsn: impl Into<String>) -> Self {
        Self {
            primary_dsn: primary_dsn.into(),
            ..Self::default()
        }
    }

    /// The only rule: the primary data source must be set.
    pub fn validate(&self) -> DbResult<()> {
        if self.primary_dsn.is_empty() {
            return Err(DbError::invalid_config("primary_dsn is required"));
        }
        Ok(())
    }

    pub fn with_replicas<I, S>(mut self, replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replicas_dsn = replicas.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    /// Turn on tracing of database operations.
    pub fn with_tracing(mut self) -> Self {
        self.tracing.enabled = true;
        self
    }

    pub fn with_tracing_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.tracing.service_name = service_name.into();
        self
    }

    /// Values are expected in `0.0..=1.0`; anything else is rejected when
    /// tracing is installed.
    pub fn with_tracing_analytics_rate(mut self, rate: f64) -> Self {
        self.tracing.analytics_rate = Some(rate);
        self
    }

    pub fn with_tracing_error_check<F>(mut self, error_check: F) -> Self
    where
        F: Fn(&DbError) -> bool + Send + Sync + 'static,
    {
        self.tracing.error_check = Some(Arc::new(error_check));
        self
    }
}

/// Command line and environment configuration for the `dbgate` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dbgate",
    about = "Connect to a database through the shared connection manager, check it and run statements in one transaction",
    version
)]
pub struct Cli {
    /// Primary (read-write) database URL
    #[arg(short, long, value_name = "URL", env = "DBGATE_PRIMARY_DSN")]
    pub primary: String,

    /// Read replica URL. Can be specified multiple times or comma-separated.
    #[arg(
        short,
        long = "replica",
        value_name = "URL",
        env = "DBGATE_REPLICAS_DSN",
        value_delimiter = ','
    )]
    pub replicas: Vec<String>,

    /// Maximum open connections in the pool
    #[arg(long, env = "DBGATE_MAX_OPEN_CONNS")]
    pub max_open_conns: Option<u32>,

    /// Idle connections kept in the pool
    #[arg(long, env = "DBGATE_MAX_IDLE_CONNS")]
    pub max_idle_conns: Option<u32>,

    /// Maximum connection lifetime in seconds
    #[arg(long, env = "DBGATE_CONN_MAX_LIFETIME")]
    pub conn_max_lifetime_secs: Option<u64>,

    /// Maximum connection idle time in seconds
    #[arg(long, env = "DBGATE_CONN_MAX_IDLE_TIME")]
    pub conn_max_idle_time_secs: Option<u64>,

    /// Trace database operations
    #[arg(long = "tracing", env = "DBGATE_TRACING")]
    pub tracing: bool,

    /// Service name recorded on database spans
    #[arg(long, env = "DBGATE_TRACING_SERVICE_NAME", default_value = "")]
    pub tracing_service_name: String,

    /// Fraction of traces sent to analytics (0.0 to 1.0)
    #[arg(long, env = "DBGATE_TRACING_ANALYTICS_RATE")]
    pub tracing_analytics_rate: Option<f64>,

    /// Deadline for the whole run in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, env = "DBGATE_TIMEOUT")]
    pub timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "DBGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBGATE_JSON_LOGS")]
    pub json_logs: bool,

    /// SQL statements executed, in order, inside a single transaction
    #[arg(value_name = "SQL")]
    pub statements: Vec<String>,
}

impl Cli {
    /// Assemble the library configuration.
    pub fn to_config(&self) -> Config {
        let mut config = Config::new(self.primary.clone())
            .with_replicas(self.replicas.iter().filter(|r| !r.is_empty()).cloned())
            .with_pool(PoolOptions {
                max_open_conns: self.max_open_conns,
                max_idle_conns: self.max_idle_conns,
                conn_max_lifetime: self.conn_max_lifetime_secs.map(Duration::from_secs),
                conn_max_idle_time: self.conn_max_idle_time_secs.map(Duration::from_secs),
            });

        if self.tracing {
            config = config
                .with_tracing()
                .with_tracing_service_name(self.tracing_service_name.clone());
            if let Some(rate) = self.tracing_analytics_rate {
                config = config.with_tracing_analytics_rate(rate);
            }
        }
        config
    }

    /// Get the run deadline as a Duration.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
