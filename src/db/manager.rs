//! The shared connection and its lifecycle.
//!
//! [`ConnectionManager`] lazily builds one [`DbHandle`] from the first valid
//! [`Config`] it is given and hands clones of it to every caller until
//! [`ConnectionManager::reset_connection`] is called.
//!
//! # Concurrency
//!
//! - The first caller spawns the initializer as its own task and stores a
//!   shared handle to it in the gate; every caller awaits that same task.
//!   Dropping a waiting caller (a timeout, a cancelled request) never aborts
//!   or restarts the initializer.
//! - The outcome lives behind a `std::sync::RwLock` that is never held across
//!   an await point. The initializer writes the active config, handle and
//!   error together.
//! - Reset bumps the gate generation. An initializer that finishes after a
//!   reset discards its outcome and closes what it opened. Callers already
//!   waiting on it then see the cleared state.

use crate::config::Config;
use crate::context::{Context, attached_handle};
use crate::db::backend::Connector;
use crate::db::handle::DbHandle;
use crate::db::pool::SqlxConnector;
use crate::db::replica::{RandomPolicy, ReplicaPolicy, ReplicaResolver};
use crate::error::{DbError, DbResult};
use crate::models::mask_connection_string;
use crate::trace::TracingPlugin;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

/// Panic message of [`ConnectionManager::must_get_from_context`].
pub const NO_CONNECTION_MESSAGE: &str =
    "dbgate: no database connection available in context or connection manager";

/// Outcome of [`ConnectionManager::get_connection`].
///
/// Both fields may be set: a failure after the primary was opened (replica
/// registration, tracing) keeps the usable handle alongside the error.
#[derive(Debug, Clone, Default)]
pub struct ConnectionResult {
    pub handle: Option<DbHandle>,
    pub error: Option<DbError>,
}

impl ConnectionResult {
    fn failed(error: DbError) -> Self {
        Self {
            handle: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.handle.is_some() && self.error.is_none()
    }

    /// The handle, or the stored error when there is one.
    pub fn into_result(self) -> DbResult<DbHandle> {
        match (self.handle, self.error) {
            (_, Some(err)) => Err(err),
            (Some(handle), None) => Ok(handle),
            (None, None) => Err(DbError::NoDatabase),
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    handle: Option<DbHandle>,
    error: Option<DbError>,
    active_config: Option<Config>,
}

type InitTask = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct Gate {
    generation: u64,
    /// `None` until the first connection attempt after construction or reset.
    init: Option<InitTask>,
}

/// Everything the spawned initializer needs, owned.
struct Initializer {
    state: Arc<RwLock<ConnectionState>>,
    gate: Arc<Mutex<Gate>>,
    generation: u64,
    connector: Arc<dyn Connector>,
    replica_policy: Arc<dyn ReplicaPolicy>,
    config: Config,
}

pub struct ConnectionManager {
    state: Arc<RwLock<ConnectionState>>,
    gate: Arc<Mutex<Gate>>,
    connector: RwLock<Arc<dyn Connector>>,
    default_connector: Arc<dyn Connector>,
    replica_policy: Arc<dyn ReplicaPolicy>,
}

fn read_state(state: &RwLock<ConnectionState>) -> RwLockReadGuard<'_, ConnectionState> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_state(state: &RwLock<ConnectionState>) -> RwLockWriteGuard<'_, ConnectionState> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock_gate(gate: &Mutex<Gate>) -> MutexGuard<'_, Gate> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    /// Manager that opens connections through sqlx.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(SqlxConnector::new()))
    }

    /// Manager whose default initializer is `connector`.
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::default())),
            gate: Arc::new(Mutex::new(Gate::default())),
            connector: RwLock::new(Arc::clone(&connector)),
            default_connector: connector,
            replica_policy: Arc::new(RandomPolicy),
        }
    }

    /// Use `policy` to choose the replica for each read.
    pub fn replica_policy(mut self, policy: Arc<dyn ReplicaPolicy>) -> Self {
        self.replica_policy = policy;
        self
    }

    fn current_connector(&self) -> Arc<dyn Connector> {
        self.connector
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return the shared connection, building it on first use.
    ///
    /// An invalid `config` is rejected before the gate is touched. Once a
    /// connection attempt has run, its outcome is returned to every caller,
    /// whatever config they pass, until [`reset_connection`] is called.
    ///
    /// Cancel safe: dropping the returned future does not abort or repeat
    /// the connection attempt.
    ///
    /// [`reset_connection`]: ConnectionManager::reset_connection
    pub async fn get_connection(&self, config: &Config) -> ConnectionResult {
        if let Err(err) = config.validate() {
            return ConnectionResult::failed(err);
        }

        self.init_task(config).await;

        let state = read_state(&self.state);
        if let Some(active) = &state.active_config {
            if active.primary_dsn != config.primary_dsn {
                debug!(
                    active = %mask_connection_string(&active.primary_dsn),
                    requested = %mask_connection_string(&config.primary_dsn),
                    "Connection already initialized; ignoring new config until reset"
                );
            }
        }
        ConnectionResult {
            handle: state.handle.clone(),
            error: state.error.clone(),
        }
    }

    /// The in-flight or finished connection attempt, spawning it if the
    /// gate is armed.
    fn init_task(&self, config: &Config) -> InitTask {
        let mut gate = lock_gate(&self.gate);
        if let Some(init) = &gate.init {
            return init.clone();
        }

        let initializer = Initializer {
            state: Arc::clone(&self.state),
            gate: Arc::clone(&self.gate),
            generation: gate.generation,
            connector: self.current_connector(),
            replica_policy: Arc::clone(&self.replica_policy),
            config: config.clone(),
        };
        let init = initializer.spawn();
        gate.init = Some(init.clone());
        init
    }

    /// The config of the current connection, or the zero value.
    pub fn get_active_config(&self) -> Config {
        read_state(&self.state)
            .active_config
            .clone()
            .unwrap_or_default()
    }

    /// The shared handle, if one has been built.
    pub fn current_handle(&self) -> Option<DbHandle> {
        read_state(&self.state).handle.clone()
    }

    /// Drop the shared connection and re-arm initialization.
    ///
    /// The old handle is closed on a best-effort basis; close errors are
    /// logged and discarded.
    pub async fn reset_connection(&self) {
        let handle = {
            let mut state = write_state(&self.state);
            state.error = None;
            state.active_config = None;
            let mut gate = lock_gate(&self.gate);
            gate.generation += 1;
            gate.init = None;
            state.handle.take()
        };

        let Some(handle) = handle else {
            return;
        };
        if let Err(err) = handle.close().await {
            debug!(error = %err, "Ignoring error while closing shared connection");
        }
        info!("Shared database connection reset");
    }

    /// Replace the initializer used by the next connection attempt.
    pub fn set_connector(&self, connector: Arc<dyn Connector>) {
        *self
            .connector
            .write()
            .unwrap_or_else(PoisonError::into_inner) = connector;
    }

    /// Restore the initializer the manager was constructed with.
    pub fn use_default_connection(&self) {
        self.set_connector(Arc::clone(&self.default_connector));
    }

    /// The handle attached to `ctx`, falling back to the shared handle.
    pub fn get_from_context(&self, ctx: &Context) -> Option<DbHandle> {
        if let Some(handle) = attached_handle(ctx) {
            return Some(handle.clone());
        }
        if let Some(handle) = self.current_handle() {
            return Some(handle);
        }
        let span = ctx.span();
        warn!(parent: &span, "No database connection in context or connection manager");
        None
    }

    /// Like [`get_from_context`](ConnectionManager::get_from_context) but
    /// panics when no handle is available.
    pub fn must_get_from_context(&self, ctx: &Context) -> DbHandle {
        match self.get_from_context(ctx) {
            Some(handle) => handle,
            None => panic!("{}", NO_CONNECTION_MESSAGE),
        }
    }

    /// Check the primary of the resolved handle within the context deadline.
    pub async fn ping(&self, ctx: &Context) -> DbResult<()> {
        let handle = self.get_from_context(ctx).ok_or(DbError::NoDatabase)?;
        handle.with_context(ctx).ping().await
    }
}

impl Initializer {
    /// Run the attempt on its own task and share its completion.
    fn spawn(self) -> InitTask {
        let shared_state = Arc::clone(&self.state);
        let gate = Arc::clone(&self.gate);
        let generation = self.generation;
        let task = tokio::spawn(self.run());

        async move {
            let Err(err) = task.await else {
                return;
            };
            error!(error = %err, "Shared database connection initializer aborted");
            let mut state = write_state(&shared_state);
            if lock_gate(&gate).generation == generation {
                state.error = Some(DbError::internal(format!(
                    "connection initializer aborted: {}",
                    err
                )));
            }
        }
        .boxed()
        .shared()
    }

    async fn run(self) {
        let config = &self.config;
        info!(
            primary = %mask_connection_string(&config.primary_dsn),
            replicas = config.replicas_dsn.len(),
            tracing = config.tracing.enabled,
            "Initializing shared database connection"
        );

        let (handle, error) = self.establish().await;
        match &error {
            Some(err) => warn!(
                error = %err,
                has_handle = handle.is_some(),
                "Shared database connection initialization failed"
            ),
            None => info!("Shared database connection ready"),
        }

        let stale = {
            let mut state = write_state(&self.state);
            if lock_gate(&self.gate).generation == self.generation {
                state.active_config = Some(self.config.clone());
                state.handle = handle;
                state.error = error;
                None
            } else {
                handle
            }
        };

        if let Some(handle) = stale {
            debug!("Connection was reset during initialization; closing new handle");
            if let Err(err) = handle.close().await {
                debug!(error = %err, "Ignoring error while closing discarded connection");
            }
        }
    }

    async fn establish(&self) -> (Option<DbHandle>, Option<DbError>) {
        let config = &self.config;
        let primary = match self.connector.open(&config.primary_dsn, &config.pool).await {
            Ok(primary) => primary,
            Err(err) => return (None, Some(err)),
        };
        let mut handle = DbHandle::new(Arc::clone(&primary));

        if !config.replicas_dsn.is_empty() {
            match ReplicaResolver::register(
                self.connector.as_ref(),
                &config.replicas_dsn,
                &config.pool,
                Arc::clone(&self.replica_policy),
            )
            .await
            {
                Ok(resolver) => handle = DbHandle::with_replicas(primary, resolver),
                Err(err) => return (Some(handle), Some(err)),
            }
        }

        if config.tracing.enabled {
            match TracingPlugin::from_options(&config.tracing) {
                Ok(plugin) => handle = handle.use_tracing(plugin),
                Err(err) => return (Some(handle), Some(err)),
            }
        }

        (Some(handle), None)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = read_state(&self.state);
        f.debug_struct("ConnectionManager")
            .field("handle", &state.handle)
            .field("error", &state.error)
            .field(
                "active_primary",
                &state
                    .active_config
                    .as_ref()
                    .map(|config| mask_connection_string(&config.primary_dsn)),
            )
            .field("replica_policy", &self.replica_policy)
            .finish()
    }
}
