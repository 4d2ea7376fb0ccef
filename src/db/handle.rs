//! The database handle passed around by callers.
//!
//! A [`DbHandle`] is either the shared pooled connection (a primary plus
//! optional replicas) or an open transaction on the primary. It is cheap to
//! clone; clones share the same underlying resource.
//!
//! Routing rules:
//! - `execute` and `begin` always go to the primary.
//! - `fetch_scalar` goes to a replica unless the handle is write-forced
//!   ([`DbHandle::write`]) or no replicas are registered.
//! - Every operation on a transaction handle goes to its transaction.

use crate::context::Context;
use crate::db::backend::{Database, Transaction};
use crate::db::replica::ReplicaResolver;
use crate::error::{DbError, DbResult};
use crate::trace::TracingPlugin;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{Span, debug};

struct Router {
    primary: Arc<dyn Database>,
    replicas: Option<ReplicaResolver>,
}

impl Router {
    fn read_target(&self, force_write: bool) -> &Arc<dyn Database> {
        match &self.replicas {
            Some(resolver) if !force_write => resolver.pick(),
            _ => &self.primary,
        }
    }
}

struct TxResource {
    id: String,
    router: Arc<Router>,
    /// `None` once committed or rolled back.
    tx: Mutex<Option<Box<dyn Transaction>>>,
}

#[derive(Clone)]
enum Resource {
    Pool(Arc<Router>),
    Transaction(Arc<TxResource>),
}

#[derive(Clone)]
pub struct DbHandle {
    resource: Resource,
    ctx: Option<Context>,
    force_write: bool,
    tracer: Option<Arc<TracingPlugin>>,
}

impl DbHandle {
    /// Handle over a single primary with no replicas.
    pub fn new(primary: Arc<dyn Database>) -> Self {
        Self::from_router(Router {
            primary,
            replicas: None,
        })
    }

    /// Handle over a primary whose reads are spread across `replicas`.
    pub fn with_replicas(primary: Arc<dyn Database>, replicas: ReplicaResolver) -> Self {
        Self::from_router(Router {
            primary,
            replicas: Some(replicas),
        })
    }

    fn from_router(router: Router) -> Self {
        Self {
            resource: Resource::Pool(Arc::new(router)),
            ctx: None,
            force_write: false,
            tracer: None,
        }
    }

    /// Install tracing on this handle and everything derived from it.
    pub fn use_tracing(mut self, plugin: TracingPlugin) -> Self {
        self.tracer = Some(Arc::new(plugin));
        self
    }

    pub fn is_traced(&self) -> bool {
        self.tracer.is_some()
    }

    /// True when the underlying resource is an open transaction rather than
    /// the pooled connection.
    pub fn is_transaction(&self) -> bool {
        matches!(self.resource, Resource::Transaction(_))
    }

    pub fn transaction_id(&self) -> Option<&str> {
        match &self.resource {
            Resource::Transaction(tx) => Some(&tx.id),
            Resource::Pool(_) => None,
        }
    }

    pub fn has_replicas(&self) -> bool {
        self.router().replicas.is_some()
    }

    /// Whether two handles share the same underlying resource.
    pub fn same_resource(&self, other: &DbHandle) -> bool {
        match (&self.resource, &other.resource) {
            (Resource::Pool(a), Resource::Pool(b)) => Arc::ptr_eq(a, b),
            (Resource::Transaction(a), Resource::Transaction(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// A handle whose operations observe `ctx`: its deadline bounds every
    /// driver call and its span parents the query spans.
    pub fn with_context(&self, ctx: &Context) -> DbHandle {
        DbHandle {
            ctx: Some(ctx.clone()),
            ..self.clone()
        }
    }

    pub fn context(&self) -> Option<&Context> {
        self.ctx.as_ref()
    }

    /// A handle whose reads are pinned to the primary.
    pub fn write(&self) -> DbHandle {
        DbHandle {
            force_write: true,
            ..self.clone()
        }
    }

    pub fn is_write_forced(&self) -> bool {
        self.force_write
    }

    fn router(&self) -> &Arc<Router> {
        match &self.resource {
            Resource::Pool(router) => router,
            Resource::Transaction(tx) => &tx.router,
        }
    }

    /// Begin a transaction on the primary.
    ///
    /// Fails on a handle that already is a transaction; nesting is handled
    /// by the transaction coordinator, never by a second `begin`.
    pub async fn begin(&self) -> DbResult<DbHandle> {
        let router = match &self.resource {
            Resource::Pool(router) => Arc::clone(router),
            Resource::Transaction(tx) => {
                return Err(DbError::transaction(
                    "Transaction already in progress",
                    tx.id.clone(),
                ));
            }
        };

        let tx = self
            .run("begin", router.primary.system(), router.primary.begin())
            .await?;
        let id = format!("tx_{}", uuid::Uuid::new_v4().simple());
        debug!(transaction_id = %id, "Transaction started");

        Ok(DbHandle {
            resource: Resource::Transaction(Arc::new(TxResource {
                id,
                router,
                tx: Mutex::new(Some(tx)),
            })),
            ctx: self.ctx.clone(),
            force_write: true,
            tracer: self.tracer.clone(),
        })
    }

    pub async fn commit(&self) -> DbResult<()> {
        let (resource, tx) = self.take_transaction().await?;
        self.run("commit", resource.router.primary.system(), tx.commit())
            .await?;
        debug!(transaction_id = %resource.id, "Transaction committed");
        Ok(())
    }

    pub async fn rollback(&self) -> DbResult<()> {
        let (resource, tx) = self.take_transaction().await?;
        self.run("rollback", resource.router.primary.system(), tx.rollback())
            .await?;
        debug!(transaction_id = %resource.id, "Transaction rolled back");
        Ok(())
    }

    async fn take_transaction(&self) -> DbResult<(&TxResource, Box<dyn Transaction>)> {
        match &self.resource {
            Resource::Transaction(resource) => {
                let tx = resource.tx.lock().await.take().ok_or_else(|| {
                    DbError::transaction("Transaction is no longer active", resource.id.clone())
                })?;
                Ok((resource.as_ref(), tx))
            }
            Resource::Pool(_) => Err(DbError::transaction("Handle is not a transaction", "")),
        }
    }

    /// Run a statement and return the number of rows affected.
    pub async fn execute(&self, sql: &str) -> DbResult<u64> {
        match &self.resource {
            Resource::Pool(router) => {
                let primary = &router.primary;
                self.run("execute", primary.system(), primary.execute(sql))
                    .await
            }
            Resource::Transaction(resource) => {
                let system = resource.router.primary.system();
                self.run("execute", system, async {
                    let mut guard = resource.tx.lock().await;
                    let tx = guard.as_mut().ok_or_else(|| {
                        DbError::transaction("Transaction is no longer active", resource.id.clone())
                    })?;
                    tx.execute(sql).await
                })
                .await
            }
        }
    }

    /// First column of the first row as an integer.
    pub async fn fetch_scalar(&self, sql: &str) -> DbResult<Option<i64>> {
        match &self.resource {
            Resource::Pool(router) => {
                let target = router.read_target(self.force_write);
                self.run("fetch_scalar", target.system(), target.fetch_scalar(sql))
                    .await
            }
            Resource::Transaction(resource) => {
                let system = resource.router.primary.system();
                self.run("fetch_scalar", system, async {
                    let mut guard = resource.tx.lock().await;
                    let tx = guard.as_mut().ok_or_else(|| {
                        DbError::transaction("Transaction is no longer active", resource.id.clone())
                    })?;
                    tx.fetch_scalar(sql).await
                })
                .await
            }
        }
    }

    /// Liveness check against the primary.
    ///
    /// Fails immediately on a transaction handle, whose only connection is
    /// busy with the transaction.
    pub async fn ping(&self) -> DbResult<()> {
        if let Resource::Transaction(resource) = &self.resource {
            return Err(DbError::transaction(
                "Ping is not available on a transaction handle",
                resource.id.clone(),
            ));
        }
        let primary = &self.router().primary;
        self.run("ping", primary.system(), primary.ping()).await
    }

    /// Close the primary and every replica.
    ///
    /// A transaction handle does not own the pool and closes nothing.
    pub async fn close(&self) -> DbResult<()> {
        let Resource::Pool(router) = &self.resource else {
            return Ok(());
        };
        let primary = router.primary.close().await;
        let replicas = match &router.replicas {
            Some(resolver) => resolver.close_all().await,
            None => Ok(()),
        };
        primary.and(replicas)
    }

    /// Apply the bound context deadline and the tracing plugin to a driver call.
    async fn run<T, F>(&self, operation: &'static str, system: &'static str, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let deadline = self.ctx.as_ref().and_then(Context::deadline);
        let bounded = async move {
            match deadline {
                Some(deadline) if deadline <= Instant::now() => {
                    Err(DbError::timeout(operation, 0))
                }
                Some(deadline) => {
                    let started = Instant::now();
                    tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut)
                        .await
                        .unwrap_or_else(|_| {
                            Err(DbError::timeout(
                                operation,
                                started.elapsed().as_millis() as u64,
                            ))
                        })
                }
                None => fut.await,
            }
        };

        match &self.tracer {
            Some(tracer) => {
                let parent = self.ctx.as_ref().map_or_else(Span::current, Context::span);
                tracer.instrument(&parent, system, operation, bounded).await
            }
            None => bounded.await,
        }
    }
}

impl fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let router = self.router();
        f.debug_struct("DbHandle")
            .field("primary", &router.primary)
            .field(
                "replicas",
                &router.replicas.as_ref().map_or(0, ReplicaResolver::len),
            )
            .field("transaction_id", &self.transaction_id())
            .field("force_write", &self.force_write)
            .field("bound_to_context", &self.ctx.is_some())
            .field("tracer", &self.tracer)
            .finish()
    }
}
