//! Read replica resolution.
//!
//! A [`ReplicaResolver`] holds the opened replica pools and a
//! [`ReplicaPolicy`] that picks one of them for each read. It never sees
//! writes: the handle routes writes, transactions and write-forced reads to
//! the primary before the resolver is consulted.

use crate::config::PoolOptions;
use crate::db::backend::{Connector, Database};
use crate::error::{DbError, DbResult};
use crate::models::mask_connection_string;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Chooses which replica serves a read.
pub trait ReplicaPolicy: Send + Sync + fmt::Debug {
    /// Return an index in `0..replicas`. `replicas` is never zero.
    fn select(&self, replicas: usize) -> usize;
}

/// Uniform random choice among the replicas.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomPolicy;

impl ReplicaPolicy for RandomPolicy {
    fn select(&self, replicas: usize) -> usize {
        rand::thread_rng().gen_range(0..replicas)
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaResolver {
    replicas: Vec<Arc<dyn Database>>,
    policy: Arc<dyn ReplicaPolicy>,
}

impl ReplicaResolver {
    pub fn new(replicas: Vec<Arc<dyn Database>>, policy: Arc<dyn ReplicaPolicy>) -> DbResult<Self> {
        if replicas.is_empty() {
            return Err(DbError::replica_registration(
                "at least one replica is required",
            ));
        }
        Ok(Self { replicas, policy })
    }

    /// Open every target through `connector` and build a resolver over them.
    ///
    /// On failure the replicas opened so far are closed again.
    pub async fn register(
        connector: &dyn Connector,
        targets: &[String],
        pool: &PoolOptions,
        policy: Arc<dyn ReplicaPolicy>,
    ) -> DbResult<Self> {
        let mut replicas = Vec::with_capacity(targets.len());
        for target in targets {
            match connector.open(target, pool).await {
                Ok(replica) => replicas.push(replica),
                Err(err) => {
                    for opened in &replicas {
                        let _ = opened.close().await;
                    }
                    return Err(DbError::replica_registration(format!(
                        "{}: {}",
                        mask_connection_string(target),
                        err
                    )));
                }
            }
        }

        info!(replicas = replicas.len(), policy = ?policy, "Registered read replicas");
        Self::new(replicas, policy)
    }

    /// The replica that should serve the next read.
    pub fn pick(&self) -> &Arc<dyn Database> {
        let index = self.policy.select(self.replicas.len());
        let index = index.min(self.replicas.len() - 1);
        debug!(replica = index, "Routing read to replica");
        &self.replicas[index]
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Close every replica, returning the first error.
    pub async fn close_all(&self) -> DbResult<()> {
        let mut first_error = None;
        for replica in &self.replicas {
            if let Err(err) = replica.close().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
