//! In-memory driver shared by the integration tests.
//!
//! Every mock database records what happened to it in a shared [`MockState`]
//! so tests can assert on opens, transactions and routing.

#![allow(dead_code)]

use async_trait::async_trait;
use dbgate::config::PoolOptions;
use dbgate::db::{Connector, Database, ReplicaPolicy, Transaction};
use dbgate::{DbError, DbResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PRIMARY: &str = "mock://primary";
pub const REPLICA_A: &str = "mock://replica-a";
pub const REPLICA_B: &str = "mock://replica-b";

#[derive(Debug, Default)]
pub struct MockState {
    pub opens: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub pings: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_begin: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub failing_targets: Mutex<Vec<String>>,
    pub opened: Mutex<Vec<String>>,
    pub last_pool_options: Mutex<Option<PoolOptions>>,
    /// Target that served each pooled `execute`.
    pub writes: Mutex<Vec<String>>,
    /// Target that served each pooled `fetch_scalar`.
    pub reads: Mutex<Vec<String>>,
    /// Statements executed inside transactions, in order.
    pub tx_statements: Mutex<Vec<String>>,
    pub open_delay: Mutex<Duration>,
    pub ping_delay: Mutex<Duration>,
}

impl MockState {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        Self::count(&self.opens)
    }

    pub fn begins(&self) -> usize {
        Self::count(&self.begins)
    }

    pub fn commits(&self) -> usize {
        Self::count(&self.commits)
    }

    pub fn rollbacks(&self) -> usize {
        Self::count(&self.rollbacks)
    }

    pub fn closes(&self) -> usize {
        Self::count(&self.closes)
    }

    pub fn pings(&self) -> usize {
        Self::count(&self.pings)
    }

    pub fn fail_target(&self, target: &str) {
        self.failing_targets.lock().unwrap().push(target.to_string());
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock().unwrap() = delay;
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub fn tx_statements(&self) -> Vec<String> {
        self.tx_statements.lock().unwrap().clone()
    }
}

#[derive(Debug, Default)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, Arc<MockState>) {
        let connector = Arc::new(Self::default());
        let state = Arc::clone(&connector.state);
        (connector, state)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, target: &str, pool: &PoolOptions) -> DbResult<Arc<dyn Database>> {
        let delay = *self.state.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.state.opens.fetch_add(1, Ordering::SeqCst);
        *self.state.last_pool_options.lock().unwrap() = Some(pool.clone());

        let failing = self
            .state
            .failing_targets
            .lock()
            .unwrap()
            .iter()
            .any(|t| t == target);
        if failing {
            return Err(DbError::connection(
                format!("cannot reach {}", target),
                "start the mock server",
            ));
        }

        self.state.opened.lock().unwrap().push(target.to_string());
        Ok(Arc::new(MockDatabase {
            target: target.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

#[derive(Debug)]
pub struct MockDatabase {
    target: String,
    state: Arc<MockState>,
}

impl MockDatabase {
    pub fn standalone(target: &str) -> (Arc<dyn Database>, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let db = Arc::new(Self {
            target: target.to_string(),
            state: Arc::clone(&state),
        });
        (db, state)
    }
}

#[async_trait]
impl Database for MockDatabase {
    fn system(&self) -> &'static str {
        "mock"
    }

    async fn begin(&self) -> DbResult<Box<dyn Transaction>> {
        if self.state.fail_begin.load(Ordering::SeqCst) {
            return Err(DbError::database("cannot begin", None, ""));
        }
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
            executed: 0,
        }))
    }

    async fn execute(&self, _sql: &str) -> DbResult<u64> {
        self.state.writes.lock().unwrap().push(self.target.clone());
        Ok(1)
    }

    async fn fetch_scalar(&self, _sql: &str) -> DbResult<Option<i64>> {
        self.state.reads.lock().unwrap().push(self.target.clone());
        Ok(Some(1))
    }

    async fn ping(&self) -> DbResult<()> {
        let delay = *self.state.ping_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> DbResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockTransaction {
    state: Arc<MockState>,
    executed: i64,
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.executed += 1;
        self.state.tx_statements.lock().unwrap().push(sql.to_string());
        Ok(1)
    }

    /// Number of statements executed so far in this transaction.
    async fn fetch_scalar(&mut self, _sql: &str) -> DbResult<Option<i64>> {
        Ok(Some(self.executed))
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        if self.state.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::database("commit failed", Some("40001".to_string()), ""));
        }
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::database("rollback failed", None, ""));
        }
        Ok(())
    }
}

/// Always picks the same replica.
#[derive(Debug)]
pub struct FixedPolicy(pub usize);

impl ReplicaPolicy for FixedPolicy {
    fn select(&self, _replicas: usize) -> usize {
        self.0
    }
}
