//! Integration tests for the shared connection lifecycle.

mod common;

use common::{FixedPolicy, MockConnector, PRIMARY, REPLICA_A, REPLICA_B};
use dbgate::config::PoolOptions;
use dbgate::{Config, ConnectionManager, DbError};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_calls_initialize_once() {
    let (connector, state) = MockConnector::new();
    state.set_open_delay(Duration::from_millis(50));
    let manager = Arc::new(ConnectionManager::with_connector(connector));
    let config = Config::new(PRIMARY);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = Arc::clone(&manager);
        let config = config.clone();
        tasks.push(tokio::spawn(async move {
            manager.get_connection(&config).await
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        let result = task.await.unwrap();
        assert!(result.is_ok());
        handles.push(result.handle.unwrap());
    }

    assert_eq!(state.opens(), 1);
    let first = &handles[0];
    assert!(handles.iter().all(|handle| handle.same_resource(first)));
}

#[tokio::test]
async fn test_invalid_config_does_not_consume_the_gate() {
    let (connector, state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(connector);

    let rejected = manager.get_connection(&Config::default()).await;
    assert!(rejected.handle.is_none());
    assert!(matches!(rejected.error, Some(DbError::InvalidConfig { .. })));
    assert_eq!(state.opens(), 0);

    let accepted = manager.get_connection(&Config::new(PRIMARY)).await;
    assert!(accepted.is_ok());
    assert_eq!(state.opens(), 1);
}

#[tokio::test]
async fn test_config_is_frozen_until_reset() {
    let (connector, state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(connector);

    let first = manager.get_connection(&Config::new(PRIMARY)).await;
    let second = manager
        .get_connection(&Config::new("mock://somewhere-else"))
        .await;

    assert!(second.is_ok());
    assert!(
        second
            .handle
            .unwrap()
            .same_resource(&first.handle.unwrap())
    );
    assert_eq!(state.opened(), vec![PRIMARY]);
    assert_eq!(manager.get_active_config().primary_dsn, PRIMARY);
}

#[tokio::test]
async fn test_active_config_is_zero_before_init() {
    let (connector, _state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(connector);

    let config = manager.get_active_config();
    assert!(config.primary_dsn.is_empty());
    assert!(config.replicas_dsn.is_empty());
    assert!(!config.tracing.enabled);
}

#[tokio::test]
async fn test_reset_closes_and_rearms() {
    let (connector, state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(connector);

    let first = manager.get_connection(&Config::new(PRIMARY)).await;
    assert!(first.is_ok());

    manager.reset_connection().await;
    assert_eq!(state.closes(), 1);
    assert!(manager.current_handle().is_none());
    assert!(manager.get_active_config().primary_dsn.is_empty());

    let second = manager
        .get_connection(&Config::new("mock://after-reset"))
        .await;
    assert!(second.is_ok());
    assert_eq!(state.opens(), 2);
    assert_eq!(manager.get_active_config().primary_dsn, "mock://after-reset");
    assert!(
        !second
            .handle
            .unwrap()
            .same_resource(&first.handle.unwrap())
    );
}

#[tokio::test]
async fn test_abandoned_first_call_does_not_repeat_initialization() {
    let (connector, state) = MockConnector::new();
    state.set_open_delay(Duration::from_millis(100));
    let manager = ConnectionManager::with_connector(connector);
    let config = Config::new(PRIMARY).with_replicas([REPLICA_A]);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(150), manager.get_connection(&config)).await;
    assert!(abandoned.is_err());
    assert!(manager.get_active_config().primary_dsn.is_empty());
    assert!(manager.current_handle().is_none());

    let result = manager.get_connection(&config).await;
    assert!(result.is_ok());
    assert_eq!(state.opens(), 2);
    assert_eq!(state.opened(), vec![PRIMARY, REPLICA_A]);
    assert_eq!(state.closes(), 0);
    assert_eq!(manager.get_active_config().primary_dsn, PRIMARY);
}

#[tokio::test]
async fn test_reset_during_initialization_closes_late_handle() {
    let (connector, state) = MockConnector::new();
    state.set_open_delay(Duration::from_millis(100));
    let manager = ConnectionManager::with_connector(connector);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        manager.get_connection(&Config::new(PRIMARY)),
    )
    .await;
    assert!(abandoned.is_err());

    manager.reset_connection().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(state.opens(), 1);
    assert_eq!(state.closes(), 1);
    assert!(manager.current_handle().is_none());
    assert!(manager.get_active_config().primary_dsn.is_empty());

    assert!(manager.get_connection(&Config::new(PRIMARY)).await.is_ok());
    assert_eq!(state.opens(), 2);
}

#[tokio::test]
async fn test_open_failure_is_stored_and_returned_to_later_callers() {
    let (connector, state) = MockConnector::new();
    state.fail_target(PRIMARY);
    let manager = ConnectionManager::with_connector(connector);

    let first = manager.get_connection(&Config::new(PRIMARY)).await;
    assert!(first.handle.is_none());
    assert!(matches!(first.error, Some(DbError::Connection { .. })));

    let second = manager.get_connection(&Config::new(PRIMARY)).await;
    assert_eq!(second.error, first.error);
    assert_eq!(state.opens(), 1);
    assert_eq!(manager.get_active_config().primary_dsn, PRIMARY);

    manager.reset_connection().await;
    state.failing_targets.lock().unwrap().clear();
    assert!(manager.get_connection(&Config::new(PRIMARY)).await.is_ok());
}

#[tokio::test]
async fn test_pool_knobs_are_forwarded() {
    let (connector, state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(connector);
    let pool = PoolOptions {
        max_open_conns: Some(20),
        max_idle_conns: Some(5),
        conn_max_lifetime: Some(Duration::from_secs(600)),
        conn_max_idle_time: None,
    };

    let result = manager
        .get_connection(&Config::new(PRIMARY).with_pool(pool.clone()))
        .await;

    assert!(result.is_ok());
    assert_eq!(*state.last_pool_options.lock().unwrap(), Some(pool));
}

#[tokio::test]
async fn test_unlimited_pool_knobs_are_not_rejected() {
    let (connector, state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(connector);
    let pool = PoolOptions {
        max_open_conns: Some(0),
        max_idle_conns: Some(5),
        ..PoolOptions::default()
    };

    let result = manager
        .get_connection(&Config::new(PRIMARY).with_pool(pool.clone()))
        .await;

    assert!(result.is_ok());
    assert_eq!(*state.last_pool_options.lock().unwrap(), Some(pool));
}

#[tokio::test]
async fn test_replicas_serve_reads_and_primary_serves_writes() {
    let (connector, state) = MockConnector::new();
    let manager =
        ConnectionManager::with_connector(connector).replica_policy(Arc::new(FixedPolicy(1)));
    let config = Config::new(PRIMARY).with_replicas([REPLICA_A, REPLICA_B]);

    let handle = manager.get_connection(&config).await.into_result().unwrap();
    assert!(handle.has_replicas());
    assert_eq!(state.opened(), vec![PRIMARY, REPLICA_A, REPLICA_B]);

    handle.fetch_scalar("SELECT 1").await.unwrap();
    handle.write().fetch_scalar("SELECT 1").await.unwrap();
    handle.execute("UPDATE t SET x = 1").await.unwrap();

    assert_eq!(state.reads(), vec![REPLICA_B, PRIMARY]);
    assert_eq!(state.writes(), vec![PRIMARY]);
}

#[tokio::test]
async fn test_reset_closes_replicas_too() {
    let (connector, state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(connector);
    let config = Config::new(PRIMARY).with_replicas([REPLICA_A, REPLICA_B]);

    assert!(manager.get_connection(&config).await.is_ok());
    manager.reset_connection().await;

    assert_eq!(state.closes(), 3);
}

#[tokio::test]
async fn test_replica_failure_keeps_primary_handle() {
    let (connector, state) = MockConnector::new();
    state.fail_target(REPLICA_B);
    let manager = ConnectionManager::with_connector(connector);
    let config = Config::new(PRIMARY).with_replicas([REPLICA_A, REPLICA_B]);

    let result = manager.get_connection(&config).await;
    let handle = result.handle.expect("primary-only handle");
    assert!(!handle.has_replicas());
    match result.error {
        Some(DbError::ReplicaRegistration { message }) => assert!(message.contains(REPLICA_B)),
        other => panic!("expected replica registration error, got {:?}", other),
    }
    // the replica opened before the failure is released again
    assert_eq!(state.closes(), 1);

    handle.fetch_scalar("SELECT 1").await.unwrap();
    assert_eq!(state.reads(), vec![PRIMARY]);
}

#[tokio::test]
async fn test_tracing_enabled_installs_plugin() {
    let (connector, _state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(connector);
    let config = Config::new(PRIMARY)
        .with_tracing()
        .with_tracing_service_name("orders-db")
        .with_tracing_analytics_rate(0.25);

    let handle = manager.get_connection(&config).await.into_result().unwrap();
    assert!(handle.is_traced());
    handle.execute("DELETE FROM t").await.unwrap();
}

#[tokio::test]
async fn test_tracing_failure_keeps_untraced_handle() {
    let (connector, _state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(connector);
    let config = Config::new(PRIMARY)
        .with_tracing()
        .with_tracing_analytics_rate(2.0);

    let result = manager.get_connection(&config).await;
    assert!(matches!(result.error, Some(DbError::Tracing { .. })));
    assert!(!result.handle.expect("untraced handle").is_traced());
}

#[tokio::test]
async fn test_tracing_options_ignored_when_disabled() {
    let (connector, _state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(connector);
    let config = Config::new(PRIMARY).with_tracing_analytics_rate(2.0);

    let handle = manager.get_connection(&config).await.into_result().unwrap();
    assert!(!handle.is_traced());
}

#[tokio::test]
async fn test_replaced_connector_and_restore_default() {
    let (default_connector, default_state) = MockConnector::new();
    let (stand_in, stand_in_state) = MockConnector::new();
    let manager = ConnectionManager::with_connector(default_connector);

    manager.set_connector(stand_in);
    assert!(manager.get_connection(&Config::new(PRIMARY)).await.is_ok());
    assert_eq!(stand_in_state.opens(), 1);
    assert_eq!(default_state.opens(), 0);

    manager.reset_connection().await;
    manager.use_default_connection();
    assert!(manager.get_connection(&Config::new(PRIMARY)).await.is_ok());
    assert_eq!(stand_in_state.opens(), 1);
    assert_eq!(default_state.opens(), 1);
}
