//! dbgate - Main entry point.
//!
//! Builds the shared connection from the command line, checks it, runs the
//! given SQL statements in one transaction and shuts the connection down.

use clap::Parser;
use dbgate::config::Cli;
use dbgate::{ConnectionManager, Context, DbError};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let cli = Cli::parse();

    // Initialize logging
    init_tracing(&cli);

    info!("Starting dbgate v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.to_config();
    let manager = Arc::new(ConnectionManager::new());

    let connection = manager.get_connection(&config).await;
    if let Some(err) = connection.error {
        error!(error = %err, suggestion = ?err.suggestion(), "Failed to initialize connection");
        manager.reset_connection().await;
        return Err(err.into());
    }

    let ctx = Context::background().with_timeout(cli.timeout_duration());
    manager.ping(&ctx).await?;
    info!("Database is reachable");

    let result = run_statements(&manager, &ctx, &cli.statements).await;
    manager.reset_connection().await;

    match result {
        Ok(rows) => {
            info!(
                statements = cli.statements.len(),
                rows_affected = rows,
                "Done"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Transaction rolled back");
            Err(e.into())
        }
    }
}

/// Execute `statements` in order inside a single transaction.
async fn run_statements(
    manager: &ConnectionManager,
    ctx: &Context,
    statements: &[String],
) -> Result<u64, DbError> {
    if statements.is_empty() {
        return Ok(0);
    }

    manager
        .with_transaction(ctx, |tx_ctx| async move {
            let tx = manager.must_get_from_context(&tx_ctx);
            let mut rows = 0;
            for sql in statements {
                rows += tx.execute(sql).await?;
            }
            Ok::<_, DbError>(rows)
        })
        .await
}
