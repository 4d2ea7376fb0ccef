//! Running units of work inside a transaction.
//!
//! [`ConnectionManager::with_transaction`] opens at most one physical
//! transaction per logical unit of work. When the context already carries a
//! transaction handle the unit of work simply joins it, so helpers that each
//! wrap their work in `with_transaction` compose to any depth.

use crate::context::{Context, set_from_context};
use crate::db::handle::DbHandle;
use crate::db::manager::ConnectionManager;
use crate::error::DbError;
use crate::trace::{record_error, transaction_span};
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error};

impl ConnectionManager {
    /// Run `unit_of_work` in a transaction and commit it when it succeeds.
    ///
    /// The unit of work receives a context carrying the transaction handle;
    /// anything it resolves through [`ConnectionManager::get_from_context`]
    /// runs on that transaction.
    ///
    /// - No handle available: `DbError::NoDatabase` is returned and the unit
    ///   of work never runs.
    /// - The resolved handle is already a transaction: the unit of work runs
    ///   on it and its result is returned untouched. The outermost call
    ///   decides commit or rollback.
    /// - Otherwise a transaction is begun on the primary. An `Err` from the
    ///   unit of work rolls it back and is returned unchanged; a panic rolls
    ///   it back and is resumed with the original payload; `Ok` commits and a
    ///   commit failure becomes the result.
    ///
    /// A failed rollback is logged and never replaces the original outcome.
    /// With tracing enabled the `db.transaction` span is flagged only when
    /// the overall result is an `Err`; a panic leaves it unflagged.
    pub async fn with_transaction<F, Fut, T, E>(&self, ctx: &Context, unit_of_work: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError> + fmt::Display,
    {
        let Some(handle) = self.get_from_context(ctx) else {
            return Err(DbError::NoDatabase.into());
        };

        if handle.is_transaction() {
            debug!(
                transaction_id = handle.transaction_id().unwrap_or_default(),
                "Joining enclosing transaction"
            );
            return unit_of_work(ctx.clone()).await;
        }

        let tracing = self.get_active_config().tracing;
        let span = tracing
            .enabled
            .then(|| transaction_span(ctx, &tracing.service_name));
        let ctx = match &span {
            Some(span) => ctx.with_span(span.clone()),
            None => ctx.clone(),
        };

        let result = run_in_transaction(&ctx, &handle, unit_of_work).await;
        if let (Some(span), Err(err)) = (&span, &result) {
            record_error(span, err);
        }
        result
    }
}

async fn run_in_transaction<F, Fut, T, E>(
    ctx: &Context,
    handle: &DbHandle,
    unit_of_work: F,
) -> Result<T, E>
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DbError> + fmt::Display,
{
    let tx = handle.with_context(ctx).write().begin().await?;
    let tx_ctx = set_from_context(ctx, tx.clone());

    let outcome = AssertUnwindSafe(async move { unit_of_work(tx_ctx).await })
        .catch_unwind()
        .await;

    match outcome {
        Err(payload) => {
            rollback_logged(ctx, &tx).await;
            panic::resume_unwind(payload)
        }
        Ok(Err(err)) => {
            debug!(
                transaction_id = tx.transaction_id().unwrap_or_default(),
                error = %err,
                "Unit of work failed, rolling back"
            );
            rollback_logged(ctx, &tx).await;
            Err(err)
        }
        Ok(Ok(value)) => {
            tx.commit().await?;
            Ok(value)
        }
    }
}

async fn rollback_logged(ctx: &Context, tx: &DbHandle) {
    if let Err(err) = tx.rollback().await {
        let span = ctx.span();
        error!(
            parent: &span,
            transaction_id = tx.transaction_id().unwrap_or_default(),
            error = %err,
            "Transaction rollback failed"
        );
    }
}
