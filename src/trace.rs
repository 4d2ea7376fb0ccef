//! Tracing of database operations.
//!
//! A [`TracingPlugin`] is built from [`TracingOptions`] when the shared
//! connection is established and installed on the handle. Every driver call
//! made through that handle then runs inside a `db.query` span carrying the
//! service name, analytics rate and, when the error classifier agrees, the
//! error.

use crate::config::{ErrorCheck, TracingOptions};
use crate::context::Context;
use crate::error::{DbError, DbResult};
use std::fmt;
use std::future::Future;
use tracing::field::{Empty, display};
use tracing::{Instrument, Span};

/// Service name used when the configuration leaves it empty.
pub const DEFAULT_TRACING_SERVICE_NAME: &str = "sqlx.db";

#[derive(Clone)]
pub struct TracingPlugin {
    service_name: String,
    analytics_rate: Option<f64>,
    error_check: Option<ErrorCheck>,
}

impl TracingPlugin {
    /// Build the plugin, rejecting an analytics rate outside `0.0..=1.0`.
    pub fn from_options(options: &TracingOptions) -> DbResult<Self> {
        if let Some(rate) = options.analytics_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(DbError::tracing(format!(
                    "analytics rate {} is outside 0.0..=1.0",
                    rate
                )));
            }
        }
        Ok(Self {
            service_name: options.service_name.clone(),
            analytics_rate: options.analytics_rate,
            error_check: options.error_check.clone(),
        })
    }

    pub fn service_name(&self) -> &str {
        service_or_default(&self.service_name)
    }

    pub fn analytics_rate(&self) -> Option<f64> {
        self.analytics_rate
    }

    /// Whether `err` should mark its span as failed.
    pub fn should_flag(&self, err: &DbError) -> bool {
        self.error_check.as_ref().is_none_or(|check| check(err))
    }

    /// Run `fut` inside a `db.query` span parented on `parent`.
    pub(crate) async fn instrument<T, F>(
        &self,
        parent: &Span,
        system: &'static str,
        operation: &'static str,
        fut: F,
    ) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let span = tracing::info_span!(
            parent: parent,
            "db.query",
            db.system = system,
            db.operation = operation,
            service.name = %self.service_name(),
            analytics.rate = Empty,
            error = Empty,
            error.message = Empty,
        );
        if let Some(rate) = self.analytics_rate {
            span.record("analytics.rate", rate);
        }

        let result = fut.instrument(span.clone()).await;
        if let Err(err) = &result {
            if self.should_flag(err) {
                span.record("error", true);
                span.record("error.message", display(err));
            }
        }
        result
    }
}

impl fmt::Debug for TracingPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingPlugin")
            .field("service_name", &self.service_name())
            .field("analytics_rate", &self.analytics_rate)
            .field("has_error_check", &self.error_check.is_some())
            .finish()
    }
}

fn service_or_default(service: &str) -> &str {
    if service.is_empty() {
        DEFAULT_TRACING_SERVICE_NAME
    } else {
        service
    }
}

/// Start a span named `name` under the context span and return a context
/// that records subsequent operations beneath it.
///
/// The span closes when the last clone of it is dropped.
pub fn start_span(ctx: &Context, name: &str, service: &str) -> (Context, Span) {
    let span = tracing::info_span!(
        parent: &ctx.span(),
        "db.span",
        otel.name = name,
        service.name = service_or_default(service),
        error = Empty,
        error.message = Empty,
    );
    (ctx.with_span(span.clone()), span)
}

/// Span wrapping a whole transaction.
pub(crate) fn transaction_span(ctx: &Context, service: &str) -> Span {
    tracing::info_span!(
        parent: &ctx.span(),
        "db.transaction",
        service.name = service_or_default(service),
        error = Empty,
        error.message = Empty,
    )
}

/// Mark `span` as failed with `message`.
pub(crate) fn record_error(span: &Span, message: &dyn fmt::Display) {
    span.record("error", true);
    span.record("error.message", display(message));
}
