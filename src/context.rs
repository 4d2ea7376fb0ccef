//! Request-scoped context carrying the current database handle.
//!
//! A [`Context`] is an immutable chain of typed values plus an optional
//! deadline and parent span. Every `with_*` call returns a new context and
//! leaves the receiver untouched, so a context can be cloned freely into
//! spawned work and nested calls.
//!
//! The database handle lives under a private key type; only
//! [`set_from_context`] and [`with_context`] can place it there and only the
//! connection manager reads it back (falling back to its own shared handle).

use crate::db::DbHandle;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Span;

/// A type used as a key for values stored in a [`Context`].
///
/// Keys are distinguished by type, so a private key type cannot collide with
/// keys defined elsewhere.
pub trait ContextKey: 'static {
    type Value: Send + Sync + 'static;
}

struct Entry {
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<Entry>>,
}

#[derive(Clone, Default)]
pub struct Context {
    values: Option<Arc<Entry>>,
    deadline: Option<Instant>,
    span: Option<Span>,
}

impl Context {
    /// An empty context: no values, no deadline, no span.
    pub fn background() -> Self {
        Self::default()
    }

    /// Return a new context with `value` stored under `K`.
    pub fn with_value<K: ContextKey>(&self, value: K::Value) -> Self {
        let entry = Entry {
            key: TypeId::of::<K>(),
            value: Arc::new(value),
            parent: self.values.clone(),
        };
        Self {
            values: Some(Arc::new(entry)),
            deadline: self.deadline,
            span: self.span.clone(),
        }
    }

    /// Most recently stored value for `K`, if any.
    pub fn value<K: ContextKey>(&self) -> Option<&K::Value> {
        let key = TypeId::of::<K>();
        let mut cursor = self.values.as_deref();
        while let Some(entry) = cursor {
            if entry.key == key {
                return entry.value.downcast_ref::<K::Value>();
            }
            cursor = entry.parent.as_deref();
        }
        None
    }

    /// Return a new context that expires at `deadline`.
    ///
    /// A deadline can only be tightened: an earlier existing deadline wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            values: self.values.clone(),
            deadline: Some(deadline),
            span: self.span.clone(),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Return a new context whose operations are recorded under `span`.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            values: self.values.clone(),
            deadline: self.deadline,
            span: Some(span),
        }
    }

    /// The span attached to this context, or the current span.
    pub fn span(&self) -> Span {
        self.span.clone().unwrap_or_else(Span::current)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut len = 0;
        let mut cursor = self.values.as_deref();
        while let Some(entry) = cursor {
            len += 1;
            cursor = entry.parent.as_deref();
        }
        f.debug_struct("Context")
            .field("values", &len)
            .field("deadline", &self.deadline)
            .field("has_span", &self.span.is_some())
            .finish()
    }
}

struct DbHandleKey;

impl ContextKey for DbHandleKey {
    type Value = DbHandle;
}

/// Return a new context carrying `handle`.
pub fn set_from_context(ctx: &Context, handle: DbHandle) -> Context {
    ctx.with_value::<DbHandleKey>(handle)
}

/// Bind `handle` to `ctx` and store the bound handle in a new context.
///
/// Operations through the returned handle observe the context deadline and
/// record their spans under the context span.
pub fn with_context(ctx: &Context, handle: &DbHandle) -> (Context, DbHandle) {
    let bound = handle.with_context(ctx);
    (set_from_context(ctx, bound.clone()), bound)
}

/// The handle attached to `ctx`, without any fallback.
pub(crate) fn attached_handle(ctx: &Context) -> Option<&DbHandle> {
    ctx.value::<DbHandleKey>()
}
