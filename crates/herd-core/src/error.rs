//! Error types shared by every herd component.
//!
//! A single failure is often observed by many callers at once: every member
//! of a failed batch, every follower joined to a failing coalesced
//! execution. [`HerdError`] is therefore `Clone`, and user failures are kept
//! behind a reference-counted [`SharedError`] so each waiter receives the
//! same underlying error rather than a re-rendered copy.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A user failure (thunk, batch function, connection factory) shared
/// between every caller waiting on it.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    /// Wraps a failure so it can be handed to several waiters.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// Returns the wrapped error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Returns true if both handles point at the same failure.
    pub fn ptr_eq(&self, other: &SharedError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Attempts to downcast the wrapped error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// The error type returned by coalescers, batch collectors and pools.
#[derive(Debug, Clone, Error)]
pub enum HerdError {
    /// A bounded wait elapsed before the resource became available.
    #[error("timed out after {waited:?} waiting for {resource}")]
    Timeout {
        /// The resource that was being waited on.
        resource: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The wrapped thunk, batch function or factory failed.
    #[error("execution failed: {0}")]
    Execution(#[source] SharedError),

    /// The operation targeted a pool or manager that has been closed.
    #[error("{0} is closed")]
    Closed(String),

    /// A batch function broke the same-length result contract.
    #[error("batch function returned {actual} results for {expected} items")]
    ResultCount {
        /// Number of items handed to the batch function.
        expected: usize,
        /// Number of results it returned.
        actual: usize,
    },

    /// A named pool exists but holds a different connection type.
    #[error("pool `{0}` was created with a different connection type")]
    PoolTypeMismatch(String),

    /// Settings failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A specialized Result type for herd operations.
pub type Result<T> = std::result::Result<T, HerdError>;

impl HerdError {
    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(resource: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            resource: resource.into(),
            waited,
        }
    }

    /// Wraps a user failure.
    #[must_use]
    pub fn execution(err: impl Into<anyhow::Error>) -> Self {
        Self::Execution(SharedError::new(err))
    }

    /// Converts a caught panic payload into an execution error.
    #[must_use]
    pub fn from_panic(context: &str, payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::execution(anyhow::anyhow!("{context} panicked: {message}"))
    }

    /// Creates a new closed-resource error.
    #[must_use]
    pub fn closed(resource: impl Into<String>) -> Self {
        Self::Closed(resource.into())
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true for [`HerdError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true for [`HerdError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// Returns true if a caller may reasonably retry after backing off.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
    }

    /// Returns the shared user failure, if this is an execution error.
    pub fn as_execution(&self) -> Option<&SharedError> {
        match self {
            Self::Execution(err) => Some(err),
            _ => None,
        }
    }
}
