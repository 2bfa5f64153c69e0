//! Error types for the FundFlow ingestion core.
//!
//! Error kinds map onto the pipeline's failure model: transient external
//! failures are retried and degrade to hard failures once retries are
//! exhausted; permanent external failures are hard failures immediately;
//! schema violations reject the candidate; duplicate content is silently
//! dropped at the collector; queue-full is a backpressure signal, not an
//! error to be logged.

use std::time::Duration;
use thiserror::Error;

use crate::record::Priority;

/// Error type for pipeline operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Transient external failure; retry with backoff. Counts as a soft
    /// failure against the source until retries are exhausted.
    #[error("transient failure in {operation}: {message}")]
    TransientExternal {
        /// External operation that failed (e.g. "llm.classify", "store.insert")
        operation: String,
        /// Backend error text
        message: String,
    },

    /// Permanent external failure; no retry, hard failure against the source.
    #[error("permanent failure in {operation}: {message}")]
    PermanentExternal {
        /// External operation that failed
        operation: String,
        /// Backend error text
        message: String,
    },

    /// An external call exceeded its per-call deadline. Hard failure.
    #[error("{operation} exceeded its {deadline:?} deadline")]
    DeadlineExceeded {
        /// External operation that timed out
        operation: String,
        /// The deadline that was exceeded
        deadline: Duration,
    },

    /// Candidate failed schema validation; rejected with a reason.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Raw input already seen (content-hash collision). Dropped silently
    /// at the collector; never an error condition downstream.
    #[error("duplicate content hash {0}")]
    DuplicateContent(String),

    /// Insert collided with a published record's dedup-hash. The publisher
    /// redirects these to a merge.
    #[error("dedup-hash {0} already published")]
    DuplicateKey(String),

    /// A priority tier is at capacity. Backpressure signal to the
    /// producer, not logged as an error.
    #[error("{tier:?} queue is full")]
    QueueFull {
        /// Tier that shed the record
        tier: Priority,
    },

    /// Collector's circuit breaker is open; no new work accepted.
    #[error("circuit breaker open for {collector}, retry in {wait_hint:?}")]
    BreakerOpen {
        /// Collector whose breaker is open
        collector: String,
        /// Time until the next half-open probe is admitted
        wait_hint: Duration,
    },

    /// A pipeline invariant was violated. Crashes the owning task; the
    /// supervisor restarts it, other tasks are unaffected.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Persisted queue (SQLite) failure.
    #[error("queue database error: {0}")]
    Database(String),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Transient external failure for `operation`.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::TransientExternal {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Permanent external failure for `operation`.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::PermanentExternal {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True if a retry with backoff may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientExternal { .. } | Error::Database(_))
    }

    /// True if this error should be shed back to the producer rather than
    /// surfaced (queue-full backpressure, breaker-open short circuit).
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::QueueFull { .. } | Error::BreakerOpen { .. })
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;
