//! Structured error types for the cascade engine.
//!
//! `CascadeError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Step bodies are free to use `anyhow` internally; the
//! step runtime wraps their failures in [`CascadeError::StepExecution`]
//! at the boundary.
//!
//! # Fatal vs. local
//!
//! | Kind                | Scope  | Effect                                    |
//! |---------------------|--------|-------------------------------------------|
//! | `MalformedId`       | fatal  | corrupted persisted state or codec bug    |
//! | `Topology`          | fatal  | rejected at startup                       |
//! | `Store`             | fatal  | correctness depends on the ledger         |
//! | `WorkerCrashed`     | fatal  | engine bug outside the step boundary      |
//! | `StepExecution`     | local  | rollback, item stays retryable            |
//!
//! Local errors never abort a run. They are logged, counted in the
//! [`RunReport`](crate::RunReport), and retried by the next run against the
//! same ledger.

use thiserror::Error;

/// Errors produced by the cascade engine.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// A lineage id string violated the grammar.
    #[error("malformed cascade id {input:?}: {reason}")]
    MalformedId {
        /// The offending input.
        input: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The step/stream graph is not runnable.
    #[error("topology error: {0}")]
    Topology(String),

    /// A step's processing contract failed for one item.
    #[error("step {step} failed on {id}: {source}")]
    StepExecution {
        /// The step that failed.
        step: String,
        /// The unit of lineage that was being processed.
        id: String,
        /// The error raised by the step body.
        #[source]
        source: anyhow::Error,
    },

    /// The ledger backend is unavailable or returned garbage.
    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A producer tried to publish into a stream that was closed.
    #[error("stream {stream} is closed")]
    StreamClosed {
        /// Name of the closed stream.
        stream: String,
    },

    /// The operation was interrupted by coordinator shutdown.
    #[error("shutdown in progress")]
    Shutdown,

    /// A worker task died outside the step boundary.
    #[error("worker for step {step} crashed: {reason}")]
    WorkerCrashed {
        /// Step the worker belonged to.
        step: String,
        /// Panic message or cancellation reason.
        reason: String,
    },

    /// Invalid engine or step configuration.
    #[error("config error: {0}")]
    Config(String),

    /// JSON (de)serialization of a payload or snapshot failed.
    #[error("JSON error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CascadeError {
    pub(crate) fn malformed(input: &str, reason: impl Into<String>) -> Self {
        CascadeError::MalformedId {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn topology(msg: impl Into<String>) -> Self {
        CascadeError::Topology(msg.into())
    }

    pub(crate) fn store(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        CascadeError::Store(err.into())
    }

    /// Returns true if this error must stop the whole run.
    ///
    /// Step execution failures are local to one item. A shutdown
    /// interruption is the normal end of a run, not a failure.
    pub fn is_fatal(&self) -> bool {
        match self {
            CascadeError::StepExecution { .. } | CascadeError::Shutdown => false,
            CascadeError::MalformedId { .. }
            | CascadeError::Topology(_)
            | CascadeError::Store(_)
            | CascadeError::StreamClosed { .. }
            | CascadeError::WorkerCrashed { .. }
            | CascadeError::Config(_)
            | CascadeError::Serde(_) => true,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for CascadeError {
    fn from(err: sqlx::Error) -> Self {
        CascadeError::Store(Box::new(err))
    }
}

/// Result type alias for cascade operations.
pub type Result<T> = std::result::Result<T, CascadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_execution_is_local() {
        let err = CascadeError::StepExecution {
            step: "xform".to_string(),
            id: "gen:count=0/xform".to_string(),
            source: anyhow::anyhow!("model timed out"),
        };
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "step xform failed on gen:count=0/xform: model timed out"
        );
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(CascadeError::topology("stream vars has no consumers").is_fatal());
        assert!(CascadeError::malformed("gen:", "missing count").is_fatal());
        assert!(CascadeError::store("disk full").is_fatal());
        assert!(!CascadeError::Shutdown.is_fatal());
    }

    #[test]
    fn test_malformed_display_quotes_input() {
        let err = CascadeError::malformed("[a:count=0/x", "unbalanced brackets");
        assert_eq!(
            err.to_string(),
            "malformed cascade id \"[a:count=0/x\": unbalanced brackets"
        );
    }
}
