//! Error taxonomy (spec §7).
//!
//! Every variant maps to one row of the taxonomy: validation failures are
//! synchronous and reject the call; handler/timeout failures are retryable
//! until `maxRetries`; cancellation and missing-handler are terminal and
//! never retried; store errors are logged and do not by themselves move a
//! job's in-memory status.

use crate::ids::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskflowError {
    #[error("cannot create job: dependency job(s) not found in queue: {missing:?}")]
    InvalidDependency { missing: Vec<JobId> },

    #[error("job {job_id}: handler failure: {message}")]
    HandlerFailure { job_id: JobId, message: String },

    #[error("job {job_id}: timed out after {elapsed_ms}ms")]
    Timeout { job_id: JobId, elapsed_ms: u64 },

    #[error("job {job_id}: cancelled")]
    Cancelled { job_id: JobId },

    #[error("job {job_id}: no handler registered for job type {job_type}")]
    MissingHandler { job_id: JobId, job_type: String },

    #[error("job {job_id}: parameter validation failed")]
    ValidationFailed { job_id: JobId },

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("foreign key violation on {column}: {source}")]
    ForeignKeyViolation {
        column: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl TaskflowError {
    /// Whether the Processor's failure policy should offer this error a
    /// retry (subject to `retryCount < maxRetries`) or treat it as terminal
    /// on first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskflowError::HandlerFailure { .. } | TaskflowError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TaskflowError>;
