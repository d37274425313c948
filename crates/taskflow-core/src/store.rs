//! The persistence contract (spec §6). The store itself is an external
//! collaborator — this crate only defines the trait it must satisfy.
//!
//! Mirrors the job-record shape spec.md describes: first-class columns for
//! the fields a query needs to index on, with the rest (`priority`,
//! `retryCount`, `dependencies`, `tags`, `metadata`) folded into a JSON blob
//! (spec §9 "Persistence schema").

use crate::ids::JobId;
use crate::job::{Job, JobStatus, JobType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// The row shape a store persists. `extra` carries the dynamic-typed fields
/// the spec keeps out of first-class columns.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub params_json: Value,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub created_by_id: String,
    pub digest_id: Option<String>,
    pub extra: Value,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        let extra = serde_json::json!({
            "priority": job.priority,
            "retryCount": job.retry_count,
            "maxRetries": job.max_retries,
            "dependencies": job.dependencies.iter().map(|d| d.0).collect::<Vec<_>>(),
            "tags": job.tags,
            "metadata": job.metadata,
            "scheduleTime": job.schedule_time,
        });
        Self {
            id: job.id,
            job_type: job.job_type.clone(),
            status: job.status,
            progress: job.progress,
            params_json: Value::Object(job.params.clone()),
            error: job.error.clone(),
            started_at: job.started_at,
            finished_at: job.finished_at,
            created_at: job.created_at,
            created_by_id: job.created_by_id.clone(),
            digest_id: job.digest_id.clone(),
            extra,
        }
    }
}

/// Filter for `find_many` / `count`. `None` on any field means "don't
/// filter on this dimension".
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Option<Vec<JobStatus>>,
    pub job_type: Option<JobType>,
    pub created_by_id: Option<String>,
    pub started_before: Option<DateTime<Utc>>,
    pub finished_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: &'static str,
    pub direction: SortDirection,
}

/// The abstract record store for Jobs (spec §6).
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn upsert(&self, record: JobRecord) -> anyhow::Result<()>;

    /// Used at startup to recover non-terminal jobs.
    async fn find_many(&self, filter: JobFilter) -> anyhow::Result<Vec<JobRecord>>;

    /// Used for oldest-pending/last-processed lookups.
    async fn find_first(
        &self,
        filter: JobFilter,
        order_by: OrderBy,
    ) -> anyhow::Result<Option<JobRecord>>;

    /// Used for stuck-job detection.
    async fn count(&self, filter: JobFilter) -> anyhow::Result<u64>;

    /// Used by cleanup.
    async fn delete(&self, id: JobId) -> anyhow::Result<()>;
}

/// A store-reported constraint violation on a specific column. Store
/// implementations that want the "retry upsert with column = null" fallback
/// (spec §7) should wrap this in the `anyhow::Error` they return from
/// `upsert` so the Queue can detect it via [`is_foreign_key_violation`].
/// Other store errors are opaque to this crate and are simply logged.
#[derive(Debug, thiserror::Error)]
#[error("foreign key violation on column {column}")]
pub struct ForeignKeyViolationError {
    pub column: &'static str,
}

pub fn is_foreign_key_violation(err: &anyhow::Error, column: &'static str) -> bool {
    err.downcast_ref::<ForeignKeyViolationError>()
        .map(|v| v.column == column)
        .unwrap_or(false)
}
