//! PostgreSQL implementation of the `taskflow-core` `JobStore` trait.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     job_type TEXT NOT NULL,
//!     status TEXT NOT NULL,
//!     progress SMALLINT NOT NULL DEFAULT 0,
//!     params_json JSONB NOT NULL DEFAULT '{}',
//!     error TEXT,
//!     started_at TIMESTAMPTZ,
//!     finished_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     created_by_id TEXT NOT NULL,
//!     digest_id TEXT REFERENCES digests (id),
//!     extra JSONB NOT NULL DEFAULT '{}'
//! );
//!
//! CREATE INDEX idx_jobs_status ON jobs (status);
//! CREATE INDEX idx_jobs_created_by ON jobs (created_by_id);
//! ```
//!
//! `extra` carries the fields `taskflow_core::JobRecord` keeps out of
//! first-class columns: `priority`, `retryCount`, `maxRetries`,
//! `dependencies`, `tags`, `metadata`, `scheduleTime` (spec §9 "Persistence
//! schema"). The `digests` table itself is an external collaborator — this
//! crate only assumes a foreign key exists if the embedding application
//! creates one; `upsert` surfaces a constraint violation on it as a
//! [`taskflow_core::ForeignKeyViolationError`] so `Queue` can retry with a
//! null `digest_id` (spec §4.1 "Creation", §9 "Foreign-key fallback").
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskflow_postgres::PgJobStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/taskflow").await?;
//! let store = PgJobStore::new(pool);
//! ```

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use taskflow_core::{
    ForeignKeyViolationError, JobFilter, JobId, JobRecord, JobStatus, JobStore, JobType, OrderBy,
    SortDirection,
};

/// PostgreSQL-backed job store. Holds a `PgPool`; cloning shares the pool.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
        JobStatus::Retrying => "retrying",
    }
}

fn status_from_str(s: &str) -> anyhow::Result<JobStatus> {
    Ok(match s {
        "pending" => JobStatus::Pending,
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        "retrying" => JobStatus::Retrying,
        other => anyhow::bail!("unrecognized job status {other:?} read from store"),
    })
}

fn order_column(order_by: &OrderBy) -> &'static str {
    match order_by.field {
        "created_at" => "created_at",
        "started_at" => "started_at",
        "finished_at" => "finished_at",
        _ => "created_at",
    }
}

fn row_to_record(row: PgRow) -> anyhow::Result<JobRecord> {
    let id: uuid::Uuid = row.try_get("id")?;
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    Ok(JobRecord {
        id: JobId::from(id),
        job_type: JobType::from_str(&job_type).expect("JobType::from_str is infallible"),
        status: status_from_str(&status)?,
        progress: row.try_get::<i16, _>("progress")? as u8,
        params_json: row.try_get("params_json")?,
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
        created_by_id: row.try_get("created_by_id")?,
        digest_id: row.try_get("digest_id")?,
        extra: row.try_get("extra")?,
    })
}

/// Appends `WHERE ...` clauses for the subset of `JobFilter` fields that are
/// set, parameterised starting at `$1`.
fn build_where(filter: &JobFilter, params_start: usize) -> (String, Vec<FilterParam>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    let mut next = params_start;

    if let Some(statuses) = &filter.statuses {
        let strs: Vec<&'static str> = statuses.iter().copied().map(status_to_str).collect();
        clauses.push(format!("status = ANY(${next})"));
        params.push(FilterParam::Statuses(strs));
        next += 1;
    }
    if let Some(job_type) = &filter.job_type {
        clauses.push(format!("job_type = ${next}"));
        params.push(FilterParam::Text(job_type.to_string()));
        next += 1;
    }
    if let Some(created_by_id) = &filter.created_by_id {
        clauses.push(format!("created_by_id = ${next}"));
        params.push(FilterParam::Text(created_by_id.clone()));
        next += 1;
    }
    if let Some(started_before) = filter.started_before {
        clauses.push(format!("started_at < ${next}"));
        params.push(FilterParam::Time(started_before));
        next += 1;
    }
    if let Some(finished_before) = filter.finished_before {
        clauses.push(format!("finished_at < ${next}"));
        params.push(FilterParam::Time(finished_before));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (where_sql, params)
}

enum FilterParam {
    Statuses(Vec<&'static str>),
    Text(String),
    Time(chrono::DateTime<chrono::Utc>),
}

macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut q = $query;
        for param in $params {
            q = match param {
                FilterParam::Statuses(v) => q.bind(v),
                FilterParam::Text(v) => q.bind(v),
                FilterParam::Time(v) => q.bind(v),
            };
        }
        q
    }};
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn upsert(&self, record: JobRecord) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, status, progress, params_json, error,
                started_at, finished_at, created_at, created_by_id, digest_id, extra
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                job_type = EXCLUDED.job_type,
                status = EXCLUDED.status,
                progress = EXCLUDED.progress,
                params_json = EXCLUDED.params_json,
                error = EXCLUDED.error,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                created_by_id = EXCLUDED.created_by_id,
                digest_id = EXCLUDED.digest_id,
                extra = EXCLUDED.extra
            "#,
        )
        .bind(uuid::Uuid::from(record.id))
        .bind(record.job_type.to_string())
        .bind(status_to_str(record.status))
        .bind(record.progress as i16)
        .bind(&record.params_json)
        .bind(&record.error)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.created_at)
        .bind(&record.created_by_id)
        .bind(&record.digest_id)
        .bind(&record.extra)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_foreign_key_violation() => {
                tracing::debug!(job_id = %record.id, "digest_id foreign key violation on upsert");
                Err(ForeignKeyViolationError { column: "digest_id" }.into())
            }
            Err(err) => {
                tracing::error!(job_id = %record.id, error = %err, "job upsert failed");
                Err(err.into())
            }
        }
    }

    async fn find_many(&self, filter: JobFilter) -> anyhow::Result<Vec<JobRecord>> {
        let (where_sql, params) = build_where(&filter, 1);
        let sql = format!(
            "SELECT id, job_type, status, progress, params_json, error, started_at, finished_at, \
             created_at, created_by_id, digest_id, extra FROM jobs {where_sql} ORDER BY created_at ASC"
        );
        let query = bind_params!(sqlx::query(&sql), params);
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn find_first(&self, filter: JobFilter, order_by: OrderBy) -> anyhow::Result<Option<JobRecord>> {
        let (where_sql, params) = build_where(&filter, 1);
        let direction = match order_by.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        let column = order_column(&order_by);
        let sql = format!(
            "SELECT id, job_type, status, progress, params_json, error, started_at, finished_at, \
             created_at, created_by_id, digest_id, extra FROM jobs {where_sql} \
             ORDER BY {column} {direction} LIMIT 1"
        );
        let query = bind_params!(sqlx::query(&sql), params);
        let row = query.fetch_optional(&self.pool).await?;
        row.map(row_to_record).transpose()
    }

    async fn count(&self, filter: JobFilter) -> anyhow::Result<u64> {
        let (where_sql, params) = build_where(&filter, 1);
        let sql = format!("SELECT COUNT(*) AS count FROM jobs {where_sql}");
        let query = bind_params!(sqlx::query(&sql), params);
        let row = query.fetch_one(&self.pool).await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }

    async fn delete(&self, id: JobId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(uuid::Uuid::from(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_where_empty_filter_has_no_clause() {
        let (sql, params) = build_where(&JobFilter::default(), 1);
        assert!(sql.is_empty());
        assert!(params.is_empty());
    }

    #[test]
    fn build_where_orders_params_with_placeholders() {
        let filter = JobFilter {
            statuses: Some(vec![JobStatus::Queued, JobStatus::Running]),
            created_by_id: Some("scheduler".to_string()),
            ..Default::default()
        };
        let (sql, params) = build_where(&filter, 1);
        assert_eq!(sql, "WHERE status = ANY($1) AND created_by_id = $2");
        assert_eq!(params.len(), 2);
    }
}
