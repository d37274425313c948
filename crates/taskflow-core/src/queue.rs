//! The in-memory job index (spec §4.1).
//!
//! A single `DashMap<JobId, Job>` is the canonical store of job state; a
//! `Mutex`-protected ordered index over `(priority desc, createdAt asc)`
//! drives dispatch for the Queued bucket, and a second ordered index over
//! `scheduleTime` drives promotion out of the Scheduled bucket. Splitting
//! "canonical data" from "dispatch index" this way — rather than one map
//! per bucket as spec.md's prose suggests — avoids the two ever disagreeing
//! about which bucket a job is in; the index holds only ids, the map is the
//! only place job fields live.

use crate::config::RetryConfig;
use crate::error::{Result, TaskflowError};
use crate::events::{EventBus, QueueEvent};
use crate::ids::JobId;
use crate::job::{CreateJobOptions, Job, JobStatus, JobType, JobUpdate};
use crate::metrics::QueueMetrics;
use crate::store::{JobFilter, JobRecord, JobStore, OrderBy, SortDirection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Resolves a `digestId` foreign key against an external digest store.
/// Digests themselves are out of scope for this crate (spec §1); embedding
/// applications that want the "warn and null out" fallback behaviour
/// (spec §4.1 "Creation", §9 "Foreign-key fallback") wire one of these in.
/// Queues constructed without one skip the check entirely.
#[async_trait]
pub trait ForeignKeyResolver: Send + Sync {
    async fn digest_exists(&self, digest_id: &str) -> bool;
}

type PriorityKey = (Reverse<i32>, DateTime<Utc>, JobId);

struct Indices {
    /// Queued jobs, ordered by (priority desc, createdAt asc).
    priority: BTreeSet<PriorityKey>,
    /// Pending jobs with a future `scheduleTime`, ordered by schedule time.
    scheduled: BTreeSet<(DateTime<Utc>, JobId)>,
}

impl Indices {
    fn new() -> Self {
        Self {
            priority: BTreeSet::new(),
            scheduled: BTreeSet::new(),
        }
    }
}

pub struct Queue {
    jobs: DashMap<JobId, Job>,
    indices: Mutex<Indices>,
    store: Arc<dyn JobStore>,
    digest_resolver: Option<Arc<dyn ForeignKeyResolver>>,
    retry_config: RetryConfig,
    events: EventBus<QueueEvent>,
    total_created: AtomicU64,
}

impl Queue {
    pub fn new(store: Arc<dyn JobStore>, retry_config: RetryConfig) -> Self {
        Self {
            jobs: DashMap::new(),
            indices: Mutex::new(Indices::new()),
            store,
            digest_resolver: None,
            retry_config,
            events: EventBus::new(),
            total_created: AtomicU64::new(0),
        }
    }

    pub fn with_foreign_key_resolver(mut self, resolver: Arc<dyn ForeignKeyResolver>) -> Self {
        self.digest_resolver = Some(resolver);
        self
    }

    pub fn events(&self) -> EventBus<QueueEvent> {
        self.events.clone()
    }

    /// Load all persisted jobs in {Pending, Queued, Running} (spec §4.1
    /// "Recovery on startup"). Running jobs were interrupted: demote to
    /// Queued with `startedAt` cleared.
    pub async fn recover(
        store: Arc<dyn JobStore>,
        retry_config: RetryConfig,
    ) -> anyhow::Result<Self> {
        let queue = Self::new(store.clone(), retry_config);
        let records = store
            .find_many(JobFilter {
                statuses: Some(vec![JobStatus::Pending, JobStatus::Queued, JobStatus::Running]),
                ..Default::default()
            })
            .await?;

        let mut indices = queue.indices.lock().expect("indices lock poisoned");
        for record in records {
            let mut job = Job::try_from(record)?;
            if job.status == JobStatus::Running {
                job.status = JobStatus::Queued;
                job.started_at = None;
            }
            match job.status {
                JobStatus::Pending if job.schedule_time.map(|t| t > Utc::now()).unwrap_or(false) => {
                    indices.scheduled.insert((job.schedule_time.unwrap(), job.id));
                }
                _ => {
                    job.status = JobStatus::Queued;
                    indices.priority.insert((Reverse(job.priority), job.created_at, job.id));
                }
            }
            queue.jobs.insert(job.id, job);
        }
        drop(indices);
        Ok(queue)
    }

    async fn persist(&self, job: &Job) {
        let record = JobRecord::from(job);
        if let Err(err) = self.store.upsert(record).await {
            if crate::store::is_foreign_key_violation(&err, "digest_id") {
                tracing::warn!(job_id = %job.id, "digest_id foreign key violation, retrying with null");
                let mut retry = JobRecord::from(job);
                retry.digest_id = None;
                match self.store.upsert(retry).await {
                    Ok(()) => {
                        if let Some(mut in_memory) = self.jobs.get_mut(&job.id) {
                            in_memory.digest_id = None;
                        }
                    }
                    Err(err) => {
                        tracing::error!(job_id = %job.id, error = %err, "store upsert failed after null-digest retry");
                    }
                }
            } else {
                tracing::error!(job_id = %job.id, error = %err, "store upsert failed");
            }
        }
    }

    /// Validates foreign keys and dependencies, resolves initial status, and
    /// persists the new job (spec §4.1 "Creation").
    pub async fn create_job(&self, mut options: CreateJobOptions) -> Result<Job> {
        let now = Utc::now();

        // Dependencies must already exist in the queue at creation time.
        let missing: Vec<JobId> = options
            .dependencies
            .iter()
            .filter(|dep| !self.jobs.contains_key(dep))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(TaskflowError::InvalidDependency { missing });
        }

        if let (Some(resolver), Some(digest_id)) = (&self.digest_resolver, options.digest_id.clone()) {
            if !resolver.digest_exists(&digest_id).await {
                tracing::warn!(digest_id = %digest_id, "digestId does not resolve to an existing digest; storing null");
                options.digest_id = None;
            }
        }

        let status = if options.schedule_time.map(|t| t > now).unwrap_or(false) {
            JobStatus::Pending
        } else {
            JobStatus::Queued
        };

        let job = Job {
            id: JobId::new(),
            job_type: options.job_type,
            status,
            priority: options.priority,
            params: options.params,
            progress: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            created_by_id: options.created_by_id,
            digest_id: options.digest_id,
            retry_count: 0,
            max_retries: options.max_retries,
            schedule_time: options.schedule_time,
            dependencies: options.dependencies,
            tags: options.tags,
            metadata: options.metadata,
            error: None,
        };

        {
            let mut indices = self.indices.lock().expect("indices lock poisoned");
            match status {
                JobStatus::Pending => {
                    indices.scheduled.insert((job.schedule_time.unwrap(), job.id));
                }
                _ => {
                    indices.priority.insert((Reverse(job.priority), job.created_at, job.id));
                }
            }
        }

        self.jobs.insert(job.id, job.clone());
        self.total_created.fetch_add(1, Ordering::Relaxed);
        self.persist(&job).await;
        self.events.emit(QueueEvent::Created { job_id: job.id, at: now });
        Ok(job)
    }

    /// Promotes any scheduled job whose `scheduleTime <= now` into Queued,
    /// then dispatches the highest-priority Queued job whose dependencies
    /// are all Completed (spec §4.1 "Dispatch selection").
    pub async fn get_next_job(&self) -> Option<Job> {
        self.get_next_job_for(None).await
    }

    /// Like `get_next_job`, but only considers jobs whose type is in
    /// `allowed` (used by the Worker Pool Manager's per-worker pull-and-skip
    /// filtering, spec §4.4). `None` means "any type".
    pub async fn get_next_job_for(&self, allowed: Option<&[JobType]>) -> Option<Job> {
        let now = Utc::now();
        self.promote_due_scheduled(now);

        let candidate = {
            let indices = self.indices.lock().expect("indices lock poisoned");
            let mut found = None;
            for key in indices.priority.iter() {
                let job_id = key.2;
                let type_ok = match allowed {
                    None => true,
                    Some(types) => self
                        .jobs
                        .get(&job_id)
                        .map(|j| types.contains(&j.job_type))
                        .unwrap_or(false),
                };
                if type_ok && self.dependencies_resolved(job_id) {
                    found = Some(*key);
                    break;
                }
            }
            found
        };

        let key = candidate?;
        {
            let mut indices = self.indices.lock().expect("indices lock poisoned");
            indices.priority.remove(&key);
        }

        let job_id = key.2;
        let mut job = self.jobs.get_mut(&job_id)?;
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;
        let snapshot = job.clone();
        drop(job);

        self.persist(&snapshot).await;
        self.events.emit(QueueEvent::Started { job_id, at: now });
        Some(snapshot)
    }

    fn promote_due_scheduled(&self, now: DateTime<Utc>) {
        let due: Vec<(DateTime<Utc>, JobId)> = {
            let indices = self.indices.lock().expect("indices lock poisoned");
            indices
                .scheduled
                .iter()
                .take_while(|(at, _)| *at <= now)
                .copied()
                .collect()
        };
        if due.is_empty() {
            return;
        }
        let mut indices = self.indices.lock().expect("indices lock poisoned");
        for (at, job_id) in due {
            indices.scheduled.remove(&(at, job_id));
            if let Some(mut job) = self.jobs.get_mut(&job_id) {
                job.status = JobStatus::Queued;
                indices.priority.insert((Reverse(job.priority), job.created_at, job_id));
            }
        }
    }

    fn dependencies_resolved(&self, job_id: JobId) -> bool {
        let Some(job) = self.jobs.get(&job_id) else {
            return false;
        };
        job.dependencies.iter().all(|dep| {
            self.jobs
                .get(dep)
                .map(|d| d.status == JobStatus::Completed)
                .unwrap_or(false)
        })
    }

    pub fn get_job(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    pub fn query_jobs<F>(&self, predicate: F) -> Vec<Job>
    where
        F: Fn(&Job) -> bool,
    {
        self.jobs
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Applies the patch, recomputes bucket membership on status change,
    /// writes through to the store, and emits the matching event
    /// (spec §4.1 "Updates").
    pub async fn update_job(&self, id: JobId, update: JobUpdate) -> Option<Job> {
        let now = Utc::now();
        let changes_status = update.changes_status();

        let (old_status, snapshot) = {
            let mut entry = self.jobs.get_mut(&id)?;
            let old_status = entry.status;
            if let Some(status) = update.status {
                entry.status = status;
            }
            if let Some(progress) = update.progress {
                entry.progress = progress;
            }
            if let Some(started_at) = update.started_at {
                entry.started_at = started_at;
            }
            if let Some(finished_at) = update.finished_at {
                entry.finished_at = finished_at;
            }
            if let Some(schedule_time) = update.schedule_time {
                entry.schedule_time = schedule_time;
            }
            if let Some(retry_count) = update.retry_count {
                entry.retry_count = retry_count;
            }
            if let Some(error) = update.error {
                entry.error = error;
            }
            entry.updated_at = now;
            (old_status, entry.clone())
        };

        if changes_status && old_status != snapshot.status {
            self.move_bucket(&snapshot, old_status);
        }

        self.persist(&snapshot).await;

        if changes_status {
            let event = match snapshot.status {
                JobStatus::Completed => Some(QueueEvent::Completed { job_id: id, at: now }),
                JobStatus::Failed => Some(QueueEvent::Failed {
                    job_id: id,
                    final_failure: snapshot.retry_count >= snapshot.max_retries,
                    at: now,
                }),
                JobStatus::Cancelled => Some(QueueEvent::Cancelled { job_id: id, at: now }),
                JobStatus::Retrying => Some(QueueEvent::Retrying {
                    job_id: id,
                    retry_at: snapshot.schedule_time.unwrap_or(now),
                }),
                _ => None,
            };
            if let Some(event) = event {
                self.events.emit(event);
            }
        } else if let Some(progress) = update.progress {
            self.events.emit(QueueEvent::ProgressUpdated { job_id: id, progress });
        }

        Some(snapshot)
    }

    fn move_bucket(&self, job: &Job, old_status: JobStatus) {
        let mut indices = self.indices.lock().expect("indices lock poisoned");
        match old_status {
            JobStatus::Queued => {
                indices.priority.retain(|(_, _, id)| *id != job.id);
            }
            JobStatus::Pending => {
                indices.scheduled.retain(|(_, id)| *id != job.id);
            }
            _ => {}
        }
        match job.status {
            JobStatus::Queued => {
                indices.priority.insert((Reverse(job.priority), job.created_at, job.id));
            }
            JobStatus::Pending => {
                if let Some(at) = job.schedule_time {
                    indices.scheduled.insert((at, job.id));
                }
            }
            _ => {}
        }
    }

    /// Marks a job Failed with an explicit `final_failure` flag, used by the
    /// Processor for all three failure paths (missing handler, validation,
    /// retry exhaustion) and for the transient "Failed briefly" step before
    /// `retry_job` re-schedules it (spec §4.2 "Retry policy"). Separate from
    /// `update_job` because those paths know whether the failure is terminal
    /// independent of the generic `retryCount >= maxRetries` heuristic.
    pub async fn fail_job(&self, id: JobId, error: String, final_failure: bool) -> Option<Job> {
        let now = Utc::now();
        let (old_status, snapshot) = {
            let mut job = self.jobs.get_mut(&id)?;
            let old_status = job.status;
            job.status = JobStatus::Failed;
            job.error = Some(error);
            job.finished_at = Some(now);
            job.updated_at = now;
            (old_status, job.clone())
        };
        self.move_bucket(&snapshot, old_status);
        self.persist(&snapshot).await;
        self.events.emit(QueueEvent::Failed { job_id: id, final_failure, at: now });
        Some(snapshot)
    }

    /// Terminal if not already Completed/Cancelled; removes the job from
    /// whatever dispatch index it occupied.
    pub async fn cancel_job(&self, id: JobId) -> bool {
        let now = Utc::now();
        let Some(mut job) = self.jobs.get_mut(&id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }
        let old_status = job.status;
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(now);
        job.updated_at = now;
        let snapshot = job.clone();
        drop(job);

        self.move_bucket(&snapshot, old_status);
        self.persist(&snapshot).await;
        self.events.emit(QueueEvent::Cancelled { job_id: id, at: now });
        true
    }

    /// Valid on Failed or Retrying jobs with `retryCount < maxRetries`
    /// (spec §4.1 "Retry").
    pub async fn retry_job(&self, id: JobId) -> bool {
        let now = Utc::now();
        let Some(mut job) = self.jobs.get_mut(&id) else {
            return false;
        };
        if !matches!(job.status, JobStatus::Failed | JobStatus::Retrying) {
            return false;
        }
        if job.retry_count >= job.max_retries {
            return false;
        }

        let old_status = job.status;
        let delay = self.retry_config.backoff_for(job.retry_count);
        let scheduled_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

        job.status = JobStatus::Pending;
        job.schedule_time = Some(scheduled_at);
        job.error = None;
        job.started_at = None;
        job.finished_at = None;
        job.updated_at = now;
        let snapshot = job.clone();
        drop(job);

        self.move_bucket(&snapshot, old_status);
        self.persist(&snapshot).await;
        self.events.emit(QueueEvent::Retrying { job_id: id, retry_at: scheduled_at });
        true
    }

    /// Sweeps Completed and Failed buckets; removes anything whose
    /// `finishedAt` is older than `older_than_hours` (spec §4.1 "Cleanup").
    pub async fn cleanup(&self, older_than_hours: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(older_than_hours);
        let targets: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|entry| {
                let job = entry.value();
                matches!(job.status, JobStatus::Completed | JobStatus::Failed)
                    && job.finished_at.map(|f| f < cutoff).unwrap_or(false)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for id in targets {
            self.jobs.remove(&id);
            if let Err(err) = self.store.delete(id).await {
                tracing::error!(job_id = %id, error = %err, "store delete failed during cleanup");
            }
            removed += 1;
        }
        removed
    }

    pub fn get_metrics(&self) -> QueueMetrics {
        let now = Utc::now();
        let mut metrics = QueueMetrics::empty(now);
        metrics.total_jobs = self.jobs.len() as u64;

        let mut processing_total_ms = 0.0;
        let mut processing_count = 0u64;

        for entry in self.jobs.iter() {
            let job = entry.value();
            match job.status {
                JobStatus::Pending | JobStatus::Queued | JobStatus::Retrying => {
                    metrics.pending_jobs += 1;
                }
                JobStatus::Running => metrics.running_jobs += 1,
                JobStatus::Completed => {
                    metrics.completed_jobs += 1;
                    if let (Some(started), Some(finished)) = (job.started_at, job.finished_at) {
                        processing_total_ms += (finished - started).num_milliseconds() as f64;
                        processing_count += 1;
                    }
                }
                JobStatus::Failed => metrics.failed_jobs += 1,
                JobStatus::Cancelled => {}
            }
        }

        let indices = self.indices.lock().expect("indices lock poisoned");
        metrics.queue_length = indices.priority.len() as u64;
        drop(indices);

        metrics.average_processing_time_ms = if processing_count > 0 {
            processing_total_ms / processing_count as f64
        } else {
            0.0
        };

        let denom = metrics.completed_jobs + metrics.failed_jobs;
        metrics.success_rate = if denom > 0 {
            (metrics.completed_jobs as f64 / denom as f64) * 100.0
        } else {
            0.0
        };

        metrics
    }

    pub fn shutdown(&self) {
        tracing::info!("queue shutting down");
    }
}

impl TryFrom<JobRecord> for Job {
    type Error = anyhow::Error;

    fn try_from(record: JobRecord) -> anyhow::Result<Self> {
        let extra = record.extra;
        let priority = extra.get("priority").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        let retry_count = extra.get("retryCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let max_retries = extra.get("maxRetries").and_then(|v| v.as_u64()).unwrap_or(3) as u32;
        let tags = extra
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let metadata = extra
            .get("metadata")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let dependencies = extra
            .get("dependencies")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().and_then(|s| s.parse().ok()))
                    .map(JobId::from)
                    .collect()
            })
            .unwrap_or_default();
        let schedule_time = extra
            .get("scheduleTime")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let params = match &record.params_json {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };

        Ok(Job {
            id: record.id,
            job_type: record.job_type,
            status: record.status,
            priority,
            params,
            progress: record.progress,
            created_at: record.created_at,
            updated_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            created_by_id: record.created_by_id,
            digest_id: record.digest_id,
            retry_count,
            max_retries,
            schedule_time,
            dependencies,
            tags,
            metadata,
            error: record.error,
        })
    }
}

/// Convenience `OrderBy` for the Monitor's "oldest pending job" lookup
/// against a store directly.
pub fn oldest_first() -> OrderBy {
    OrderBy {
        field: "created_at",
        direction: SortDirection::Asc,
    }
}
