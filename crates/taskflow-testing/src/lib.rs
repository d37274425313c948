//! Test doubles for exercising `taskflow-core` components without a real
//! database or real job handlers: an in-memory `JobStore`, a couple of
//! `ForeignKeyResolver` stubs, and small `JobHandler`s that succeed, fail, or
//! hang on command.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use taskflow_core::{
    CancelToken, ForeignKeyResolver, HandlerOutcome, Job, JobFilter, JobId, JobHandler, JobRecord,
    JobStore, OrderBy, SortDirection,
};

/// A `JobStore` backed by a `Mutex<HashMap>`. Good enough for unit and
/// integration tests; not meant for production use (see `taskflow-postgres`
/// for that).
#[derive(Default)]
pub struct InMemoryJobStore {
    records: Mutex<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("records lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches(record: &JobRecord, filter: &JobFilter) -> bool {
    if let Some(statuses) = &filter.statuses {
        if !statuses.contains(&record.status) {
            return false;
        }
    }
    if let Some(job_type) = &filter.job_type {
        if &record.job_type != job_type {
            return false;
        }
    }
    if let Some(created_by_id) = &filter.created_by_id {
        if &record.created_by_id != created_by_id {
            return false;
        }
    }
    if let Some(started_before) = filter.started_before {
        if record.started_at.map(|t| t >= started_before).unwrap_or(true) {
            return false;
        }
    }
    if let Some(finished_before) = filter.finished_before {
        if record.finished_at.map(|t| t >= finished_before).unwrap_or(true) {
            return false;
        }
    }
    true
}

fn order_key(record: &JobRecord, order_by: &OrderBy) -> chrono::DateTime<chrono::Utc> {
    match order_by.field {
        "started_at" => record.started_at.unwrap_or(record.created_at),
        "finished_at" => record.finished_at.unwrap_or(record.created_at),
        _ => record.created_at,
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn upsert(&self, record: JobRecord) -> anyhow::Result<()> {
        self.records.lock().expect("records lock poisoned").insert(record.id, record);
        Ok(())
    }

    async fn find_many(&self, filter: JobFilter) -> anyhow::Result<Vec<JobRecord>> {
        let records = self.records.lock().expect("records lock poisoned");
        let mut matching: Vec<JobRecord> = records.values().filter(|r| matches(r, &filter)).cloned().collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }

    async fn find_first(&self, filter: JobFilter, order_by: OrderBy) -> anyhow::Result<Option<JobRecord>> {
        let records = self.records.lock().expect("records lock poisoned");
        let mut matching: Vec<&JobRecord> = records.values().filter(|r| matches(r, &filter)).collect();
        matching.sort_by_key(|r| order_key(r, &order_by));
        if order_by.direction == SortDirection::Desc {
            matching.reverse();
        }
        Ok(matching.into_iter().next().cloned())
    }

    async fn count(&self, filter: JobFilter) -> anyhow::Result<u64> {
        let records = self.records.lock().expect("records lock poisoned");
        Ok(records.values().filter(|r| matches(r, &filter)).count() as u64)
    }

    async fn delete(&self, id: JobId) -> anyhow::Result<()> {
        self.records.lock().expect("records lock poisoned").remove(&id);
        Ok(())
    }
}

/// Always resolves every digest id — useful when a test wants the
/// foreign-key fallback path to never trigger.
pub struct AlwaysResolves;

#[async_trait]
impl ForeignKeyResolver for AlwaysResolves {
    async fn digest_exists(&self, _digest_id: &str) -> bool {
        true
    }
}

/// Never resolves any digest id — drives the "warn and null out" fallback
/// on every job that sets one (spec §4.1 "Creation").
pub struct NeverResolves;

#[async_trait]
impl ForeignKeyResolver for NeverResolves {
    async fn digest_exists(&self, _digest_id: &str) -> bool {
        false
    }
}

/// A handler that always succeeds, counting how many times it ran.
#[derive(Default)]
pub struct CountingSuccessHandler {
    pub calls: AtomicU32,
}

impl CountingSuccessHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for CountingSuccessHandler {
    async fn handle(&self, _job: &Job, _cancel: &CancelToken) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::ok()
    }
}

/// A handler that always fails with a fixed message — drives the retry
/// and retry-exhaustion paths in tests.
pub struct AlwaysFailsHandler {
    pub message: String,
}

impl AlwaysFailsHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[async_trait]
impl JobHandler for AlwaysFailsHandler {
    async fn handle(&self, _job: &Job, _cancel: &CancelToken) -> HandlerOutcome {
        HandlerOutcome::err(self.message.clone())
    }
}

/// A handler that waits on its cancel token until cancelled, then returns —
/// drives timeout and `cancelJob` tests without a real sleep.
pub struct HangsUntilCancelledHandler;

#[async_trait]
impl JobHandler for HangsUntilCancelledHandler {
    async fn handle(&self, _job: &Job, cancel: &CancelToken) -> HandlerOutcome {
        cancel.cancelled().await;
        HandlerOutcome::err("cancelled before completion")
    }
}
