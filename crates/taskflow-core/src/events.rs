//! Per-component typed event bus (spec §6, §9 "Event plumbing").
//!
//! One `EventBus<T>` per component, backed by `tokio::sync::broadcast` —
//! at-most-once delivery, no persistence, no back-pressure (events are
//! advisory). A lagged subscriber sees `RecvError::Lagged` rather than a
//! silently-dropped event.

use crate::alert::ActiveAlert;
use crate::ids::{AlertRuleId, JobId, ScheduleId, WorkerId};
use crate::metrics::QueueMetrics;
use crate::worker::WorkerStatus;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Advisory: a send with no subscribers is not an error.
    pub fn emit(&self, event: T) {
        let _ = self.sender.send(event);
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Created { job_id: JobId, at: DateTime<Utc> },
    Started { job_id: JobId, at: DateTime<Utc> },
    Completed { job_id: JobId, at: DateTime<Utc> },
    Failed { job_id: JobId, final_failure: bool, at: DateTime<Utc> },
    Cancelled { job_id: JobId, at: DateTime<Utc> },
    Retrying { job_id: JobId, retry_at: DateTime<Utc> },
    ProgressUpdated { job_id: JobId, progress: u8 },
}

#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    HandlerMissing { job_id: JobId },
    Dispatching { job_id: JobId },
    JobCompleted { job_id: JobId },
    JobFailed { job_id: JobId, message: String },
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    HealthChanged { worker_id: WorkerId, healthy: bool, status: WorkerStatus },
    Added { worker_id: WorkerId },
    Removed { worker_id: WorkerId, forceful: bool },
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    MetricsCollected { metrics: QueueMetrics },
    AlertTriggered { alert: ActiveAlert },
    NotificationSent { notification: crate::alert::AlertNotification },
}

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    JobEnqueued { schedule_id: ScheduleId, job_id: JobId },
    ScheduleError { schedule_id: ScheduleId, message: String },
}
