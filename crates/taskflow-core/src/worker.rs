//! Worker instance types (spec §3, §4.4).

use crate::ids::WorkerId;
use crate::job::JobType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: WorkerId,
    pub max_jobs: u32,
    pub supported_job_types: Vec<JobType>,
    pub enabled: bool,
    pub health_check_interval: Duration,
    pub graceful_shutdown_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(supported_job_types: Vec<JobType>) -> Self {
        Self {
            id: WorkerId::new(),
            max_jobs: 5,
            supported_job_types,
            enabled: true,
            health_check_interval: Duration::from_secs(30),
            graceful_shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: u32) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }
}

/// A worker's recent error, kept in a 10-entry ring (spec §3).
#[derive(Debug, Clone)]
pub struct WorkerError {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub healthy: bool,
    pub active_jobs: u32,
    pub total_processed: u64,
    pub last_activity: DateTime<Utc>,
    #[serde(skip)]
    pub recent_errors: VecDeque<WorkerError>,
}

impl WorkerStatus {
    pub fn new(id: WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            healthy: true,
            active_jobs: 0,
            total_processed: 0,
            last_activity: now,
            recent_errors: VecDeque::with_capacity(10),
        }
    }

    pub fn record_error(&mut self, at: DateTime<Utc>, message: String) {
        if self.recent_errors.len() == 10 {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(WorkerError { at, message });
    }

    /// Errors recorded within the last `window` (spec §4.4 "Health check":
    /// "more than 5 errors in the last 5 minutes").
    pub fn errors_since(&self, since: DateTime<Utc>) -> usize {
        self.recent_errors.iter().filter(|e| e.at >= since).count()
    }
}
