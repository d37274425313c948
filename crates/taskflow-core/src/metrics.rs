//! Queue metrics and health report shapes (spec §4.1, §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total_jobs: u64,
    pub pending_jobs: u64,
    pub running_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub queue_length: u64,
    pub active_workers: u64,
    pub average_processing_time_ms: f64,
    pub success_rate: f64,
    pub last_updated: DateTime<Utc>,
}

impl QueueMetrics {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            total_jobs: 0,
            pending_jobs: 0,
            running_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            queue_length: 0,
            active_workers: 0,
            average_processing_time_ms: 0.0,
            success_rate: 0.0,
            last_updated: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub metrics: QueueMetrics,
}

/// The health check endpoint's shape (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub queue_length: u64,
    pub active_jobs: u64,
    pub failed_jobs: u64,
    pub oldest_pending_job: Option<DateTime<Utc>>,
    pub worker_status: Vec<crate::worker::WorkerStatus>,
    pub last_processed_job: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}
