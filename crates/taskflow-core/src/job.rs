//! The central entity (spec §3).

use crate::ids::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Closed enumeration of job-type tags, with a `Custom` escape hatch so
/// embedding applications can register handlers under their own tag without
/// forking this crate (SPEC_FULL §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum JobType {
    Digest,
    Notification,
    Cleanup,
    HealthCheck,
    WebhookDelivery,
    DataSync,
    Backup,
    Custom(String),
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobType::Digest => "digest",
            JobType::Notification => "notification",
            JobType::Cleanup => "cleanup",
            JobType::HealthCheck => "health-check",
            JobType::WebhookDelivery => "webhook-delivery",
            JobType::DataSync => "data-sync",
            JobType::Backup => "backup",
            JobType::Custom(tag) => tag,
        };
        f.write_str(s)
    }
}

impl FromStr for JobType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "digest" => JobType::Digest,
            "notification" => JobType::Notification,
            "cleanup" => JobType::Cleanup,
            "health-check" => JobType::HealthCheck,
            "webhook-delivery" => JobType::WebhookDelivery,
            "data-sync" => JobType::DataSync,
            "backup" => JobType::Backup,
            other => JobType::Custom(other.to_string()),
        })
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for JobType {
    type Error = std::convert::Infallible;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        JobType::from_str(&value)
    }
}

/// A job's lifecycle state (spec §3, state machine in §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    pub params: Map<String, Value>,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_by_id: String,
    pub digest_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub schedule_time: Option<DateTime<Utc>>,
    pub dependencies: HashSet<JobId>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub error: Option<String>,
}

/// Inputs to `Queue::create_job` (spec §4.1 "Creation").
#[derive(Debug, Clone)]
pub struct CreateJobOptions {
    pub job_type: JobType,
    pub priority: i32,
    pub params: Map<String, Value>,
    pub created_by_id: String,
    pub digest_id: Option<String>,
    pub max_retries: u32,
    pub schedule_time: Option<DateTime<Utc>>,
    pub dependencies: HashSet<JobId>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl CreateJobOptions {
    pub fn new(job_type: JobType, created_by_id: impl Into<String>) -> Self {
        Self {
            job_type,
            priority: 0,
            params: Map::new(),
            created_by_id: created_by_id.into(),
            digest_id: None,
            max_retries: 3,
            schedule_time: None,
            dependencies: HashSet::new(),
            tags: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_schedule_time(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_time = Some(at);
        self
    }

    pub fn with_dependencies(mut self, deps: HashSet<JobId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_digest_id(mut self, digest_id: impl Into<String>) -> Self {
        self.digest_id = Some(digest_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A partial update applied by `Queue::update_job`. Unset fields are left
/// untouched; `None` on an `Option<Option<T>>` field means "do not change".
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
    pub schedule_time: Option<Option<DateTime<Utc>>>,
    pub retry_count: Option<u32>,
    pub error: Option<Option<String>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress.min(100)),
            ..Default::default()
        }
    }

    /// Whether this update changes `status` — the Queue uses this to decide
    /// whether a bucket move (and a state-transition event) is needed, versus
    /// a plain `progress-updated` event.
    pub fn changes_status(&self) -> bool {
        self.status.is_some()
    }
}
