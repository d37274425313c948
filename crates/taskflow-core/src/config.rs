//! Typed configuration structs for each component.
//!
//! Core crates never read environment variables or config files directly —
//! they accept already-parsed config structs (SPEC_FULL §2). A host process
//! (see `demos/taskflow-demo`) is responsible for loading these from disk/env
//! via the `config` crate and handing the result to the component
//! constructors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub retry_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_retry_delay_ms: 3_600_000,
        }
    }
}

impl RetryConfig {
    /// `delay = min(maxRetryDelay, retryDelay * backoffFactor^retryCount)`
    /// (spec §4.1 "Retry").
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let raw = self.retry_delay_ms as f64 * self.backoff_factor.powi(retry_count as i32);
        let capped = raw.min(self.max_retry_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub max_concurrent_jobs: u32,
    pub dispatch_interval_ms: u64,
    #[serde(with = "humantime_millis")]
    pub job_timeout: Duration,
    #[serde(with = "humantime_millis")]
    pub shutdown_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            dispatch_interval_ms: 250,
            job_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub check_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLoaded,
    JobTypeAffinity,
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        LoadBalancingStrategy::LeastLoaded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub scale_up_queue_length: u64,
    pub scale_up_max_healthy_workers: u32,
    pub scale_down_queue_length: u64,
    pub scale_down_min_healthy_workers: u32,
    pub auto_worker_max_jobs: u32,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scale_up_queue_length: 100,
            scale_up_max_healthy_workers: 10,
            scale_down_queue_length: 10,
            scale_down_min_healthy_workers: 2,
            auto_worker_max_jobs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub strategy: LoadBalancingStrategy,
    pub autoscale: AutoscaleConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::default(),
            autoscale: AutoscaleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub monitor_interval_ms: u64,
    pub alert_check_interval_ms: u64,
    pub history_capacity: usize,
    pub failure_rate_window_minutes: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 60_000,
            alert_check_interval_ms: 30_000,
            history_capacity: 1440,
            failure_rate_window_minutes: 60,
        }
    }
}

/// Whole-process configuration, as a host binary would load it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskflowConfig {
    pub processor: ProcessorConfig,
    pub scheduler: SchedulerConfig,
    pub worker_pool: WorkerPoolConfig,
    pub monitor: MonitorConfig,
}

mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
