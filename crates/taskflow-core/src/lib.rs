//! # taskflow-core
//!
//! A persistent, priority-based job processing engine: a durable [`Queue`]
//! feeds a concurrent [`Processor`] pool, a [`Scheduler`] produces jobs on a
//! timer, a [`WorkerPoolManager`] elastically sizes and health-checks the
//! workers pulling from the queue, and a [`Monitor`] collects metrics and
//! evaluates alert rules against them.
//!
//! ## Architecture
//!
//! ```text
//! creator ──createJob──► Queue ──persist──► JobStore
//!                           │
//!            Scheduler ─────┤ (also creates jobs, on a timer)
//!                           │
//!                           ▼
//!                   Processor (per worker) ──► JobHandler
//!                           │
//!                           ▼
//!                   Queue.update (status/progress)
//!                           │
//!                           ▼
//!                       Monitor ──► ActiveAlert / AlertNotification
//! ```
//!
//! Each worker in the [`WorkerPoolManager`] runs its own [`Processor`]
//! pulling from the shared `Queue` (see the module docs on `worker_pool` for
//! why dispatch is pull-based rather than centrally assigned). Handlers,
//! stores, and digest resolvers are external collaborators this crate only
//! defines traits for — see [`JobHandler`], [`JobStore`], and
//! [`ForeignKeyResolver`].
//!
//! This crate never initializes a `tracing` subscriber or reads
//! configuration from the environment; host processes (see
//! `demos/taskflow-demo`) own that.

mod alert;
mod cancel;
mod config;
mod error;
mod events;
mod handler;
mod ids;
mod job;
mod metrics;
mod monitor;
mod processor;
mod queue;
mod schedule;
mod scheduler;
mod store;
mod worker;
mod worker_pool;

#[cfg(test)]
mod monitor_tests;
#[cfg(test)]
mod processor_tests;
#[cfg(test)]
mod queue_tests;
#[cfg(test)]
mod scheduler_tests;
#[cfg(test)]
mod worker_pool_tests;

pub use alert::{AckInfo, ActiveAlert, AlertCondition, AlertNotification, AlertRule, AlertSeverity};
pub use cancel::CancelToken;
pub use config::{
    AutoscaleConfig, LoadBalancingStrategy, MonitorConfig, ProcessorConfig, RetryConfig,
    SchedulerConfig, TaskflowConfig, WorkerPoolConfig,
};
pub use error::{Result, TaskflowError};
pub use events::{EventBus, MonitorEvent, ProcessorEvent, QueueEvent, SchedulerEvent, WorkerEvent};
pub use handler::{HandlerOutcome, JobHandler};
pub use ids::{ActiveAlertId, AlertRuleId, JobId, ScheduleId, WorkerId};
pub use job::{CreateJobOptions, Job, JobStatus, JobType, JobUpdate};
pub use metrics::{HealthReport, MetricsSnapshot, QueueMetrics};
pub use monitor::Monitor;
pub use processor::{Processor, ProcessorStats};
pub use queue::{ForeignKeyResolver, Queue};
pub use schedule::{DailyAt, FixedInterval, NextRun, ScheduleDefinition};
pub use scheduler::{Scheduler, SchedulerStats};
pub use store::{
    is_foreign_key_violation, ForeignKeyViolationError, JobFilter, JobRecord, JobStore, OrderBy,
    SortDirection,
};
pub use worker::{WorkerConfig, WorkerError, WorkerStatus};
pub use worker_pool::WorkerPoolManager;

pub use async_trait::async_trait;
