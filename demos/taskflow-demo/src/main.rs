//! Reference process wiring for `taskflow-core`.
//!
//! Loads configuration, opens a Postgres pool, constructs the Queue,
//! Processor, Scheduler, Worker Pool Manager, and Monitor, registers one
//! illustrative handler, and runs until `Ctrl-C`. The wire protocol (REST,
//! RPC, ...) an operator would put in front of this is out of scope (spec
//! §6 "Operator surface (abstract)") — this binary only demonstrates
//! construction and graceful shutdown.

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use taskflow_core::{
    AlertCondition, AlertRule, CancelToken, CreateJobOptions, HandlerOutcome, Job, JobHandler,
    JobType, Monitor, Queue, Scheduler, TaskflowConfig, WorkerConfig, WorkerPoolManager,
};
use taskflow_postgres::PgJobStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taskflow-demo", about = "Runs the taskflow job processing engine")]
struct Cli {
    /// Path to a TOML/YAML/JSON config file layered under env vars prefixed TASKFLOW_.
    #[arg(long, default_value = "taskflow.toml")]
    config: String,

    /// Overrides the configured database URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Settings {
    database_url: String,
    #[serde(default)]
    taskflow: TaskflowConfig,
}

/// A toy handler standing in for a real one (concrete job handlers are
/// external collaborators, spec §1 Non-goals). Logs and succeeds.
struct HealthCheckHandler;

#[async_trait::async_trait]
impl JobHandler for HealthCheckHandler {
    async fn handle(&self, job: &Job, _cancel: &CancelToken) -> HandlerOutcome {
        tracing::info!(job_id = %job.id, "health-check job executed");
        HandlerOutcome::ok()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings(&cli)?;
    if let Some(url) = cli.database_url {
        settings.database_url = url;
    }

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.database_url)
        .await
        .context("connecting to postgres")?;
    let store: Arc<dyn taskflow_core::JobStore> = Arc::new(PgJobStore::new(pool));

    let queue = Arc::new(
        Queue::recover(store, settings.taskflow.processor.retry.clone())
            .await
            .context("recovering queue from store")?,
    );

    let scheduler = Scheduler::new(Arc::clone(&queue), settings.taskflow.scheduler.clone());
    scheduler.start();

    let workers = WorkerPoolManager::new(
        Arc::clone(&queue),
        settings.taskflow.processor.clone(),
        settings.taskflow.worker_pool.clone(),
    );
    workers.register_handler(JobType::HealthCheck, Arc::new(HealthCheckHandler));
    workers.add_worker(WorkerConfig::new(vec![JobType::HealthCheck]));
    workers.start_autoscaler();

    let monitor = Monitor::with_worker_pool(
        Arc::clone(&queue),
        settings.taskflow.monitor.clone(),
        Arc::clone(&workers),
    );
    monitor.add_rule(AlertRule::new("queue backlog", AlertCondition::QueueLength, 500.0).with_cooldown(30));
    monitor.add_rule(AlertRule::new("workers down", AlertCondition::WorkerDown, 1.0).with_cooldown(5));
    monitor.start();

    tracing::info!("taskflow demo running, press ctrl-c to shut down");

    // Illustrates the operator surface's createJob (spec §6).
    let _ = queue
        .create_job(CreateJobOptions::new(JobType::HealthCheck, "taskflow-demo"))
        .await;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    monitor.stop();
    scheduler.stop();
    workers.shutdown().await;
    queue.shutdown();

    Ok(())
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(&cli.config).required(false))
        .add_source(config::Environment::with_prefix("TASKFLOW").separator("__"));
    builder
        .build()
        .context("building configuration")?
        .try_deserialize()
        .context("deserializing configuration")
}
