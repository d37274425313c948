//! Concurrent dispatcher (spec §4.2).

use crate::cancel::CancelToken;
use crate::error::TaskflowError;
use crate::events::{EventBus, ProcessorEvent};
use crate::handler::{HandlerOutcome, JobHandler};
use crate::ids::JobId;
use crate::job::{Job, JobStatus, JobType, JobUpdate};
use crate::queue::Queue;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::ProcessorConfig;

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessorStats {
    pub active_jobs: u64,
    pub processed: u64,
    pub failed: u64,
}

pub struct Processor {
    queue: Arc<Queue>,
    handlers: DashMap<JobType, Arc<dyn JobHandler>>,
    config: ProcessorConfig,
    cancel_tokens: DashMap<JobId, CancelToken>,
    inflight: DashMap<JobId, JoinHandle<()>>,
    events: EventBus<ProcessorEvent>,
    shutdown_signal: Arc<AtomicBool>,
    processed: AtomicU64,
    failed: AtomicU64,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    supported_types: Option<Vec<JobType>>,
}

impl Processor {
    pub fn new(queue: Arc<Queue>, config: ProcessorConfig) -> Arc<Self> {
        Self::with_supported_types(queue, config, None)
    }

    /// `supported_types` restricts which job types this Processor's dispatch
    /// loop will pull (spec §4.4 "Job-type filtering"); `None` accepts any
    /// type, the shape a standalone (non-pooled) Processor uses.
    pub fn with_supported_types(
        queue: Arc<Queue>,
        config: ProcessorConfig,
        supported_types: Option<Vec<JobType>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            handlers: DashMap::new(),
            config,
            cancel_tokens: DashMap::new(),
            inflight: DashMap::new(),
            events: EventBus::new(),
            shutdown_signal: Arc::new(AtomicBool::new(false)),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            loop_handle: std::sync::Mutex::new(None),
            supported_types,
        })
    }

    pub fn events(&self) -> EventBus<ProcessorEvent> {
        self.events.clone()
    }

    pub fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn unregister_handler(&self, job_type: &JobType) {
        self.handlers.remove(job_type);
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            active_jobs: self.inflight.len() as u64,
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Starts the dispatch loop on a background task: every
    /// `dispatch_interval_ms`, compute `slots = maxConcurrentJobs -
    /// activeJobs`, pull up to `slots` jobs, and launch each concurrently
    /// (spec §4.2 "Dispatch loop").
    pub fn start_processing(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = Duration::from_millis(this.config.dispatch_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if this.shutdown_signal.load(Ordering::SeqCst) {
                    break;
                }
                this.tick().await;
            }
        });
        *self.loop_handle.lock().expect("loop handle lock poisoned") = Some(handle);
    }

    async fn tick(self: &Arc<Self>) {
        let active = self.inflight.len() as u32;
        let slots = self.config.max_concurrent_jobs.saturating_sub(active);
        for _ in 0..slots {
            let Some(job) = self.queue.get_next_job_for(self.supported_types.as_deref()).await else {
                break;
            };
            if !self.handlers.contains_key(&job.job_type) {
                self.events.emit(ProcessorEvent::HandlerMissing { job_id: job.id });
                self.queue
                    .fail_job(
                        job.id,
                        format!("no handler registered for job type {}", job.job_type),
                        true,
                    )
                    .await;
                continue;
            }
            self.spawn_job(job);
        }
    }

    fn spawn_job(self: &Arc<Self>, job: Job) {
        let this = Arc::clone(self);
        let job_id = job.id;
        let token = CancelToken::new();
        self.cancel_tokens.insert(job_id, token.clone());
        self.events.emit(ProcessorEvent::Dispatching { job_id });

        let handle = tokio::spawn(async move {
            this.execute(job, token).await;
            this.inflight.remove(&job_id);
            this.cancel_tokens.remove(&job_id);
        });
        self.inflight.insert(job_id, handle);
    }

    /// Per-job execution (spec §4.2 steps a-f).
    async fn execute(self: &Arc<Self>, job: Job, cancel: CancelToken) {
        let job_id = job.id;

        self.queue.update_job(job_id, JobUpdate::progress(0)).await;

        let Some(handler) = self.handlers.get(&job.job_type).map(|h| h.value().clone()) else {
            self.queue
                .fail_job(job_id, "no handler registered".to_string(), true)
                .await;
            return;
        };

        if !handler.validate(&job.params) {
            self.queue
                .fail_job(job_id, "parameter validation failed".to_string(), true)
                .await;
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.events.emit(ProcessorEvent::JobFailed {
                job_id,
                message: "parameter validation failed".to_string(),
            });
            return;
        }

        let outcome = tokio::time::timeout(self.config.job_timeout, handler.handle(&job, &cancel)).await;

        match outcome {
            Err(_elapsed) => {
                cancel.cancel();
                let error = TaskflowError::Timeout {
                    job_id,
                    elapsed_ms: self.config.job_timeout.as_millis() as u64,
                };
                self.on_failure(job_id, job.retry_count, job.max_retries, error).await;
            }
            Ok(HandlerOutcome::Ok { .. }) => {
                let now = chrono::Utc::now();
                self.queue
                    .update_job(
                        job_id,
                        JobUpdate {
                            status: Some(JobStatus::Completed),
                            progress: Some(100),
                            finished_at: Some(Some(now)),
                            ..Default::default()
                        },
                    )
                    .await;
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(ProcessorEvent::JobCompleted { job_id });
            }
            Ok(HandlerOutcome::Err { message }) => {
                let error = TaskflowError::HandlerFailure { job_id, message };
                self.on_failure(job_id, job.retry_count, job.max_retries, error).await;
            }
        }
    }

    /// Retry policy (spec §4.2 "Retry policy"): increment and re-schedule
    /// with backoff if retries remain and `error` is one the taxonomy marks
    /// retryable (spec §7), otherwise fail terminally.
    async fn on_failure(self: &Arc<Self>, job_id: JobId, retry_count: u32, max_retries: u32, error: TaskflowError) {
        let message = error.to_string();
        self.events.emit(ProcessorEvent::JobFailed { job_id, message: message.clone() });
        if error.is_retryable() && retry_count < max_retries {
            self.queue
                .update_job(
                    job_id,
                    JobUpdate {
                        retry_count: Some(retry_count + 1),
                        ..Default::default()
                    },
                )
                .await;
            self.queue.fail_job(job_id, message, false).await;
            self.queue.retry_job(job_id).await;
        } else {
            self.queue.fail_job(job_id, message, true).await;
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fires the job's cancel token if running, then marks it Cancelled. If
    /// the job never left the Queue, delegates to `Queue::cancel_job`.
    pub async fn cancel_job(&self, job_id: JobId) -> bool {
        if let Some(token) = self.cancel_tokens.get(&job_id) {
            token.cancel();
        }
        self.queue.cancel_job(job_id).await
    }

    pub fn stop_processing(&self) {
        self.shutdown_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.lock().expect("loop handle lock poisoned").take() {
            handle.abort();
        }
    }

    pub fn active_jobs(&self) -> u32 {
        self.inflight.len() as u32
    }

    pub fn has_handler(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Fires every outstanding job's cancel token and marks it Failed with
    /// `message`, used both by `shutdown`'s post-deadline sweep and by the
    /// Worker Pool Manager's forceful worker removal (spec §4.2 "Shutdown",
    /// §4.4 "Graceful removal").
    pub async fn force_cancel_all(&self, message: &str) {
        let remaining: Vec<JobId> = self.inflight.iter().map(|e| *e.key()).collect();
        for job_id in remaining {
            if let Some(token) = self.cancel_tokens.get(&job_id) {
                token.cancel();
            }
            self.queue.fail_job(job_id, message.to_string(), true).await;
            if let Some((_, handle)) = self.inflight.remove(&job_id) {
                handle.abort();
            }
        }
    }

    /// Stops accepting new work, waits up to `timeout` for in-flight jobs to
    /// drain, then force-cancels and fails whatever remains
    /// (spec §4.2 "Shutdown").
    pub async fn shutdown(&self, timeout: Duration) {
        self.stop_processing();

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.inflight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.force_cancel_all("cancelled due to system shutdown").await;
    }
}
