//! Elastic worker pool manager (spec §4.4).
//!
//! Each worker owns its own [`Processor`] ticking independently against the
//! shared [`Queue`] via `get_next_job_for(supported_types)` — a "pull and
//! skip" model. A centralized dispatcher that pulls a job (marking it
//! Running) and only then looks for a worker with a free slot risks stranding
//! that job if every eligible worker turns out to be full; letting each
//! worker pull for itself means a job is only ever taken by a worker that can
//! run it right away. `LoadBalancingStrategy` is therefore not a dispatch
//! mechanism here; it drives `select_worker_for`, a pure function exposed for
//! introspection and for the autoscaler's "which worker would take this"
//! accounting.

use crate::config::{AutoscaleConfig, LoadBalancingStrategy, ProcessorConfig, WorkerPoolConfig};
use crate::events::{EventBus, QueueEvent, WorkerEvent};
use crate::handler::JobHandler;
use crate::ids::WorkerId;
use crate::job::JobType;
use crate::processor::Processor;
use crate::queue::Queue;
use crate::worker::{WorkerConfig, WorkerStatus};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

struct ManagedWorker {
    config: WorkerConfig,
    processor: Arc<Processor>,
    status: Mutex<WorkerStatus>,
    auto_provisioned: bool,
    health_handle: Mutex<Option<JoinHandle<()>>>,
    error_tracker_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the pool of workers, their processors, health checks, and autoscale
/// policy (spec §4.4).
pub struct WorkerPoolManager {
    queue: Arc<Queue>,
    workers: DashMap<WorkerId, Arc<ManagedWorker>>,
    handlers: Mutex<Vec<(JobType, Arc<dyn JobHandler>)>>,
    processor_config: ProcessorConfig,
    pool_config: WorkerPoolConfig,
    events: EventBus<WorkerEvent>,
    running: Arc<AtomicBool>,
    autoscale_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPoolManager {
    pub fn new(queue: Arc<Queue>, processor_config: ProcessorConfig, pool_config: WorkerPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            queue,
            workers: DashMap::new(),
            handlers: Mutex::new(Vec::new()),
            processor_config,
            pool_config,
            events: EventBus::new(),
            running: Arc::new(AtomicBool::new(false)),
            autoscale_handle: Mutex::new(None),
        })
    }

    pub fn events(&self) -> EventBus<WorkerEvent> {
        self.events.clone()
    }

    /// Registers a handler on every current and future worker's processor
    /// (spec §4.4: "handlers must be registered on a worker's processor
    /// before it starts dispatching").
    pub fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        for entry in self.workers.iter() {
            entry.processor.register_handler(job_type.clone(), Arc::clone(&handler));
        }
        self.handlers
            .lock()
            .expect("handlers lock poisoned")
            .push((job_type, handler));
    }

    /// Adds a worker with `config`, installs all previously-registered
    /// handlers onto its processor, then starts its dispatch loop.
    pub fn add_worker(&self, config: WorkerConfig) -> WorkerId {
        self.add_worker_inner(config, false)
    }

    pub(crate) fn add_worker_inner(&self, config: WorkerConfig, auto_provisioned: bool) -> WorkerId {
        let id = config.id;
        let processor = Processor::with_supported_types(
            Arc::clone(&self.queue),
            self.processor_config.clone(),
            Some(config.supported_job_types.clone()),
        );

        for (job_type, handler) in self.handlers.lock().expect("handlers lock poisoned").iter() {
            processor.register_handler(job_type.clone(), Arc::clone(handler));
        }

        if config.enabled {
            processor.start_processing();
        }

        let worker = Arc::new(ManagedWorker {
            status: Mutex::new(WorkerStatus::new(id, Utc::now())),
            config,
            processor,
            auto_provisioned,
            health_handle: Mutex::new(None),
            error_tracker_handle: Mutex::new(None),
        });
        self.start_health_check(Arc::clone(&worker));
        self.start_error_tracker(Arc::clone(&worker));
        self.workers.insert(id, worker);
        self.events.emit(WorkerEvent::Added { worker_id: id });
        id
    }

    /// Folds the worker's own processor's `JobFailed`/`JobCompleted` events
    /// into its `WorkerStatus` — `recent_errors` and `last_activity` feed
    /// `check_health`'s "more than 5 errors in 5 minutes" rule, which has
    /// nothing else driving it since the processor doesn't know about
    /// `WorkerStatus` (spec §4.4 "Health check"); `total_processed` counts
    /// successful completions (spec §3 "Worker instance").
    fn start_error_tracker(&self, worker: Arc<ManagedWorker>) {
        let mut rx = worker.processor.events().subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(crate::events::ProcessorEvent::JobFailed { message, .. }) => {
                        let mut status = worker.status.lock().expect("status lock poisoned");
                        status.record_error(Utc::now(), message);
                        status.last_activity = Utc::now();
                    }
                    Ok(crate::events::ProcessorEvent::JobCompleted { .. }) => {
                        let mut status = worker.status.lock().expect("status lock poisoned");
                        status.total_processed += 1;
                        status.last_activity = Utc::now();
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *worker.error_tracker_handle.lock().expect("error tracker handle lock poisoned") = Some(handle);
    }

    fn start_health_check(self: &Arc<Self>, worker: Arc<ManagedWorker>) {
        let this = Arc::clone(self);
        let interval = worker.config.health_check_interval;
        let worker_id = worker.config.id;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.check_health(worker_id);
            }
        });
        *worker.health_handle.lock().expect("health handle lock poisoned") = Some(handle);
    }

    /// A worker is unhealthy if its last activity is stale (more than 3x its
    /// own health-check interval) or it has logged more than 5 errors in the
    /// last 5 minutes (spec §4.4 "Health check").
    pub(crate) fn check_health(&self, worker_id: WorkerId) {
        let Some(worker) = self.workers.get(&worker_id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let now = Utc::now();
        let stale_after = worker.config.health_check_interval * 3;
        let error_window = now - chrono::Duration::minutes(5);

        let mut status = worker.status.lock().expect("status lock poisoned");
        status.active_jobs = worker.processor.active_jobs();
        let stale = chrono::Duration::from_std(stale_after)
            .map(|d| now - status.last_activity > d)
            .unwrap_or(false);
        let too_many_errors = status.errors_since(error_window) > 5;
        let healthy = !stale && !too_many_errors;

        if healthy != status.healthy {
            status.healthy = healthy;
            let snapshot = status.clone();
            drop(status);
            self.events.emit(WorkerEvent::HealthChanged {
                worker_id,
                healthy,
                status: snapshot,
            });
        }
    }

    pub fn worker_status(&self, worker_id: WorkerId) -> Option<WorkerStatus> {
        self.workers
            .get(&worker_id)
            .map(|w| w.status.lock().expect("status lock poisoned").clone())
    }

    pub fn all_statuses(&self) -> Vec<WorkerStatus> {
        self.workers
            .iter()
            .map(|e| e.status.lock().expect("status lock poisoned").clone())
            .collect()
    }

    pub fn healthy_worker_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|e| e.status.lock().expect("status lock poisoned").healthy)
            .count()
    }

    /// Waits up to `graceful_shutdown_timeout` for the worker's active jobs
    /// to drain before shutting down its processor (spec §4.4 "Graceful
    /// removal"). Returns `false` if the worker id is unknown.
    pub async fn remove_worker(&self, worker_id: WorkerId) -> bool {
        let Some((_, worker)) = self.workers.remove(&worker_id) else {
            return false;
        };
        if let Some(handle) = worker.health_handle.lock().expect("health handle lock poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = worker.error_tracker_handle.lock().expect("error tracker handle lock poisoned").take() {
            handle.abort();
        }
        worker.processor.shutdown(worker.config.graceful_shutdown_timeout).await;
        self.events.emit(WorkerEvent::Removed { worker_id, forceful: false });
        true
    }

    /// Stops the worker immediately, force-cancelling any in-flight jobs
    /// (spec §4.4 "Forceful removal").
    pub async fn remove_worker_forceful(&self, worker_id: WorkerId) -> bool {
        let Some((_, worker)) = self.workers.remove(&worker_id) else {
            return false;
        };
        if let Some(handle) = worker.health_handle.lock().expect("health handle lock poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = worker.error_tracker_handle.lock().expect("error tracker handle lock poisoned").take() {
            handle.abort();
        }
        worker.processor.stop_processing();
        worker.processor.force_cancel_all("worker forcefully shut down").await;
        self.events.emit(WorkerEvent::Removed { worker_id, forceful: true });
        true
    }

    /// Pure selection function: which worker `strategy` would hand a job of
    /// `job_type` to, among currently healthy, enabled, capacity-having
    /// workers. Exposed for introspection; actual dispatch is pull-based
    /// (see module docs), not driven by this function.
    pub fn select_worker_for(&self, job_type: &JobType, strategy: LoadBalancingStrategy) -> Option<WorkerId> {
        let candidates: Vec<(WorkerId, u32, u32)> = self
            .workers
            .iter()
            .filter(|e| {
                let status = e.status.lock().expect("status lock poisoned");
                e.config.enabled
                    && status.healthy
                    && status.active_jobs < e.config.max_jobs
                    && e.config.supported_job_types.iter().any(|t| t == job_type)
            })
            .map(|e| {
                let status = e.status.lock().expect("status lock poisoned");
                (e.config.id, status.active_jobs, e.config.max_jobs)
            })
            .collect();

        match strategy {
            LoadBalancingStrategy::RoundRobin => candidates.first().map(|(id, _, _)| *id),
            LoadBalancingStrategy::LeastLoaded => candidates
                .iter()
                .min_by_key(|(_, active, _)| *active)
                .map(|(id, _, _)| *id),
            LoadBalancingStrategy::JobTypeAffinity => candidates
                .iter()
                .min_by_key(|(_, active, max)| (max - active == 0, *active))
                .map(|(id, _, _)| *id),
        }
    }

    /// Starts the autoscaler, which reacts to `QueueEvent::Created` by
    /// re-checking pool sizing against `AutoscaleConfig` (spec §4.4
    /// "Autoscaling").
    pub fn start_autoscaler(self: &Arc<Self>) {
        if !self.pool_config.autoscale.enabled {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let mut rx = this.queue.events().subscribe();
        let handle = tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Ok(QueueEvent::Created { .. }) => this.autoscale_tick(),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.autoscale_handle.lock().expect("autoscale handle lock poisoned") = Some(handle);
    }

    pub fn stop_autoscaler(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self
            .autoscale_handle
            .lock()
            .expect("autoscale handle lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Scale up when `queueLength > scale_up_queue_length` and
    /// `healthyWorkers < scale_up_max_healthy_workers`; scale down the mirror
    /// condition, never removing a manually-added worker (spec §4.4
    /// "Autoscaling").
    pub(crate) fn autoscale_tick(&self) {
        let AutoscaleConfig {
            scale_up_queue_length,
            scale_up_max_healthy_workers,
            scale_down_queue_length,
            scale_down_min_healthy_workers,
            auto_worker_max_jobs,
            ..
        } = self.pool_config.autoscale;

        let queue_length = self.queue.get_metrics().queue_length;
        let healthy = self.healthy_worker_count() as u32;

        if queue_length > scale_up_queue_length && healthy < scale_up_max_healthy_workers {
            let supported = self.known_job_types();
            let config = WorkerConfig::new(supported)
                .with_id(WorkerId::new())
                .with_max_jobs(auto_worker_max_jobs);
            tracing::info!(worker_id = %config.id, queue_length, healthy, "autoscaling up");
            self.add_worker_inner(config, true);
            return;
        }

        if queue_length < scale_down_queue_length && healthy > scale_down_min_healthy_workers {
            if let Some(victim) = self
                .workers
                .iter()
                .filter(|e| e.auto_provisioned && e.status.lock().expect("status lock poisoned").healthy)
                .min_by_key(|e| e.status.lock().expect("status lock poisoned").active_jobs)
                .map(|e| e.config.id)
            {
                tracing::info!(worker_id = %victim, queue_length, healthy, "autoscaling down");
                let workers = self.workers.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    if let Some((_, worker)) = workers.remove(&victim) {
                        if let Some(h) = worker.health_handle.lock().expect("health handle lock poisoned").take() {
                            h.abort();
                        }
                        if let Some(h) = worker
                            .error_tracker_handle
                            .lock()
                            .expect("error tracker handle lock poisoned")
                            .take()
                        {
                            h.abort();
                        }
                        worker.processor.shutdown(worker.config.graceful_shutdown_timeout).await;
                        events.emit(WorkerEvent::Removed { worker_id: victim, forceful: false });
                    }
                });
            }
        }
    }

    fn known_job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self
            .handlers
            .lock()
            .expect("handlers lock poisoned")
            .iter()
            .map(|(t, _)| t.clone())
            .collect();
        types.dedup();
        types
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|e| *e.key()).collect()
    }

    /// Shuts down every worker gracefully and stops the autoscaler.
    pub async fn shutdown(&self) {
        self.stop_autoscaler();
        let ids: Vec<WorkerId> = self.workers.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove_worker(id).await;
        }
    }
}
