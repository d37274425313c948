//! Periodic schedule-driven job producer (spec §4.3).

use crate::config::SchedulerConfig;
use crate::events::{EventBus, SchedulerEvent};
use crate::ids::{JobId, ScheduleId};
use crate::job::CreateJobOptions;
use crate::queue::Queue;
use crate::schedule::ScheduleDefinition;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerStats {
    pub schedule_count: u64,
    pub enabled_count: u64,
}

pub struct Scheduler {
    queue: Arc<Queue>,
    schedules: DashMap<ScheduleId, ScheduleDefinition>,
    config: SchedulerConfig,
    events: EventBus<SchedulerEvent>,
    running: Arc<AtomicBool>,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(queue: Arc<Queue>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            queue,
            schedules: DashMap::new(),
            config,
            events: EventBus::new(),
            running: Arc::new(AtomicBool::new(false)),
            loop_handle: std::sync::Mutex::new(None),
        })
    }

    pub fn events(&self) -> EventBus<SchedulerEvent> {
        self.events.clone()
    }

    pub fn add_schedule(&self, definition: ScheduleDefinition) -> ScheduleId {
        let id = definition.id;
        self.schedules.insert(id, definition);
        id
    }

    pub fn update_schedule<F>(&self, id: ScheduleId, mutate: F) -> bool
    where
        F: FnOnce(&mut ScheduleDefinition),
    {
        match self.schedules.get_mut(&id) {
            Some(mut entry) => {
                mutate(&mut entry);
                true
            }
            None => false,
        }
    }

    pub fn remove_schedule(&self, id: ScheduleId) -> bool {
        self.schedules.remove(&id).is_some()
    }

    pub fn get_schedule(&self, id: ScheduleId) -> Option<ScheduleDefinition> {
        self.schedules.get(&id).map(|e| e.clone())
    }

    pub fn get_all_schedules(&self) -> Vec<ScheduleDefinition> {
        self.schedules.iter().map(|e| e.value().clone()).collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let schedule_count = self.schedules.len() as u64;
        let enabled_count = self.schedules.iter().filter(|e| e.enabled).count() as u64;
        SchedulerStats {
            schedule_count,
            enabled_count,
        }
    }

    /// Forced immediate enqueue without touching `nextRun` (spec §4.3
    /// `triggerSchedule`). Refuses while the schedule's own `cooldown`
    /// (spec §3) hasn't elapsed since the last forced trigger.
    pub async fn trigger_schedule(&self, id: ScheduleId) -> Option<JobId> {
        let now = Utc::now();
        let definition = self.schedules.get(&id).map(|e| e.clone())?;
        if definition.in_cooldown(now) {
            return None;
        }
        let job_id = self.enqueue_from(&definition).await.ok()?;
        if let Some(mut entry) = self.schedules.get_mut(&id) {
            entry.last_triggered = Some(now);
        }
        Some(job_id)
    }

    async fn enqueue_from(&self, definition: &ScheduleDefinition) -> anyhow::Result<JobId> {
        let mut options = CreateJobOptions::new(definition.job_type.clone(), "scheduler")
            .with_priority(definition.priority)
            .with_params(definition.params.clone());
        if let Some(max_retries) = definition.max_retries {
            options = options.with_max_retries(max_retries);
        }
        let job = self
            .queue
            .create_job(options)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(job.id)
    }

    /// Every `checkIntervalMs`: for each enabled schedule whose `nextRun <=
    /// now`, enqueue a job, set `lastRun`, and advance `nextRun`. On
    /// creation failure, leave `lastRun` untouched and emit
    /// `schedule_error` (spec §4.3).
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let interval = Duration::from_millis(this.config.check_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.tick().await;
            }
        });
        *self.loop_handle.lock().expect("loop handle lock poisoned") = Some(handle);
    }

    async fn tick(&self) {
        let now = Utc::now();
        let due: Vec<ScheduleDefinition> = self
            .schedules
            .iter()
            .filter(|e| e.enabled && e.next_run <= now)
            .map(|e| e.value().clone())
            .collect();

        for definition in due {
            match self.enqueue_from(&definition).await {
                Ok(job_id) => {
                    let next_run = definition.advance.next_after(now);
                    if let Some(mut entry) = self.schedules.get_mut(&definition.id) {
                        entry.last_run = Some(now);
                        entry.next_run = next_run;
                    }
                    self.events.emit(SchedulerEvent::JobEnqueued {
                        schedule_id: definition.id,
                        job_id,
                    });
                }
                Err(err) => {
                    self.events.emit(SchedulerEvent::ScheduleError {
                        schedule_id: definition.id,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.lock().expect("loop handle lock poisoned").take() {
            handle.abort();
        }
    }
}
