//! Metrics collection and rule-driven alerting (spec §4.5).

use crate::alert::{AckInfo, ActiveAlert, AlertCondition, AlertNotification, AlertRule, AlertSeverity};
use crate::config::MonitorConfig;
use crate::events::{EventBus, MonitorEvent, QueueEvent};
use crate::ids::ActiveAlertId;
use crate::metrics::{HealthReport, MetricsSnapshot};
use crate::queue::Queue;
use crate::worker_pool::WorkerPoolManager;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// A single Completed/Failed transition observed off the Queue's event
/// stream, kept only long enough to compute the windowed failure rate
/// (spec §4.5, resolving spec.md §9 Open Question (c) in favor of a window
/// rather than the Queue's all-time `successRate`).
struct Outcome {
    at: DateTime<Utc>,
    succeeded: bool,
}

pub struct Monitor {
    queue: Arc<Queue>,
    workers: Option<Arc<WorkerPoolManager>>,
    config: MonitorConfig,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    rules: DashMap<crate::ids::AlertRuleId, AlertRule>,
    active: DashMap<ActiveAlertId, ActiveAlert>,
    outcomes: Mutex<VecDeque<Outcome>>,
    events: EventBus<MonitorEvent>,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(queue: Arc<Queue>, config: MonitorConfig) -> Arc<Self> {
        Self::new_inner(queue, config, None)
    }

    /// Wires the Worker Pool Manager in so `activeWorkers`/`worker_down`
    /// reflect live worker health (spec §4.5 "overwrite activeWorkers with
    /// the live count of healthy workers").
    pub fn with_worker_pool(queue: Arc<Queue>, config: MonitorConfig, workers: Arc<WorkerPoolManager>) -> Arc<Self> {
        Self::new_inner(queue, config, Some(workers))
    }

    fn new_inner(queue: Arc<Queue>, config: MonitorConfig, workers: Option<Arc<WorkerPoolManager>>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            workers,
            config,
            history: Mutex::new(VecDeque::new()),
            rules: DashMap::new(),
            active: DashMap::new(),
            outcomes: Mutex::new(VecDeque::new()),
            events: EventBus::new(),
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> EventBus<MonitorEvent> {
        self.events.clone()
    }

    pub fn add_rule(&self, rule: AlertRule) -> crate::ids::AlertRuleId {
        let id = rule.id;
        self.rules.insert(id, rule);
        id
    }

    pub fn remove_rule(&self, id: crate::ids::AlertRuleId) -> bool {
        self.rules.remove(&id).is_some()
    }

    pub fn get_rule(&self, id: crate::ids::AlertRuleId) -> Option<AlertRule> {
        self.rules.get(&id).map(|r| r.clone())
    }

    pub fn history(&self) -> Vec<MetricsSnapshot> {
        self.history.lock().expect("history lock poisoned").iter().cloned().collect()
    }

    pub fn active_alerts(&self) -> Vec<ActiveAlert> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    pub fn acknowledge_alert(&self, id: ActiveAlertId, by: impl Into<String>) -> bool {
        match self.active.get_mut(&id) {
            Some(mut alert) => {
                alert.acknowledged = Some(AckInfo {
                    at: Utc::now(),
                    by: by.into(),
                });
                true
            }
            None => false,
        }
    }

    /// Stamps the resolution timestamp then removes the alert from the
    /// active table (spec §4.5 "Operator operations").
    pub fn resolve_alert(&self, id: ActiveAlertId) -> bool {
        if let Some(mut alert) = self.active.get_mut(&id) {
            alert.resolved = Some(Utc::now());
        } else {
            return false;
        }
        self.active.remove(&id);
        true
    }

    /// Starts the metrics-collection timer, the alert-evaluation timer, and
    /// a background subscriber that folds Queue `Completed`/`Failed` events
    /// into the windowed failure-rate tracker.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut handles = self.handles.lock().expect("handles lock poisoned");
        handles.push(self.spawn_metrics_loop());
        handles.push(self.spawn_alert_loop());
        handles.push(self.spawn_outcome_tracker());
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles.lock().expect("handles lock poisoned").drain(..) {
            handle.abort();
        }
    }

    fn spawn_outcome_tracker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut rx = this.queue.events().subscribe();
        tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Ok(QueueEvent::Completed { at, .. }) => this.record_outcome(at, true),
                    Ok(QueueEvent::Failed { final_failure: true, at, .. }) => this.record_outcome(at, false),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn record_outcome(&self, at: DateTime<Utc>, succeeded: bool) {
        let window = chrono::Duration::minutes(self.config.failure_rate_window_minutes as i64);
        let cutoff = at - window;
        let mut outcomes = self.outcomes.lock().expect("outcomes lock poisoned");
        outcomes.push_back(Outcome { at, succeeded });
        while outcomes.front().map(|o| o.at < cutoff).unwrap_or(false) {
            outcomes.pop_front();
        }
    }

    /// `100 - (100 * succeeded / total)` over the window, or `0` when no
    /// outcomes have been observed yet (no evidence of failure).
    fn windowed_failed_rate(&self) -> f64 {
        let window = chrono::Duration::minutes(self.config.failure_rate_window_minutes as i64);
        let cutoff = Utc::now() - window;
        let outcomes = self.outcomes.lock().expect("outcomes lock poisoned");
        let relevant: Vec<&Outcome> = outcomes.iter().filter(|o| o.at >= cutoff).collect();
        if relevant.is_empty() {
            return 0.0;
        }
        let succeeded = relevant.iter().filter(|o| o.succeeded).count();
        100.0 - (succeeded as f64 / relevant.len() as f64) * 100.0
    }

    fn healthy_worker_count(&self) -> u64 {
        self.workers
            .as_ref()
            .map(|w| w.healthy_worker_count() as u64)
            .unwrap_or(0)
    }

    fn spawn_metrics_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let interval = std::time::Duration::from_millis(this.config.monitor_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.collect_metrics();
            }
        })
    }

    fn collect_metrics(&self) {
        let mut metrics = self.queue.get_metrics();
        metrics.active_workers = self.healthy_worker_count();
        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            metrics,
        };

        {
            let mut history = self.history.lock().expect("history lock poisoned");
            if history.len() >= self.config.history_capacity {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }

        self.events.emit(MonitorEvent::MetricsCollected { metrics: snapshot.metrics });
    }

    fn spawn_alert_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let interval = std::time::Duration::from_millis(this.config.alert_check_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.evaluate_alerts();
            }
        })
    }

    fn evaluate_alerts(&self) {
        let now = Utc::now();
        let metrics = self.queue.get_metrics();
        let rule_ids: Vec<crate::ids::AlertRuleId> = self.rules.iter().map(|e| *e.key()).collect();

        for id in rule_ids {
            let Some(mut rule) = self.rules.get_mut(&id) else { continue };
            if !rule.enabled || rule.in_cooldown(now) {
                continue;
            }

            let should_trigger = match rule.condition {
                AlertCondition::QueueLength => metrics.queue_length as f64 > rule.threshold,
                AlertCondition::FailureRate => self.windowed_failed_rate() > rule.threshold,
                AlertCondition::ProcessingTime => metrics.average_processing_time_ms > rule.threshold,
                AlertCondition::StuckJobs => self.stuck_job_count(rule.duration_minutes) > 0,
                AlertCondition::WorkerDown => (self.healthy_worker_count() as f64) < rule.threshold,
            };

            if !should_trigger {
                continue;
            }

            let severity = match rule.condition {
                AlertCondition::WorkerDown | AlertCondition::StuckJobs => AlertSeverity::Critical,
                AlertCondition::FailureRate if rule.threshold > 50.0 => AlertSeverity::Error,
                _ => AlertSeverity::Warning,
            };

            let alert = ActiveAlert {
                id: ActiveAlertId::new(),
                rule_id: id,
                message: format!("{:?} breached threshold {}", rule.condition, rule.threshold),
                severity,
                triggered_at: now,
                acknowledged: None,
                resolved: None,
                metadata: serde_json::Map::new(),
            };

            rule.last_triggered = Some(now);
            self.active.insert(alert.id, alert.clone());
            self.events.emit(MonitorEvent::AlertTriggered { alert: alert.clone() });

            for recipient in &rule.recipients {
                tracing::info!(
                    recipient,
                    rule = %rule.name,
                    alert_id = %alert.id,
                    "alert notification"
                );
                let notification = AlertNotification {
                    recipient: recipient.clone(),
                    alert: alert.clone(),
                };
                self.events.emit(MonitorEvent::NotificationSent { notification });
            }
        }
    }

    fn stuck_job_count(&self, threshold_minutes: u32) -> u64 {
        let cutoff = Utc::now() - chrono::Duration::minutes(threshold_minutes as i64);
        self.queue
            .query_jobs(|job| {
                job.status == crate::job::JobStatus::Running
                    && job.started_at.map(|s| s < cutoff).unwrap_or(false)
            })
            .len() as u64
    }

    /// Warnings at `queueLength > 1000`, `failedJobs > 100`, or
    /// `successRate < 90`; errors when stuck jobs exist or any worker is
    /// unhealthy; `healthy` iff `errors` is empty (spec §4.5).
    pub fn health_report(&self) -> HealthReport {
        let metrics = self.queue.get_metrics();
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if metrics.queue_length > 1000 {
            warnings.push(format!("queue length {} exceeds 1000", metrics.queue_length));
        }
        if metrics.failed_jobs > 100 {
            warnings.push(format!("{} failed jobs", metrics.failed_jobs));
        }
        if metrics.success_rate < 90.0 {
            warnings.push(format!("success rate {:.1}% below 90%", metrics.success_rate));
        }

        let stuck = self.stuck_job_count(5);
        if stuck > 0 {
            errors.push(format!("{stuck} stuck job(s)"));
        }

        let worker_status = self.workers.as_ref().map(|w| w.all_statuses()).unwrap_or_default();
        let unhealthy: Vec<&str> = worker_status
            .iter()
            .filter(|w| !w.healthy)
            .map(|_| "worker unhealthy")
            .collect();
        errors.extend(unhealthy.into_iter().map(String::from));

        let oldest_pending = self
            .queue
            .query_jobs(|job| {
                matches!(
                    job.status,
                    crate::job::JobStatus::Pending | crate::job::JobStatus::Queued | crate::job::JobStatus::Retrying
                )
            })
            .into_iter()
            .map(|j| j.created_at)
            .min();

        let last_processed = self
            .queue
            .query_jobs(|job| job.finished_at.is_some())
            .into_iter()
            .filter_map(|j| j.finished_at)
            .max();

        HealthReport {
            healthy: errors.is_empty(),
            queue_length: metrics.queue_length,
            active_jobs: metrics.running_jobs,
            failed_jobs: metrics.failed_jobs,
            oldest_pending_job: oldest_pending,
            worker_status,
            last_processed_job: last_processed,
            errors,
            warnings,
        }
    }
}
