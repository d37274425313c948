use crate::alert::{AlertCondition, AlertRule};
use crate::config::{MonitorConfig, RetryConfig};
use crate::events::MonitorEvent;
use crate::job::{CreateJobOptions, JobType, JobUpdate};
use crate::monitor::Monitor;
use crate::queue::Queue;
use std::sync::Arc;
use std::time::Duration;
use taskflow_testing::InMemoryJobStore;

fn new_queue() -> Arc<Queue> {
    Arc::new(Queue::new(Arc::new(InMemoryJobStore::new()), RetryConfig::default()))
}

fn fast_monitor_config() -> MonitorConfig {
    MonitorConfig {
        monitor_interval_ms: 20,
        alert_check_interval_ms: 20,
        history_capacity: 100,
        failure_rate_window_minutes: 60,
    }
}

#[tokio::test]
async fn queue_length_rule_triggers_once_threshold_is_crossed() {
    let queue = new_queue();
    let monitor = Monitor::new(Arc::clone(&queue), fast_monitor_config());
    let mut events = monitor.events().subscribe();
    monitor.add_rule(AlertRule::new("backlog", AlertCondition::QueueLength, 0.0).with_cooldown(30));

    queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();

    monitor.start();
    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await.unwrap() {
                MonitorEvent::AlertTriggered { alert } => return alert,
                _ => continue,
            }
        }
    })
    .await
    .expect("queue length alert never triggered");
    monitor.stop();

    assert_eq!(event.message.contains("QueueLength"), true);
    assert_eq!(monitor.active_alerts().len(), 1);
}

#[tokio::test]
async fn rule_in_cooldown_does_not_retrigger() {
    let queue = new_queue();
    let monitor = Monitor::new(Arc::clone(&queue), fast_monitor_config());
    let rule_id = monitor.add_rule(AlertRule::new("backlog", AlertCondition::QueueLength, 0.0).with_cooldown(30));

    queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();

    monitor.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    monitor.stop();

    // Several evaluation ticks ran while the backlog condition stayed true;
    // the 30-minute cooldown must have kept it to a single trigger.
    assert_eq!(monitor.active_alerts().len(), 1);
    let rule = monitor.get_rule(rule_id).unwrap();
    assert!(rule.last_triggered.is_some());
}

#[tokio::test]
async fn worker_down_and_stuck_jobs_are_critical_severity() {
    let queue = new_queue();
    let monitor = Monitor::new(Arc::clone(&queue), fast_monitor_config());
    let mut events = monitor.events().subscribe();
    monitor.add_rule(AlertRule::new("no workers", AlertCondition::WorkerDown, 1.0).with_cooldown(30));

    monitor.start();
    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await.unwrap() {
                MonitorEvent::AlertTriggered { alert } => return alert,
                _ => continue,
            }
        }
    })
    .await
    .expect("worker-down alert never triggered");
    monitor.stop();

    assert_eq!(event.severity, crate::alert::AlertSeverity::Critical);
}

#[tokio::test]
async fn acknowledge_and_resolve_alert() {
    let queue = new_queue();
    let monitor = Monitor::new(Arc::clone(&queue), fast_monitor_config());
    monitor.add_rule(AlertRule::new("backlog", AlertCondition::QueueLength, 0.0).with_cooldown(30));

    queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();

    monitor.start();
    tokio::time::timeout(Duration::from_secs(2), async {
        while monitor.active_alerts().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("alert never appeared");
    monitor.stop();

    let alert = monitor.active_alerts().into_iter().next().unwrap();
    assert!(monitor.acknowledge_alert(alert.id, "oncall"));
    assert!(monitor.active_alerts()[0].acknowledged.is_some());
    assert!(monitor.resolve_alert(alert.id));
    assert!(monitor.active_alerts().is_empty());
}

#[tokio::test]
async fn health_report_flags_stuck_running_jobs_as_an_error() {
    let queue = new_queue();
    let monitor = Monitor::new(Arc::clone(&queue), fast_monitor_config());

    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();
    queue.get_next_job().await.unwrap();
    // Backdate startedAt so the job reads as stuck (running >5 minutes).
    queue
        .update_job(
            job.id,
            JobUpdate {
                started_at: Some(Some(chrono::Utc::now() - chrono::Duration::minutes(10))),
                ..Default::default()
            },
        )
        .await;

    let report = monitor.health_report();
    assert!(!report.healthy);
    assert!(report.errors.iter().any(|e| e.contains("stuck")));
}

#[tokio::test]
async fn health_report_is_healthy_with_no_problems() {
    let queue = new_queue();
    let monitor = Monitor::new(Arc::clone(&queue), fast_monitor_config());
    let report = monitor.health_report();
    assert!(report.healthy);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn health_report_warns_on_low_success_rate() {
    let queue = new_queue();
    let monitor = Monitor::new(Arc::clone(&queue), fast_monitor_config());

    for _ in 0..2 {
        let job = queue
            .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
            .await
            .unwrap();
        queue.get_next_job().await.unwrap();
        queue.fail_job(job.id, "boom".to_string(), true).await;
    }

    let report = monitor.health_report();
    assert!(report.warnings.iter().any(|w| w.contains("success rate")));
}
