use crate::config::{RetryConfig, SchedulerConfig};
use crate::events::SchedulerEvent;
use crate::job::JobType;
use crate::queue::Queue;
use crate::schedule::{FixedInterval, ScheduleDefinition};
use crate::scheduler::Scheduler;
use std::sync::Arc;
use std::time::Duration;
use taskflow_testing::InMemoryJobStore;

fn new_queue() -> Arc<Queue> {
    Arc::new(Queue::new(Arc::new(InMemoryJobStore::new()), RetryConfig::default()))
}

fn fast_scheduler(queue: Arc<Queue>) -> Arc<Scheduler> {
    Scheduler::new(queue, SchedulerConfig { check_interval_ms: 20 })
}

#[tokio::test]
async fn add_get_remove_schedule_round_trips() {
    let scheduler = fast_scheduler(new_queue());
    let definition = ScheduleDefinition::new(
        "hourly digest",
        JobType::Digest,
        Arc::new(FixedInterval(chrono::Duration::hours(1))),
        chrono::Utc::now(),
    );
    let id = scheduler.add_schedule(definition);

    assert!(scheduler.get_schedule(id).is_some());
    assert_eq!(scheduler.stats().schedule_count, 1);

    assert!(scheduler.remove_schedule(id));
    assert!(scheduler.get_schedule(id).is_none());
    assert!(!scheduler.remove_schedule(id));
}

#[tokio::test]
async fn trigger_schedule_enqueues_without_touching_next_run() {
    let queue = new_queue();
    let scheduler = fast_scheduler(Arc::clone(&queue));
    let starting_from = chrono::Utc::now() + chrono::Duration::hours(1);
    let definition = ScheduleDefinition::new(
        "hourly digest",
        JobType::Digest,
        Arc::new(FixedInterval(chrono::Duration::hours(1))),
        starting_from,
    );
    let next_run_before = definition.next_run;
    let id = scheduler.add_schedule(definition);

    let job_id = scheduler.trigger_schedule(id).await.expect("triggered job");
    assert!(queue.get_job(job_id).is_some());

    let after = scheduler.get_schedule(id).unwrap();
    assert_eq!(after.next_run, next_run_before);
    assert!(after.last_run.is_none());
}

#[tokio::test]
async fn tick_enqueues_due_schedule_and_advances_next_run() {
    let queue = new_queue();
    let scheduler = fast_scheduler(Arc::clone(&queue));
    let mut events = scheduler.events().subscribe();

    let advance = chrono::Duration::hours(1);
    let definition = ScheduleDefinition::new(
        "hourly digest",
        JobType::Digest,
        Arc::new(FixedInterval(advance)),
        chrono::Utc::now(),
    );
    let id = scheduler.add_schedule(definition);
    // Force the schedule due right away instead of waiting out the hour.
    scheduler.update_schedule(id, |def| def.next_run = chrono::Utc::now() - chrono::Duration::seconds(1));

    scheduler.start();
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("schedule tick did not fire in time")
        .expect("event channel closed");
    scheduler.stop();

    let SchedulerEvent::JobEnqueued { schedule_id, job_id } = event else {
        panic!("expected JobEnqueued, got {event:?}");
    };
    assert_eq!(schedule_id, id);
    assert!(queue.get_job(job_id).is_some());

    let after = scheduler.get_schedule(id).unwrap();
    assert!(after.last_run.is_some());
    assert!(after.next_run > chrono::Utc::now());
}

#[tokio::test]
async fn trigger_schedule_is_refused_within_its_own_cooldown() {
    let queue = new_queue();
    let scheduler = fast_scheduler(Arc::clone(&queue));
    let starting_from = chrono::Utc::now() + chrono::Duration::hours(1);
    let definition = ScheduleDefinition::new(
        "hourly digest",
        JobType::Digest,
        Arc::new(FixedInterval(chrono::Duration::hours(1))),
        starting_from,
    )
    .with_cooldown(chrono::Duration::minutes(30));
    let id = scheduler.add_schedule(definition);

    assert!(scheduler.trigger_schedule(id).await.is_some());
    assert!(scheduler.trigger_schedule(id).await.is_none());

    // Cooldown gates triggerSchedule specifically; it must not touch lastRun.
    let after = scheduler.get_schedule(id).unwrap();
    assert!(after.last_run.is_none());
}

#[tokio::test]
async fn disabled_schedule_is_never_ticked() {
    let queue = new_queue();
    let scheduler = fast_scheduler(Arc::clone(&queue));
    let mut definition = ScheduleDefinition::new(
        "disabled",
        JobType::Digest,
        Arc::new(FixedInterval(chrono::Duration::hours(1))),
        chrono::Utc::now() - chrono::Duration::hours(1),
    );
    definition.enabled = false;
    let id = scheduler.add_schedule(definition);

    scheduler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.stop();

    let after = scheduler.get_schedule(id).unwrap();
    assert!(after.last_run.is_none());
}
