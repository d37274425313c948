use crate::config::RetryConfig;
use crate::job::{CreateJobOptions, JobStatus, JobType, JobUpdate};
use crate::queue::Queue;
use std::collections::HashSet;
use std::sync::Arc;
use taskflow_testing::{AlwaysResolves, InMemoryJobStore, NeverResolves};

fn new_queue() -> Arc<Queue> {
    Arc::new(Queue::new(Arc::new(InMemoryJobStore::new()), RetryConfig::default()))
}

#[tokio::test]
async fn create_job_lands_in_queued_bucket_and_is_dispatched_first() {
    let queue = new_queue();
    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let dispatched = queue.get_next_job().await.unwrap();
    assert_eq!(dispatched.id, job.id);
    assert_eq!(dispatched.status, JobStatus::Running);
}

#[tokio::test]
async fn higher_priority_job_dispatches_before_lower_priority() {
    let queue = new_queue();
    let low = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester").with_priority(1))
        .await
        .unwrap();
    let high = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester").with_priority(10))
        .await
        .unwrap();

    let first = queue.get_next_job().await.unwrap();
    assert_eq!(first.id, high.id);
    let second = queue.get_next_job().await.unwrap();
    assert_eq!(second.id, low.id);
}

#[tokio::test]
async fn job_with_missing_dependency_is_rejected_at_creation() {
    let queue = new_queue();
    let mut deps = HashSet::new();
    deps.insert(crate::ids::JobId::new());
    let result = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester").with_dependencies(deps))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn job_with_unresolved_dependency_is_not_dispatched_until_dependency_completes() {
    let queue = new_queue();
    let dependency = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();

    let mut deps = HashSet::new();
    deps.insert(dependency.id);
    let dependent = queue
        .create_job(CreateJobOptions::new(JobType::Notification, "tester").with_dependencies(deps))
        .await
        .unwrap();

    // Only the dependency is ready; the dependent must not be handed out yet.
    let first = queue.get_next_job().await.unwrap();
    assert_eq!(first.id, dependency.id);
    assert!(queue.get_next_job().await.is_none());

    queue
        .update_job(dependency.id, JobUpdate::status(JobStatus::Completed))
        .await;

    let second = queue.get_next_job().await.unwrap();
    assert_eq!(second.id, dependent.id);
}

#[tokio::test]
async fn unresolvable_digest_id_is_stored_as_null_without_blocking_creation() {
    let queue = Queue::new(Arc::new(InMemoryJobStore::new()), RetryConfig::default())
        .with_foreign_key_resolver(Arc::new(NeverResolves));
    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester").with_digest_id("missing-digest"))
        .await
        .unwrap();
    assert_eq!(job.digest_id, None);
}

#[tokio::test]
async fn resolvable_digest_id_is_kept() {
    let queue = Queue::new(Arc::new(InMemoryJobStore::new()), RetryConfig::default())
        .with_foreign_key_resolver(Arc::new(AlwaysResolves));
    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester").with_digest_id("real-digest"))
        .await
        .unwrap();
    assert_eq!(job.digest_id.as_deref(), Some("real-digest"));
}

#[tokio::test]
async fn retry_job_requeues_with_backoff_schedule_time() {
    let queue = new_queue();
    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();
    queue.get_next_job().await.unwrap();
    queue.fail_job(job.id, "boom".to_string(), false).await;

    let retried = queue.retry_job(job.id).await;
    assert!(retried);

    let snapshot = queue.get_job(job.id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Pending);
    assert!(snapshot.schedule_time.unwrap() > chrono::Utc::now());
}

#[tokio::test]
async fn retry_job_refuses_once_retries_are_exhausted() {
    let queue = new_queue();
    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester").with_max_retries(0))
        .await
        .unwrap();
    queue.get_next_job().await.unwrap();
    queue.fail_job(job.id, "boom".to_string(), true).await;

    assert!(!queue.retry_job(job.id).await);
}

#[tokio::test]
async fn cancel_job_is_terminal_and_idempotent() {
    let queue = new_queue();
    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();

    assert!(queue.cancel_job(job.id).await);
    assert!(!queue.cancel_job(job.id).await);
    assert_eq!(queue.get_job(job.id).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn get_next_job_for_skips_jobs_outside_the_allowed_type_set() {
    let queue = new_queue();
    let digest = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();
    let notification = queue
        .create_job(CreateJobOptions::new(JobType::Notification, "tester"))
        .await
        .unwrap();

    let dispatched = queue.get_next_job_for(Some(&[JobType::Notification])).await.unwrap();
    assert_eq!(dispatched.id, notification.id);

    // Digest is still pending behind the filter; asking for any type now returns it.
    let remaining = queue.get_next_job().await.unwrap();
    assert_eq!(remaining.id, digest.id);
}

#[tokio::test]
async fn scheduled_job_is_not_dispatched_before_its_schedule_time() {
    let queue = new_queue();
    let future = chrono::Utc::now() + chrono::Duration::hours(1);
    queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester").with_schedule_time(future))
        .await
        .unwrap();

    assert!(queue.get_next_job().await.is_none());
}

#[tokio::test]
async fn metrics_reflect_bucket_counts() {
    let queue = new_queue();
    queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();
    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();
    queue.get_next_job().await.unwrap();
    queue
        .update_job(job.id, JobUpdate::status(JobStatus::Completed))
        .await;

    let metrics = queue.get_metrics();
    assert_eq!(metrics.total_jobs, 2);
    assert_eq!(metrics.completed_jobs, 1);
    assert_eq!(metrics.pending_jobs, 1);
}
