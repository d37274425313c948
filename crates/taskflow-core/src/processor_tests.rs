use crate::config::{ProcessorConfig, RetryConfig};
use crate::job::{CreateJobOptions, JobStatus, JobType};
use crate::processor::Processor;
use crate::queue::Queue;
use std::sync::Arc;
use std::time::Duration;
use taskflow_testing::{AlwaysFailsHandler, CountingSuccessHandler, InMemoryJobStore};

fn fast_processor_config() -> ProcessorConfig {
    ProcessorConfig {
        max_concurrent_jobs: 5,
        dispatch_interval_ms: 10,
        job_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(1),
        retry: RetryConfig {
            retry_delay_ms: 10,
            backoff_factor: 2.0,
            max_retry_delay_ms: 1_000,
        },
    }
}

#[tokio::test(start_paused = true)]
async fn dispatch_loop_runs_a_registered_handler_to_completion() {
    let queue = Arc::new(Queue::new(Arc::new(InMemoryJobStore::new()), RetryConfig::default()));
    let processor = Processor::new(Arc::clone(&queue), fast_processor_config());
    let handler = Arc::new(CountingSuccessHandler::new());
    processor.register_handler(JobType::Digest, handler.clone());
    processor.start_processing();

    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_millis(50)).await;
    tokio::task::yield_now().await;

    assert_eq!(handler.call_count(), 1);
    assert_eq!(queue.get_job(job.id).unwrap().status, JobStatus::Completed);

    processor.stop_processing();
}

#[tokio::test(start_paused = true)]
async fn job_without_a_registered_handler_fails_terminally() {
    let queue = Arc::new(Queue::new(Arc::new(InMemoryJobStore::new()), RetryConfig::default()));
    let processor = Processor::new(Arc::clone(&queue), fast_processor_config());
    processor.start_processing();

    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester"))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_millis(50)).await;
    tokio::task::yield_now().await;

    let snapshot = queue.get_job(job.id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);

    processor.stop_processing();
}

// Retry backoff gates re-dispatch on a real `chrono::Utc::now()` comparison
// (schedule_time is a wall-clock timestamp, persisted as such), not on
// tokio's mockable timer — so this test uses real time with a tiny backoff
// rather than `start_paused`, and polls for the terminal state.
#[tokio::test]
async fn failing_handler_is_retried_until_exhaustion_then_fails_terminally() {
    let queue = Arc::new(Queue::new(Arc::new(InMemoryJobStore::new()), RetryConfig::default()));
    let processor = Processor::new(Arc::clone(&queue), fast_processor_config());
    processor.register_handler(JobType::Digest, Arc::new(AlwaysFailsHandler::new("nope")));
    processor.start_processing();

    let job = queue
        .create_job(CreateJobOptions::new(JobType::Digest, "tester").with_max_retries(2))
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(snapshot) = queue.get_job(job.id) {
                if snapshot.status == JobStatus::Failed && snapshot.retry_count >= snapshot.max_retries {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not reach terminal failure within timeout");

    assert_eq!(outcome.retry_count, 2);

    processor.stop_processing();
}

#[tokio::test]
async fn has_handler_reflects_registration() {
    let queue = Arc::new(Queue::new(Arc::new(InMemoryJobStore::new()), RetryConfig::default()));
    let processor = Processor::new(queue, fast_processor_config());
    assert!(!processor.has_handler(&JobType::Digest));
    processor.register_handler(JobType::Digest, Arc::new(CountingSuccessHandler::new()));
    assert!(processor.has_handler(&JobType::Digest));
}
