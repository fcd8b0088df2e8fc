use async_trait::async_trait;
use relayq_core::ErrorCode;
use relayq_jobs::{
    EnqueueRequest, InMemoryProvider, Job, JobError, JobStatus, ManualClock, Outcome, Payload,
    Processor, Progress, QueueHandle, RetryPolicy, SimulatedProcessor, Worker, WorkerConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn queue_with_clock() -> (QueueHandle, ManualClock) {
    let clock = ManualClock::starting_now();
    let provider = InMemoryProvider::new().with_clock(Arc::new(clock.clone()));
    (QueueHandle::new(provider), clock)
}

fn worker(queue: &QueueHandle, processor: impl Processor + 'static) -> Worker {
    let config = WorkerConfig::new("worker-1")
        .poll_interval(Duration::from_millis(10))
        .heartbeat_interval(Duration::from_millis(10));
    Worker::new(queue.clone(), Arc::new(processor), config)
}

fn quick() -> SimulatedProcessor {
    SimulatedProcessor::new(7).with_steps(2, Duration::from_millis(5))
}

struct Failing(JobError);

#[async_trait]
impl Processor for Failing {
    async fn process(&self, _job: &Job, _progress: &Progress) -> Result<Payload, JobError> {
        Err(self.0.clone())
    }
}

/// Sets progress, waits across several heartbeats, then reports what the
/// queue saw.
struct Observing(QueueHandle);

#[async_trait]
impl Processor for Observing {
    async fn process(&self, job: &Job, progress: &Progress) -> Result<Payload, JobError> {
        progress.set(40);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = self
            .0
            .get_job(&job.id)
            .await
            .ok()
            .flatten()
            .map_or(0, |job| job.progress);
        let result = json!({ "seen_progress": seen });
        Ok(result.as_object().cloned().unwrap_or_default())
    }
}

/// Stalls long enough for the lease to lapse on the manual clock.
struct Stalling(ManualClock);

#[async_trait]
impl Processor for Stalling {
    async fn process(&self, _job: &Job, _progress: &Progress) -> Result<Payload, JobError> {
        self.0.advance(Duration::from_secs(31));
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(Payload::new())
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_when_queue_is_empty() {
    let (queue, _clock) = queue_with_clock();
    let outcome = worker(&queue, quick()).run_once().await.unwrap();
    assert_eq!(outcome, Outcome::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_completes_job() {
    let (queue, _clock) = queue_with_clock();
    let job = queue.enqueue(EnqueueRequest::new("preview")).await.unwrap();

    let Outcome::Completed(done) = worker(&queue, quick()).run_once().await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(done.id, job.id);
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.result.unwrap()["type"], "preview");
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_is_rescheduled() {
    let (queue, _clock) = queue_with_clock();
    queue
        .enqueue(EnqueueRequest::new("preview").retry_policy(RetryPolicy::new(3)))
        .await
        .unwrap();

    let processor = Failing(JobError::from_code(ErrorCode::ServiceUnavailable, "down"));
    let Outcome::Retrying(job) = worker(&queue, processor).run_once().await.unwrap() else {
        panic!("expected retry");
    };
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.next_attempt_at.is_some());
    assert_eq!(job.last_error.unwrap().code, "SERVICE_UNAVAILABLE");
}

#[tokio::test(start_paused = true)]
async fn test_policy_block_fails_job() {
    let (queue, _clock) = queue_with_clock();
    queue
        .enqueue(EnqueueRequest::new("preview").retry_policy(RetryPolicy::new(3)))
        .await
        .unwrap();

    let processor = Failing(JobError::from_code(ErrorCode::ProviderPolicyBlocked, "flagged"));
    let Outcome::Failed(job) = worker(&queue, processor).run_once().await.unwrap() else {
        panic!("expected failure");
    };
    assert_eq!(job.error.unwrap().code, "PROVIDER_POLICY_BLOCKED");
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_report_progress() {
    let (queue, _clock) = queue_with_clock();
    queue.enqueue(EnqueueRequest::new("preview")).await.unwrap();

    let processor = Observing(queue.clone());
    let Outcome::Completed(job) = worker(&queue, processor).run_once().await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(job.result.unwrap()["seen_progress"], 40);
}

#[tokio::test(start_paused = true)]
async fn test_lost_lease_abandons_job() {
    let (queue, clock) = queue_with_clock();
    let job = queue.enqueue(EnqueueRequest::new("preview")).await.unwrap();

    let outcome = worker(&queue, Stalling(clock)).run_once().await.unwrap();
    assert_eq!(outcome, Outcome::Abandoned { job_id: job.id.clone() });

    let job = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.result.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_run_drains_queue_until_cancelled() {
    let (queue, _clock) = queue_with_clock();
    for _ in 0..3 {
        queue.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let running = {
        let worker = worker(&queue, quick());
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    for _ in 0..100 {
        if queue.get_stats().await.unwrap().completed == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    running.await.unwrap();

    let stats = queue.get_stats().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.queued, 0);
}
