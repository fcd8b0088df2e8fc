use relayq_jobs::{
    EnqueueRequest, InMemoryProvider, JobStatus, ManualClock, Payload, QueueHandle, Reaper,
    SweepReport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INTERVAL: Duration = Duration::from_secs(60);
const RETENTION: Duration = Duration::from_secs(3600);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("relayq_jobs=debug")
        .try_init();
}

fn setup() -> (QueueHandle, ManualClock) {
    init_tracing();
    let clock = ManualClock::starting_now();
    let provider = InMemoryProvider::new().with_clock(Arc::new(clock.clone()));
    (QueueHandle::new(provider), clock)
}

#[tokio::test]
async fn test_sweep_reclaims_and_evicts() {
    let (queue, clock) = setup();
    let done = queue.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    queue.reserve("w1", None).await.unwrap();
    queue.complete(&done.id, "w1", Payload::new()).await.unwrap();

    let stuck = queue.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    queue.reserve("w2", None).await.unwrap();

    clock.advance(RETENTION + Duration::from_secs(1));
    let reaper = Reaper::new(queue.clone(), INTERVAL, RETENTION);
    let report = reaper.sweep().await.unwrap();

    assert_eq!(report, SweepReport { reclaimed: 1, evicted: 1 });
    assert!(queue.get_job(&done.id).await.unwrap().is_none());
    let stuck = queue.get_job(&stuck.id).await.unwrap().unwrap();
    assert_eq!(stuck.status, JobStatus::Queued);

    let rendered = queue.metrics().render();
    assert!(rendered.contains("relayq_leases_reclaimed_total 1"));
    assert!(rendered.contains("relayq_jobs_evicted_total 1"));
}

#[tokio::test]
async fn test_sweep_on_quiet_queue_is_empty() {
    let (queue, _clock) = setup();
    queue.enqueue(EnqueueRequest::new("preview")).await.unwrap();

    let report = Reaper::new(queue, INTERVAL, RETENTION).sweep().await.unwrap();
    assert_eq!(report, SweepReport::default());
}

#[tokio::test(start_paused = true)]
async fn test_first_sweep_waits_one_interval() {
    let (queue, clock) = setup();
    let job = queue.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    queue.reserve("w1", None).await.unwrap();
    clock.advance(Duration::from_secs(31));

    let cancel = CancellationToken::new();
    let handle = Reaper::new(queue.clone(), INTERVAL, RETENTION).spawn(cancel.clone());

    tokio::time::sleep(INTERVAL / 2).await;
    let job_now = queue.provider().get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job_now.status, JobStatus::Processing);

    tokio::time::sleep(INTERVAL).await;
    let job_now = queue.provider().get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job_now.status, JobStatus::Queued);
    assert_eq!(job_now.attempts, 1);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_reaper() {
    let (queue, _clock) = setup();
    let cancel = CancellationToken::new();
    let handle = Reaper::new(queue, INTERVAL, RETENTION).spawn(cancel.clone());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("reaper should stop promptly")
        .unwrap();
}
