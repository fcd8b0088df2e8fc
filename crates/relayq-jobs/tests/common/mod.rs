//! Behaviour every provider must share. Each scenario takes a fresh provider
//! and the manual clock that drives it.
#![allow(dead_code)]

use futures_util::future::join_all;
use relayq_core::ErrorCode;
use relayq_jobs::{
    BackoffStrategy, EnqueueRequest, JobError, JobPriority, JobStatus, ManualClock, Payload,
    ProviderConfig, QueueProvider, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;

/// Defaults, with a global quota high enough not to interfere.
pub fn config() -> ProviderConfig {
    ProviderConfig {
        rate_limit_per_minute: 1000,
        ..Default::default()
    }
}

/// One-second fixed backoff.
pub fn retrying(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts)
        .strategy(BackoffStrategy::Fixed)
        .initial_delay(Duration::from_secs(1))
}

fn flaky() -> JobError {
    JobError::new("UPSTREAM_TIMEOUT", "upstream timed out")
}

pub async fn at_most_one_owner<P: QueueProvider + 'static>(provider: Arc<P>) {
    provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();

    let handles = (0..16).map(|i| {
        let provider = provider.clone();
        tokio::spawn(async move { provider.reserve(&format!("w{i}"), None).await.unwrap() })
    });
    let reserved: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap())
        .collect();

    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].attempts, 1);
    assert_eq!(reserved[0].status, JobStatus::Processing);
}

/// Concurrent submissions under one idempotency key create a single job.
pub async fn one_job_per_idempotency_key<P: QueueProvider + 'static>(provider: Arc<P>) {
    let handles = (0..16).map(|i| {
        let provider = provider.clone();
        tokio::spawn(async move {
            provider
                .enqueue(
                    EnqueueRequest::new("preview")
                        .idempotency_key("burst-key")
                        .field("caller", i),
                )
                .await
                .unwrap()
        })
    });
    let jobs: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert!(jobs.iter().all(|job| job.id == jobs[0].id));
    assert_eq!(provider.get_stats().await.unwrap().total, 1);
    assert!(provider.reserve("w1", None).await.unwrap().is_some());
    assert!(provider.reserve("w2", None).await.unwrap().is_none());
}

pub async fn idempotent_enqueue<P: QueueProvider>(provider: &P, _clock: &ManualClock) {
    let first = provider
        .enqueue(EnqueueRequest::new("preview").idempotency_key("req-1:preview"))
        .await
        .unwrap();
    let second = provider
        .enqueue(
            EnqueueRequest::new("preview")
                .idempotency_key("req-1:preview")
                .field("ignored", true),
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert!(second.payload.is_empty());
    assert_eq!(provider.get_stats().await.unwrap().total, 1);
}

pub async fn finished_key_creates_new_job<P: QueueProvider>(provider: &P, _clock: &ManualClock) {
    let request = EnqueueRequest::new("preview").idempotency_key("done-key");
    let first = provider.enqueue(request.clone()).await.unwrap();
    provider.reserve("w1", None).await.unwrap().unwrap();
    provider.complete(&first.id, "w1", Payload::new()).await.unwrap();

    let second = provider.enqueue(request).await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.status, JobStatus::Queued);
}

pub async fn backoff_gate_then_reuse<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    let request = EnqueueRequest::new("preview")
        .idempotency_key("gate-key")
        .retry_policy(retrying(3));
    let job = provider.enqueue(request.clone()).await.unwrap();
    provider.reserve("w1", None).await.unwrap().unwrap();
    let failed = provider.fail(&job.id, "w1", flaky()).await.unwrap();
    assert_eq!(failed.status, JobStatus::Queued);
    assert_eq!(failed.last_error.as_ref().unwrap().retry_after, Some(1));
    assert!(failed.error.is_none());

    clock.advance(Duration::from_millis(500));
    let err = provider.enqueue(request.clone()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimited);
    assert_eq!(err.retry_after, Some(1));

    clock.advance(Duration::from_millis(600));
    let reused = provider.enqueue(request).await.unwrap();
    assert_eq!(reused.id, job.id);
    assert_eq!(reused.status, JobStatus::Queued);
}

pub async fn retry_waits_for_backoff<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    let job = provider
        .enqueue(EnqueueRequest::new("preview").retry_policy(retrying(3)))
        .await
        .unwrap();
    provider.reserve("w1", None).await.unwrap().unwrap();
    provider.fail(&job.id, "w1", flaky()).await.unwrap();

    assert!(provider.reserve("w1", None).await.unwrap().is_none());
    clock.advance(Duration::from_secs(1));
    let again = provider.reserve("w1", None).await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts, 2);
}

pub async fn priority_order<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    for (label, priority) in [
        ("low", JobPriority::Low),
        ("urgent-1", JobPriority::Urgent),
        ("normal", JobPriority::Normal),
        ("urgent-2", JobPriority::Urgent),
    ] {
        provider
            .enqueue(EnqueueRequest::new("preview").field("label", label).priority(priority))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(1));
    }

    let mut order = Vec::new();
    while let Some(job) = provider.reserve("w1", None).await.unwrap() {
        order.push(job.payload["label"].as_str().unwrap().to_string());
    }
    assert_eq!(order, vec!["urgent-1", "urgent-2", "normal", "low"]);
}

pub async fn exhaustion_is_terminal<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    let job = provider
        .enqueue(EnqueueRequest::new("preview").retry_policy(retrying(2)))
        .await
        .unwrap();

    provider.reserve("w1", None).await.unwrap().unwrap();
    let first = provider.fail(&job.id, "w1", flaky()).await.unwrap();
    assert_eq!(first.status, JobStatus::Queued);

    clock.advance(Duration::from_secs(1));
    provider.reserve("w1", None).await.unwrap().unwrap();
    let last = provider.fail(&job.id, "w1", flaky()).await.unwrap();
    assert_eq!(last.status, JobStatus::Failed);
    assert_eq!(last.attempts, 2);
    assert_eq!(last.error.as_ref().unwrap().code, "UPSTREAM_TIMEOUT");
    assert_eq!(last.error.as_ref().unwrap().retry_after, None);
    assert!(last.completed_at.is_some());

    clock.advance(Duration::from_secs(60));
    assert!(provider.reserve("w1", None).await.unwrap().is_none());
}

pub async fn unretryable_failures_are_terminal<P: QueueProvider>(provider: &P, _clock: &ManualClock) {
    let without_policy = provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    provider.reserve("w1", None).await.unwrap().unwrap();
    let failed = provider.fail(&without_policy.id, "w1", flaky()).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);

    let with_policy = provider
        .enqueue(EnqueueRequest::new("preview").retry_policy(retrying(5)))
        .await
        .unwrap();
    provider.reserve("w1", None).await.unwrap().unwrap();
    let blocked = JobError::from_code(ErrorCode::ProviderPolicyBlocked, "flagged");
    let failed = provider.fail(&with_policy.id, "w1", blocked).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
}

pub async fn ownership_is_enforced<P: QueueProvider>(provider: &P, _clock: &ManualClock) {
    let job = provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    provider.reserve("owner", None).await.unwrap().unwrap();

    let err = provider.heartbeat(&job.id, "intruder", Some(10)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Forbidden);
    let err = provider
        .complete(&job.id, "intruder", Payload::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Forbidden);
    let err = provider.fail(&job.id, "intruder", flaky()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = provider.heartbeat("job-missing", "owner", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceNotFound);

    provider.heartbeat(&job.id, "owner", Some(250)).await.unwrap();
    assert_eq!(provider.get_job(&job.id).await.unwrap().unwrap().progress, 100);
    provider.heartbeat(&job.id, "owner", Some(-3)).await.unwrap();
    assert_eq!(provider.get_job(&job.id).await.unwrap().unwrap().progress, 0);

    let done = provider.complete(&job.id, "owner", Payload::new()).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);

    let err = provider
        .complete(&job.id, "owner", Payload::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceNotFound);
}

pub async fn lease_reclaimed_after_timeout<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    let job = provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    provider.reserve("a", None).await.unwrap().unwrap();

    clock.advance(Duration::from_secs(31));
    let taken = provider.reserve("b", None).await.unwrap().unwrap();
    assert_eq!(taken.id, job.id);
    assert_eq!(taken.attempts, 2);

    let err = provider.complete(&job.id, "a", Payload::new()).await.unwrap_err();
    assert!(matches!(
        err.code,
        ErrorCode::Forbidden | ErrorCode::ResourceNotFound
    ));
    provider.complete(&job.id, "b", Payload::new()).await.unwrap();
}

pub async fn heartbeat_extends_lease<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    let job = provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    provider.reserve("a", None).await.unwrap().unwrap();

    clock.advance(Duration::from_secs(20));
    provider.heartbeat(&job.id, "a", Some(40)).await.unwrap();
    clock.advance(Duration::from_secs(20));

    assert!(provider.reserve("b", None).await.unwrap().is_none());
    assert_eq!(provider.reclaim_expired_leases().await.unwrap(), 0);
    provider.complete(&job.id, "a", Payload::new()).await.unwrap();
}

pub async fn expired_final_attempt_fails<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    let job = provider
        .enqueue(EnqueueRequest::new("preview").retry_policy(retrying(1)))
        .await
        .unwrap();
    provider.reserve("a", None).await.unwrap().unwrap();

    clock.advance(Duration::from_secs(31));
    assert_eq!(provider.reclaim_expired_leases().await.unwrap(), 1);
    let job = provider.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().code, relayq_jobs::LEASE_EXPIRED);
}

pub async fn concurrency_cap_and_type_filter<P: QueueProvider>(provider: &P, _clock: &ManualClock) {
    provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    let export = provider.enqueue(EnqueueRequest::new("export")).await.unwrap();

    let only_export = vec!["export".to_string()];
    let reserved = provider.reserve("w1", Some(&only_export)).await.unwrap().unwrap();
    assert_eq!(reserved.id, export.id);
    assert!(provider.reserve("w1", Some(&only_export)).await.unwrap().is_none());
    assert!(provider.reserve("w2", None).await.unwrap().is_none());
}

pub async fn queue_full_is_rate_limited<P: QueueProvider>(provider: &P, _clock: &ManualClock) {
    provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    let err = provider.enqueue(EnqueueRequest::new("preview")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimited);
    assert_eq!(err.retry_after, Some(60));
}

pub async fn request_quota_is_enforced<P: QueueProvider>(provider: &P, _clock: &ManualClock) {
    for _ in 0..2 {
        provider
            .enqueue(EnqueueRequest::new("preview").request_id("req-1"))
            .await
            .unwrap();
    }
    let err = provider
        .enqueue(EnqueueRequest::new("preview").request_id("req-1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimited);
    let wait = err.retry_after.unwrap();
    assert!((1..=60).contains(&wait));

    provider
        .enqueue(EnqueueRequest::new("preview").request_id("req-2"))
        .await
        .unwrap();
}

pub async fn global_quota_window_resets<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    for _ in 0..3 {
        provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    }
    let err = provider.enqueue(EnqueueRequest::new("preview")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimited);

    clock.advance(Duration::from_secs(61));
    provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();
}

pub async fn validation_rejects_before_state<P: QueueProvider>(provider: &P, _clock: &ManualClock) {
    let err = provider
        .enqueue(EnqueueRequest::new("  ").retry_policy(RetryPolicy::new(0)))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
    assert_eq!(err.violations.len(), 2);
    assert_eq!(provider.get_stats().await.unwrap().total, 0);
}

pub async fn clean_old_jobs_removes_terminal<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    let done = provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();
    provider.reserve("w1", None).await.unwrap().unwrap();
    provider.complete(&done.id, "w1", Payload::new()).await.unwrap();
    let waiting = provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();

    clock.advance(Duration::from_secs(30 * 60));
    assert_eq!(provider.clean_old_jobs(Duration::from_secs(3600)).await.unwrap(), 0);

    clock.advance(Duration::from_secs(31 * 60));
    assert_eq!(provider.clean_old_jobs(Duration::from_secs(3600)).await.unwrap(), 1);
    assert!(provider.get_job(&done.id).await.unwrap().is_none());
    assert!(provider.get_job(&waiting.id).await.unwrap().is_some());
}

/// Evicting an old job must not lift the backoff gate of a newer job that
/// shares its idempotency key.
pub async fn eviction_keeps_newer_backoff_gate<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    let old = provider
        .enqueue(EnqueueRequest::new("preview").idempotency_key("shared-key"))
        .await
        .unwrap();
    provider.reserve("w1", None).await.unwrap().unwrap();
    let failed = provider.fail(&old.id, "w1", flaky()).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);

    clock.advance(Duration::from_secs(10));
    let request = EnqueueRequest::new("preview")
        .idempotency_key("shared-key")
        .retry_policy(
            RetryPolicy::new(3)
                .strategy(BackoffStrategy::Fixed)
                .initial_delay(Duration::from_secs(5)),
        );
    let newer = provider.enqueue(request.clone()).await.unwrap();
    assert_ne!(newer.id, old.id);
    provider.reserve("w1", None).await.unwrap().unwrap();
    provider.fail(&newer.id, "w1", flaky()).await.unwrap();

    let err = provider.enqueue(request.clone()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimited);

    assert_eq!(provider.clean_old_jobs(Duration::from_secs(5)).await.unwrap(), 1);
    assert!(provider.get_job(&old.id).await.unwrap().is_none());
    let err = provider.enqueue(request.clone()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimited);
    assert_eq!(err.retry_after, Some(5));

    clock.advance(Duration::from_secs(5));
    let reused = provider.enqueue(request).await.unwrap();
    assert_eq!(reused.id, newer.id);
}

pub async fn request_jobs_are_indexed<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    let a = provider
        .enqueue(EnqueueRequest::new("preview").request_id("req-9"))
        .await
        .unwrap();
    clock.advance(Duration::from_millis(5));
    let b = provider
        .enqueue(EnqueueRequest::new("export").request_id("req-9"))
        .await
        .unwrap();
    provider.enqueue(EnqueueRequest::new("preview")).await.unwrap();

    let jobs = provider.get_request_jobs("req-9").await.unwrap();
    let ids: Vec<_> = jobs.iter().map(|j| j.id.clone()).collect();
    assert_eq!(ids, vec![a.id, b.id]);
    assert_eq!(provider.get_request_job_count("req-9").await.unwrap(), 2);
    assert_eq!(provider.get_request_job_count("req-unknown").await.unwrap(), 0);
}

pub async fn stats_are_consistent<P: QueueProvider>(provider: &P, clock: &ManualClock) {
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(provider.enqueue(EnqueueRequest::new("preview")).await.unwrap().id);
        clock.advance(Duration::from_millis(1));
    }
    for _ in 0..3 {
        provider.reserve("w1", None).await.unwrap().unwrap();
    }
    provider.complete(&ids[0], "w1", Payload::new()).await.unwrap();
    provider.fail(&ids[1], "w1", flaky()).await.unwrap();

    let stats = provider.get_stats().await.unwrap();
    assert_eq!(
        (stats.queued, stats.processing, stats.completed, stats.failed),
        (2, 1, 1, 1)
    );
    assert_eq!(
        stats.total,
        stats.queued + stats.processing + stats.completed + stats.failed + stats.cancelled
    );
    assert_eq!(stats.success_rate, Some(0.5));
}
