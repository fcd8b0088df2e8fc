use crate::error::Result;
use crate::job::{EnqueueRequest, Job, JobError, Payload, QueueStats};
use async_trait::async_trait;
use relayq_core::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod fake;
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

/// Which storage implementation backs a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Process-local state, lost on restart
    #[default]
    InProcess,
    /// Redis, survives restarts and is shared between processes
    Durable,
    /// In-process semantics with injected latency and failures
    TestDouble,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in-process",
            Self::Durable => "durable",
            Self::TestDouble => "test-double",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in-process" | "inprocess" | "memory" => Ok(Self::InProcess),
            "durable" | "redis" => Ok(Self::Durable),
            "test-double" | "fake" => Ok(Self::TestDouble),
            other => Err(format!(
                "unknown backend '{other}', expected in-process, durable or test-double"
            )),
        }
    }
}

/// Limits and timeouts every provider enforces.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// `reserve` returns nothing while this many jobs are processing
    pub max_concurrent: usize,
    /// `enqueue` is rejected while this many jobs are queued
    pub max_queue_size: usize,
    /// Global enqueue quota per 60 s window
    pub rate_limit_per_minute: u32,
    /// Enqueue quota per request id per 60 s window
    pub rate_limit_per_request: u32,
    /// `maxAttempts` for jobs enqueued without a retry policy
    pub default_max_attempts: u32,
    /// Lease length granted by `reserve` and `heartbeat`
    pub visibility_timeout: Duration,
    /// Lifetime of idempotency keys and failure records
    pub idempotency_ttl: Duration,
}

/// Window length for both admission quotas.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 1000,
            rate_limit_per_minute: 60,
            rate_limit_per_request: 2,
            default_max_attempts: 3,
            visibility_timeout: Duration::from_secs(30),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// What `submit` did with a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Submitted {
    pub job: Job,
    /// `false` when an active job with the same idempotency key was returned
    pub created: bool,
}

impl Submitted {
    pub(crate) fn created(job: Job) -> Self {
        Self { job, created: true }
    }

    pub(crate) fn reused(job: Job) -> Self {
        Self {
            job,
            created: false,
        }
    }
}

/// Storage and coordination for jobs.
///
/// Implementations must make `reserve` atomic: two concurrent callers never
/// receive the same job. Ownership-checked calls (`heartbeat`, `complete`,
/// `fail`) answer `FORBIDDEN` when another worker holds the lease and
/// `RESOURCE_NOT_FOUND` when the job or its lease is gone.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    fn backend(&self) -> Backend;

    /// Submit a job, reusing an active job with the same idempotency key.
    async fn submit(&self, request: EnqueueRequest) -> Result<Submitted>;

    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job> {
        Ok(self.submit(request).await?.job)
    }

    /// Lease the highest-priority, oldest eligible job. Never blocks.
    async fn reserve(&self, worker_id: &str, types: Option<&[String]>) -> Result<Option<Job>>;

    /// Extend the caller's lease and record progress (clamped to 0..=100).
    async fn heartbeat(&self, job_id: &str, worker_id: &str, progress: Option<i64>) -> Result<()>;

    async fn complete(&self, job_id: &str, worker_id: &str, result: Payload) -> Result<Job>;

    /// Record a failure and either schedule a retry or fail the job for good.
    async fn fail(&self, job_id: &str, worker_id: &str, error: JobError) -> Result<Job>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    async fn get_stats(&self) -> Result<QueueStats>;

    /// Delete terminal jobs older than `max_age`. Returns how many went.
    async fn clean_old_jobs(&self, max_age: Duration) -> Result<usize>;

    async fn get_request_jobs(&self, request_id: &str) -> Result<Vec<Job>>;

    async fn get_request_job_count(&self, request_id: &str) -> Result<usize>;

    /// Return jobs with expired leases to the queue. Returns how many.
    async fn reclaim_expired_leases(&self) -> Result<usize>;
}

pub(crate) fn clamp_progress(progress: i64) -> u8 {
    progress.clamp(0, 100) as u8
}

pub(crate) fn lease_holder_mismatch(job_id: &str) -> AppError {
    AppError::forbidden(format!("Job {job_id} is leased by another worker"))
}

pub(crate) fn lease_missing(job_id: &str) -> AppError {
    AppError::not_found(format!("Job {job_id} has no active lease"))
}

pub(crate) fn job_missing(job_id: &str) -> AppError {
    AppError::not_found(format!("Job {job_id} not found"))
}

pub(crate) fn backoff_gate(retry_after: u64) -> AppError {
    AppError::rate_limited("A previous attempt failed; resubmission is backing off", retry_after)
}

pub(crate) fn queue_full(max_queue_size: usize) -> AppError {
    AppError::rate_limited(format!("Queue is full ({max_queue_size} jobs)"), 60)
}

pub(crate) fn request_quota_exceeded(request_id: &str, retry_after: u64) -> AppError {
    AppError::rate_limited(
        format!("Request {request_id} exceeded its job quota"),
        retry_after,
    )
}

pub(crate) fn global_quota_exceeded(retry_after: u64) -> AppError {
    AppError::rate_limited("Global enqueue rate exceeded", retry_after)
}
