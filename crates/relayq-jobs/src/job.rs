//! Job model: jobs, their status and priority, failures, retry policies and
//! queue statistics.

use chrono::{DateTime, Utc};
use relayq_core::{AppError, ErrorCode, JobAttempt, JobLogContext, Violation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Opaque key-value data: payloads, results and metadata.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Error code recorded when a job loses its last lease with no attempts left.
pub const LEASE_EXPIRED: &str = "LEASE_EXPIRED";

pub(crate) fn new_job_id() -> String {
    format!("job-{}", Uuid::new_v4())
}

/// Round a duration up to whole seconds.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    (duration.as_millis() as u64).div_ceil(1000)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Queued or processing: an idempotency key pointing here is reused.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::internal(format!("unknown job status '{s}'")))
    }
}

/// Scheduling priority. Higher variants are reserved first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Low,
        JobPriority::Normal,
        JobPriority::High,
        JobPriority::Urgent,
    ];

    /// Position in reservation order: 0 for `Urgent` through 3 for `Low`.
    pub fn rank(&self) -> u8 {
        3 - *self as u8
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Self::Urgent),
            1 => Some(Self::High),
            2 => Some(Self::Normal),
            3 => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == lowered)
            .ok_or_else(|| {
                AppError::validation(vec![Violation::new(
                    "priority",
                    format!("'{s}' is not one of low, normal, high, urgent"),
                )
                .with_code("enum")])
            })
    }
}

fn default_true() -> bool {
    true
}

/// Failure descriptor a worker hands to `fail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
    /// Seconds until the job may run again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// `false` sends the job straight to `Failed`
    #[serde(default = "default_true")]
    pub retryable: bool,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            fix: None,
            retry_after: None,
            retryable: true,
        }
    }

    /// Build from a taxonomy code, inheriting its fix hint and retry guidance.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            fix: Some(code.fix().to_string()),
            retry_after: code.default_retry_after(),
            retryable: code.is_retryable(),
        }
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self.retry_after = None;
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `initial * 2^(n-1)`
    #[default]
    Exponential,
    /// `initial * n`
    Linear,
    /// `initial`
    Fixed,
}

/// How a failed job is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-indexed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let millis = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Exponential => {
                let factor = 2u64.saturating_pow(n - 1);
                self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
            }
            BackoffStrategy::Linear => self
                .initial_delay_ms
                .saturating_mul(u64::from(n))
                .min(self.max_delay_ms),
        };
        Duration::from_millis(millis)
    }

    pub fn violations(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        if self.max_attempts == 0 {
            violations.push(
                Violation::new("retryPolicy.maxAttempts", "must be at least 1").with_code("range"),
            );
        }
        if self.initial_delay_ms > self.max_delay_ms {
            violations.push(
                Violation::new(
                    "retryPolicy.initialDelayMs",
                    "must not exceed retryPolicy.maxDelayMs",
                )
                .with_code("range"),
            );
        }
        violations
    }
}

/// Failure bookkeeping for an idempotency key (or job id when there is none).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: JobError,
}

impl FailureRecord {
    /// Whole seconds until the gate opens, or `None` once it has.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<u64> {
        if now >= self.next_retry_at {
            return None;
        }
        let wait = (self.next_retry_at - now).to_std().unwrap_or_default();
        Some(ceil_secs(wait).max(1))
    }
}

/// A unit of work and its full lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    /// Set only on the terminal `Failed` transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Most recent failure, terminal or not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub metadata: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Earliest time a retry-pending job may be reserved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub trace_id: String,
}

impl Job {
    /// Build a fresh `Queued` job.
    pub fn from_request(request: EnqueueRequest, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        let max_attempts = request
            .retry_policy
            .as_ref()
            .map_or(default_max_attempts, |policy| policy.max_attempts)
            .max(1);
        Self {
            id: new_job_id(),
            job_type: request.job_type,
            status: JobStatus::Queued,
            priority: request.priority,
            payload: request.payload,
            result: None,
            error: None,
            last_error: None,
            progress: 0,
            attempts: 0,
            max_attempts,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            request_id: request.request_id,
            idempotency_key: request.idempotency_key,
            metadata: request.metadata,
            retry_policy: request.retry_policy,
            next_attempt_at: None,
            trace_id: request
                .trace_id
                .unwrap_or_else(relayq_core::generate_trace_id),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Key under which failures of this job are recorded.
    pub fn failure_key(&self) -> &str {
        self.idempotency_key.as_deref().unwrap_or(&self.id)
    }

    /// Whether `fail` should put the job back in the queue.
    pub fn should_retry(&self, error: &JobError) -> bool {
        error.retryable && self.retry_policy.is_some() && self.attempts < self.max_attempts
    }

    /// Delay before the next attempt after a failure.
    ///
    /// The policy's backoff, stretched to honour a longer `retry_after`
    /// suggested by the failure itself.
    pub fn retry_delay(&self, error: &JobError) -> Duration {
        let backoff = self
            .retry_policy
            .as_ref()
            .map(|policy| policy.backoff_delay(self.attempts))
            .unwrap_or_default();
        let suggested = Duration::from_secs(error.retry_after.unwrap_or(0));
        backoff.max(suggested)
    }

    /// Time spent between reservation and the terminal transition.
    pub fn processing_time(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.completed_at?;
        (finished - started).to_std().ok()
    }

    pub fn log_context(&self) -> JobLogContext {
        JobLogContext {
            job_id: self.id.clone(),
            queue: self.job_type.clone(),
            trace_id: self.trace_id.clone(),
            worker_id: None,
            attempt: self.attempts,
            max_attempts: self.max_attempts,
        }
    }

    pub fn attempt(&self) -> JobAttempt<'_> {
        JobAttempt {
            job_id: &self.id,
            queue: &self.job_type,
            trace_id: &self.trace_id,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            next_attempt_at: self.next_attempt_at,
        }
    }
}

/// Parameters for `enqueue`.
///
/// # Example
///
/// ```
/// use relayq_jobs::{EnqueueRequest, JobPriority, RetryPolicy};
///
/// let request = EnqueueRequest::new("preview")
///     .field("prompt", "a red bicycle")
///     .priority(JobPriority::High)
///     .idempotency_key("req-42:preview")
///     .retry_policy(RetryPolicy::new(3));
/// assert_eq!(request.job_type, "preview");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub payload: Payload,
    pub priority: JobPriority,
    pub request_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub metadata: Payload,
    pub trace_id: Option<String>,
}

impl EnqueueRequest {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set a single payload field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Reject malformed requests before they touch queue state.
    pub fn validate(&self) -> relayq_core::Result<()> {
        let mut violations = Vec::new();
        if self.job_type.trim().is_empty() {
            violations.push(Violation::new("type", "must not be empty").with_code("required"));
        }
        if matches!(self.idempotency_key.as_deref(), Some(key) if key.trim().is_empty()) {
            violations.push(
                Violation::new("idempotencyKey", "must not be blank when present")
                    .with_code("required"),
            );
        }
        if let Some(policy) = &self.retry_policy {
            violations.extend(policy.violations());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(AppError::validation(violations))
        }
    }
}

/// Point-in-time queue counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Always the sum of the five status counts
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_processing_time_ms: Option<f64>,
    /// `completed / (completed + failed)`, absent when both are zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
}

impl QueueStats {
    pub fn from_counts(
        queued: u64,
        processing: u64,
        completed: u64,
        failed: u64,
        cancelled: u64,
        avg_processing_time_ms: Option<f64>,
    ) -> Self {
        let finished = completed + failed;
        Self {
            queued,
            processing,
            completed,
            failed,
            cancelled,
            total: queued + processing + completed + failed + cancelled,
            avg_processing_time_ms,
            success_rate: (finished > 0).then(|| completed as f64 / finished as f64),
        }
    }
}
