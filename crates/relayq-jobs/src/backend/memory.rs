use super::{
    backoff_gate, clamp_progress, global_quota_exceeded, job_missing, lease_holder_mismatch,
    lease_missing, queue_full, request_quota_exceeded, Backend, ProviderConfig, QueueProvider,
    Submitted, RATE_LIMIT_WINDOW,
};
use crate::clock::{shared_system_clock, Clock};
use crate::error::{lock_poisoned, Result};
use crate::job::{
    ceil_secs, EnqueueRequest, FailureRecord, Job, JobError, JobStatus, Payload, QueueStats,
    LEASE_EXPIRED,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayq_extras::rate_limit::FixedWindowLimiter;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const GLOBAL_LIMIT_KEY: &str = "global";

/// Position in the ready index: priority first, then effective time, then
/// insertion order to break ties within the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    rank: u8,
    ready_at_ms: i64,
    seq: u64,
}

#[derive(Debug, Clone)]
struct Lease {
    worker_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<String, Job>,
    ready: BTreeMap<QueueKey, String>,
    queue_keys: HashMap<String, QueueKey>,
    leases: HashMap<String, Lease>,
    idempotency: HashMap<String, Expiring<String>>,
    failures: HashMap<String, Expiring<FailureRecord>>,
    requests: HashMap<String, Vec<String>>,
    seq: u64,
}

impl State {
    fn push_ready(&mut self, job: &Job, ready_at: DateTime<Utc>) {
        self.seq += 1;
        let key = QueueKey {
            rank: job.priority.rank(),
            ready_at_ms: ready_at.timestamp_millis(),
            seq: self.seq,
        };
        self.ready.insert(key, job.id.clone());
        self.queue_keys.insert(job.id.clone(), key);
    }

    fn remove_ready(&mut self, job_id: &str) {
        if let Some(key) = self.queue_keys.remove(job_id) {
            self.ready.remove(&key);
        }
    }

    fn failure_gate(&self, key: &str, now: DateTime<Utc>) -> Option<u64> {
        self.failures
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .and_then(|entry| entry.value.retry_after(now))
    }

    fn active_job_for_key(&self, key: &str, now: DateTime<Utc>) -> Option<&Job> {
        let entry = self.idempotency.get(key).filter(|e| e.expires_at > now)?;
        self.jobs
            .get(&entry.value)
            .filter(|job| job.status.is_active())
    }

    /// Void every lease that expired at or before `now`.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<(String, Lease)> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, lease)| (id.clone(), lease.clone()))
            .collect();

        for (job_id, lease) in &expired {
            self.leases.remove(job_id);
            let Some(job) = self.jobs.get_mut(job_id) else {
                continue;
            };
            job.updated_at = now;
            if job.attempts >= job.max_attempts {
                let error = JobError::new(
                    LEASE_EXPIRED,
                    format!("Lease held by {} expired with no attempts left", lease.worker_id),
                )
                .non_retryable();
                job.status = JobStatus::Failed;
                job.error = Some(error.clone());
                job.last_error = Some(error);
                job.completed_at = Some(now);
                tracing::warn!(
                    job_id = %job_id,
                    worker_id = %lease.worker_id,
                    attempts = job.attempts,
                    "lease expired on final attempt; job failed"
                );
            } else {
                job.status = JobStatus::Queued;
                let job = job.clone();
                self.push_ready(&job, now);
                tracing::warn!(
                    job_id = %job_id,
                    worker_id = %lease.worker_id,
                    attempts = job.attempts,
                    "lease expired; job returned to queue"
                );
            }
        }
        expired.len()
    }

    /// Confirm `worker_id` holds a live lease on `job_id`.
    fn check_owner(&mut self, job_id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.jobs.contains_key(job_id) {
            return Err(job_missing(job_id));
        }
        let lease = self.leases.get(job_id).ok_or_else(|| lease_missing(job_id))?;
        let (expired, held_by_caller) = (lease.expires_at <= now, lease.worker_id == worker_id);
        if expired {
            self.reclaim_expired(now);
            return Err(lease_missing(job_id));
        }
        if !held_by_caller {
            return Err(lease_holder_mismatch(job_id));
        }
        Ok(())
    }

    fn record_failure(&mut self, key: &str, error: &JobError, next_retry_at: DateTime<Utc>, ttl: Duration) {
        let expires_at = next_retry_at + ttl_delta(ttl);
        let count = self.failures.get(key).map_or(0, |entry| entry.value.count) + 1;
        self.failures.insert(
            key.to_string(),
            Expiring {
                value: FailureRecord {
                    count,
                    next_retry_at,
                    last_error: error.clone(),
                },
                expires_at,
            },
        );
    }

    /// Drop `job` and the indexes that point at it. A failure record shared
    /// through an idempotency key stays while a newer job's gate is still shut.
    fn remove_job(&mut self, job: &Job, now: DateTime<Utc>) {
        self.jobs.remove(&job.id);
        self.remove_ready(&job.id);
        self.leases.remove(&job.id);
        let owns_key = match &job.idempotency_key {
            Some(key) => {
                let owned = self.idempotency.get(key).is_some_and(|e| e.value == job.id);
                if owned {
                    self.idempotency.remove(key);
                }
                owned
            }
            None => true,
        };
        let gate_open = self
            .failures
            .get(job.failure_key())
            .is_some_and(|entry| entry.value.next_retry_at <= now);
        if owns_key || gate_open {
            self.failures.remove(job.failure_key());
        }
        if let Some(request_id) = &job.request_id {
            if let Some(ids) = self.requests.get_mut(request_id) {
                ids.retain(|id| id != &job.id);
                if ids.is_empty() {
                    self.requests.remove(request_id);
                }
            }
        }
    }
}

fn ttl_delta(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// In-memory queue provider (not persistent, for single-process use and tests)
///
/// All state lives behind one mutex, so every operation is a single
/// critical section and concurrent `reserve` calls are serialized.
#[derive(Debug, Clone)]
pub struct InMemoryProvider {
    state: Arc<Mutex<State>>,
    limiter: Arc<FixedWindowLimiter>,
    config: ProviderConfig,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::with_config(ProviderConfig::default())
    }

    pub fn with_config(config: ProviderConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            limiter: Arc::new(FixedWindowLimiter::new(RATE_LIMIT_WINDOW)),
            config,
            clock: shared_system_clock(),
        }
    }

    /// Use `clock` for every timestamp and expiry decision.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Drop every job, lease, key and counter.
    pub fn clear(&self) -> Result<()> {
        *self.lock()? = State::default();
        self.limiter.clear();
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| lock_poisoned())
    }
}

#[async_trait]
impl QueueProvider for InMemoryProvider {
    fn backend(&self) -> Backend {
        Backend::InProcess
    }

    async fn submit(&self, request: EnqueueRequest) -> Result<Submitted> {
        request.validate()?;
        let now = self.clock.now();
        let mut state = self.lock()?;

        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(wait) = state.failure_gate(key, now) {
                return Err(backoff_gate(wait));
            }
            if let Some(existing) = state.active_job_for_key(key, now) {
                tracing::debug!(job_id = %existing.id, "idempotency key matched active job");
                return Ok(Submitted::reused(existing.clone()));
            }
        }

        if state.ready.len() >= self.config.max_queue_size {
            return Err(queue_full(self.config.max_queue_size));
        }

        let request_key = request.request_id.as_ref().map(|id| format!("request:{id}"));
        if let (Some(request_id), Some(key)) = (&request.request_id, &request_key) {
            let admission = self
                .limiter
                .check(key, self.config.rate_limit_per_request, now);
            if !admission.allowed {
                return Err(request_quota_exceeded(request_id, admission.retry_after_secs()));
            }
        }
        let global = self
            .limiter
            .check(GLOBAL_LIMIT_KEY, self.config.rate_limit_per_minute, now);
        if !global.allowed {
            return Err(global_quota_exceeded(global.retry_after_secs()));
        }

        // Checks passed under the state lock; count the hits now.
        if let Some(key) = &request_key {
            self.limiter
                .acquire(key, self.config.rate_limit_per_request, now);
        }
        self.limiter
            .acquire(GLOBAL_LIMIT_KEY, self.config.rate_limit_per_minute, now);

        let job = Job::from_request(request, self.config.default_max_attempts, now);
        state.push_ready(&job, now);
        if let Some(key) = &job.idempotency_key {
            state.idempotency.insert(
                key.clone(),
                Expiring {
                    value: job.id.clone(),
                    expires_at: now + ttl_delta(self.config.idempotency_ttl),
                },
            );
        }
        if let Some(request_id) = &job.request_id {
            state
                .requests
                .entry(request_id.clone())
                .or_default()
                .push(job.id.clone());
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(Submitted::created(job))
    }

    async fn reserve(&self, worker_id: &str, types: Option<&[String]>) -> Result<Option<Job>> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.reclaim_expired(now);

        if state.leases.len() >= self.config.max_concurrent {
            return Ok(None);
        }

        let now_ms = now.timestamp_millis();
        let candidate = state
            .ready
            .iter()
            .filter(|(key, _)| key.ready_at_ms <= now_ms)
            .find(|(_, id)| match types {
                Some(types) => state
                    .jobs
                    .get(id.as_str())
                    .is_some_and(|job| types.iter().any(|t| t == &job.job_type)),
                None => true,
            })
            .map(|(_, id)| id.clone());

        let Some(job_id) = candidate else {
            return Ok(None);
        };
        state.remove_ready(&job_id);

        let job = state.jobs.get_mut(&job_id).ok_or_else(|| job_missing(&job_id))?;
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(now);
        job.updated_at = now;
        job.next_attempt_at = None;
        let reserved = job.clone();

        state.leases.insert(
            job_id,
            Lease {
                worker_id: worker_id.to_string(),
                expires_at: now + ttl_delta(self.config.visibility_timeout),
            },
        );
        Ok(Some(reserved))
    }

    async fn heartbeat(&self, job_id: &str, worker_id: &str, progress: Option<i64>) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.check_owner(job_id, worker_id, now)?;

        if let Some(lease) = state.leases.get_mut(job_id) {
            lease.expires_at = now + ttl_delta(self.config.visibility_timeout);
        }
        if let Some(job) = state.jobs.get_mut(job_id) {
            if let Some(progress) = progress {
                job.progress = clamp_progress(progress);
            }
            job.updated_at = now;
        }
        Ok(())
    }

    async fn complete(&self, job_id: &str, worker_id: &str, result: Payload) -> Result<Job> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.check_owner(job_id, worker_id, now)?;
        state.leases.remove(job_id);

        let job = state.jobs.get_mut(job_id).ok_or_else(|| job_missing(job_id))?;
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.error = None;
        job.progress = 100;
        job.completed_at = Some(now);
        job.updated_at = now;
        job.next_attempt_at = None;
        let completed = job.clone();

        state.failures.remove(completed.failure_key());
        Ok(completed)
    }

    async fn fail(&self, job_id: &str, worker_id: &str, mut error: JobError) -> Result<Job> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.check_owner(job_id, worker_id, now)?;
        state.leases.remove(job_id);

        let job = state.jobs.get_mut(job_id).ok_or_else(|| job_missing(job_id))?;
        let next_retry_at = if job.should_retry(&error) {
            let delay = job.retry_delay(&error);
            let next = now + ttl_delta(delay);
            error.retry_after = Some(ceil_secs(delay));
            job.status = JobStatus::Queued;
            job.next_attempt_at = Some(next);
            next
        } else {
            error.retry_after = None;
            job.status = JobStatus::Failed;
            job.error = Some(error.clone());
            job.completed_at = Some(now);
            job.next_attempt_at = None;
            now
        };
        job.last_error = Some(error.clone());
        job.updated_at = now;
        let failed = job.clone();

        if failed.status == JobStatus::Queued {
            state.push_ready(&failed, next_retry_at);
        }
        state.record_failure(failed.failure_key(), &error, next_retry_at, self.config.idempotency_ttl);
        Ok(failed)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(job_id).cloned())
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        let state = self.lock()?;
        let mut counts = [0u64; 5];
        let mut processing_ms = Vec::new();
        for job in state.jobs.values() {
            let slot = match job.status {
                JobStatus::Queued => 0,
                JobStatus::Processing => 1,
                JobStatus::Completed => 2,
                JobStatus::Failed => 3,
                JobStatus::Cancelled => 4,
            };
            counts[slot] += 1;
            if job.status == JobStatus::Completed {
                if let Some(elapsed) = job.processing_time() {
                    processing_ms.push(elapsed.as_secs_f64() * 1000.0);
                }
            }
        }
        let avg = (!processing_ms.is_empty())
            .then(|| processing_ms.iter().sum::<f64>() / processing_ms.len() as f64);
        Ok(QueueStats::from_counts(
            counts[0], counts[1], counts[2], counts[3], counts[4], avg,
        ))
    }

    async fn clean_old_jobs(&self, max_age: Duration) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now - ttl_delta(max_age);
        let mut state = self.lock()?;

        let stale: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.is_terminal() && job.completed_at.unwrap_or(job.created_at) < cutoff)
            .cloned()
            .collect();
        for job in &stale {
            state.remove_job(job, now);
        }

        state.idempotency.retain(|_, entry| entry.expires_at > now);
        state.failures.retain(|_, entry| entry.expires_at > now);
        self.limiter.purge_expired(now);
        Ok(stale.len())
    }

    async fn get_request_jobs(&self, request_id: &str) -> Result<Vec<Job>> {
        let state = self.lock()?;
        Ok(state
            .requests
            .get(request_id)
            .map(|ids| ids.iter().filter_map(|id| state.jobs.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn get_request_job_count(&self, request_id: &str) -> Result<usize> {
        let state = self.lock()?;
        Ok(state
            .requests
            .get(request_id)
            .map_or(0, |ids| ids.iter().filter(|id| state.jobs.contains_key(*id)).count()))
    }

    async fn reclaim_expired_leases(&self) -> Result<usize> {
        let now = self.clock.now();
        Ok(self.lock()?.reclaim_expired(now))
    }
}
