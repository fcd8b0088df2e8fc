//! Test double for the durable backend.
//!
//! Same semantics as [`InMemoryProvider`], plus round-trip latency on every
//! call and a seeded probability of failing `enqueue` or `reserve`. Failures
//! are injected before any state changes, so a failed call leaves the queue
//! exactly as it was.

use super::memory::InMemoryProvider;
use super::{Backend, ProviderConfig, QueueProvider, Submitted};
use crate::clock::Clock;
use crate::error::{lock_poisoned, Result};
use crate::job::{EnqueueRequest, Job, JobError, Payload, QueueStats};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relayq_core::AppError;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Latency and failure knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct Simulation {
    /// Delay for calls that change state; reads wait half as long
    pub latency: Duration,
    /// Probability in `0.0..=1.0` that `enqueue`/`reserve` fail
    pub failure_rate: f64,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(10),
            failure_rate: 0.0,
        }
    }
}

impl Simulation {
    pub fn instant() -> Self {
        Self {
            latency: Duration::ZERO,
            failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeDurableProvider {
    inner: InMemoryProvider,
    simulation: Arc<RwLock<Simulation>>,
    rng: Arc<Mutex<StdRng>>,
}

impl FakeDurableProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            inner: InMemoryProvider::with_config(config),
            simulation: Arc::new(RwLock::new(Simulation::default())),
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(42))),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.inner = self.inner.with_clock(clock);
        self
    }

    pub fn with_simulation(self, simulation: Simulation) -> Self {
        if let Ok(mut current) = self.simulation.write() {
            *current = simulation;
        }
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        if let Ok(mut rng) = self.rng.lock() {
            *rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    /// Change the knobs on a live provider.
    pub fn set_simulation(&self, simulation: Simulation) -> Result<()> {
        *self.simulation.write().map_err(|_| lock_poisoned())? = simulation;
        Ok(())
    }

    pub fn simulation(&self) -> Result<Simulation> {
        Ok(self.simulation.read().map_err(|_| lock_poisoned())?.clone())
    }

    /// Drop all queue state, keeping the simulation settings.
    pub fn reset(&self) -> Result<()> {
        self.inner.clear()
    }

    async fn write_latency(&self) -> Result<()> {
        let latency = self.simulation()?.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    async fn read_latency(&self) -> Result<()> {
        let latency = self.simulation()?.latency / 2;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn maybe_fail(&self, operation: &str) -> Result<()> {
        let rate = self.simulation()?.failure_rate;
        if rate <= 0.0 {
            return Ok(());
        }
        let roll: f64 = self.rng.lock().map_err(|_| lock_poisoned())?.gen();
        if roll < rate {
            tracing::debug!(operation, "injecting simulated backend failure");
            return Err(AppError::internal(format!(
                "Simulated backend failure during {operation}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueProvider for FakeDurableProvider {
    fn backend(&self) -> Backend {
        Backend::TestDouble
    }

    async fn submit(&self, request: EnqueueRequest) -> Result<Submitted> {
        self.write_latency().await?;
        self.maybe_fail("enqueue")?;
        self.inner.submit(request).await
    }

    async fn reserve(&self, worker_id: &str, types: Option<&[String]>) -> Result<Option<Job>> {
        self.write_latency().await?;
        self.maybe_fail("reserve")?;
        self.inner.reserve(worker_id, types).await
    }

    async fn heartbeat(&self, job_id: &str, worker_id: &str, progress: Option<i64>) -> Result<()> {
        self.write_latency().await?;
        self.inner.heartbeat(job_id, worker_id, progress).await
    }

    async fn complete(&self, job_id: &str, worker_id: &str, result: Payload) -> Result<Job> {
        self.write_latency().await?;
        self.inner.complete(job_id, worker_id, result).await
    }

    async fn fail(&self, job_id: &str, worker_id: &str, error: JobError) -> Result<Job> {
        self.write_latency().await?;
        self.inner.fail(job_id, worker_id, error).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.read_latency().await?;
        self.inner.get_job(job_id).await
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        self.read_latency().await?;
        self.inner.get_stats().await
    }

    async fn clean_old_jobs(&self, max_age: Duration) -> Result<usize> {
        self.write_latency().await?;
        self.inner.clean_old_jobs(max_age).await
    }

    async fn get_request_jobs(&self, request_id: &str) -> Result<Vec<Job>> {
        self.read_latency().await?;
        self.inner.get_request_jobs(request_id).await
    }

    async fn get_request_job_count(&self, request_id: &str) -> Result<usize> {
        self.read_latency().await?;
        self.inner.get_request_job_count(request_id).await
    }

    async fn reclaim_expired_leases(&self) -> Result<usize> {
        self.write_latency().await?;
        self.inner.reclaim_expired_leases().await
    }
}
