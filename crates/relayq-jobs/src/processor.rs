//! The work a worker performs on each reserved job.

use crate::job::{Job, JobError, Payload};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relayq_core::ErrorCode;
use serde_json::json;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Progress percentage shared between a processor and the heartbeat ticker.
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<AtomicU8>);

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values above 100 are clamped.
    pub fn set(&self, percent: u8) {
        self.0.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    /// Do the work. A returned `JobError` decides between retry and failure.
    async fn process(&self, job: &Job, progress: &Progress) -> Result<Payload, JobError>;
}

/// Stand-in processor: walks through progress steps and fails at random.
#[derive(Debug)]
pub struct SimulatedProcessor {
    steps: u8,
    step_delay: Duration,
    failure_rate: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedProcessor {
    pub fn new(seed: u64) -> Self {
        Self {
            steps: 4,
            step_delay: Duration::from_millis(250),
            failure_rate: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_steps(mut self, steps: u8, step_delay: Duration) -> Self {
        self.steps = steps.max(1);
        self.step_delay = step_delay;
        self
    }

    /// Decide up front whether this run fails, and how.
    fn roll(&self) -> Option<JobError> {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if rng.gen::<f64>() >= self.failure_rate {
            return None;
        }
        let error = match rng.gen_range(0..3) {
            0 => JobError::from_code(
                ErrorCode::ProviderQuotaExceeded,
                "Upstream provider quota exhausted",
            ),
            1 => JobError::from_code(
                ErrorCode::ProviderPolicyBlocked,
                "Upstream provider rejected the content",
            ),
            _ => JobError::from_code(ErrorCode::InternalServerError, "Upstream provider crashed")
                .with_retry_after(60),
        };
        Some(error)
    }
}

#[async_trait]
impl Processor for SimulatedProcessor {
    async fn process(&self, job: &Job, progress: &Progress) -> Result<Payload, JobError> {
        let failure = self.roll();
        let fail_at = self.steps.div_ceil(2);

        for step in 1..=self.steps {
            tokio::time::sleep(self.step_delay).await;
            if step == fail_at {
                if let Some(error) = failure.clone() {
                    return Err(error);
                }
            }
            progress.set((u16::from(step) * 100 / u16::from(self.steps)) as u8);
        }

        let result = json!({
            "type": job.job_type,
            "output": format!("{}/{}.out", job.job_type, job.id),
            "steps": self.steps,
        });
        Ok(result.as_object().cloned().unwrap_or_default())
    }
}
