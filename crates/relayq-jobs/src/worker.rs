use crate::error::Result;
use crate::job::{Job, JobStatus};
use crate::processor::{Processor, Progress};
use crate::queue::QueueHandle;
use relayq_core::{job_span, log_app_error, AppError, ErrorCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Worker identity and pacing.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Only reserve these job types; `None` takes anything
    pub types: Option<Vec<String>>,
    /// Sleep between polls when the queue has nothing ready
    pub poll_interval: Duration,
    /// Must stay well below the visibility timeout
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
            types: None,
            poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Heartbeat three times per visibility timeout.
    pub fn for_visibility_timeout(self, timeout: Duration) -> Self {
        self.heartbeat_interval((timeout / 3).max(Duration::from_millis(10)))
    }
}

/// Result of one `run_once` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing was ready
    Idle,
    Completed(Job),
    /// Failed and scheduled for another attempt
    Retrying(Job),
    Failed(Job),
    /// The lease was lost mid-flight; the job belongs to someone else now
    Abandoned { job_id: String },
}

fn lease_lost(err: &AppError) -> bool {
    matches!(err.code, ErrorCode::Forbidden | ErrorCode::ResourceNotFound)
}

/// Reserve-process-settle loop around a [`Processor`].
pub struct Worker {
    queue: QueueHandle,
    processor: Arc<dyn Processor>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: QueueHandle, processor: Arc<dyn Processor>, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Poll until `cancel` fires. A job in flight when cancelled is dropped
    /// and its lease left to expire.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(worker_id = %self.config.worker_id, "worker started");
        loop {
            let pause = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.run_once() => match outcome {
                    Ok(Outcome::Idle) => Some(self.config.poll_interval),
                    Ok(_) => None,
                    Err(err) => {
                        log_app_error(&err, "worker_poll");
                        Some(self.config.poll_interval)
                    }
                },
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        tracing::info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    /// Reserve and settle at most one job.
    pub async fn run_once(&self) -> Result<Outcome> {
        let worker_id = &self.config.worker_id;
        let Some(job) = self
            .queue
            .reserve(worker_id, self.config.types.as_deref())
            .await?
        else {
            return Ok(Outcome::Idle);
        };
        let span = job_span(&job.log_context().with_worker(worker_id.as_str()));
        self.execute(job).instrument(span).await
    }

    async fn execute(&self, job: Job) -> Result<Outcome> {
        let worker_id = self.config.worker_id.as_str();
        let progress = Progress::new();
        let mut work = self.processor.process(&job, &progress);
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = ticker.tick() => {
                    let percent = i64::from(progress.get());
                    match self.queue.heartbeat(&job.id, worker_id, Some(percent)).await {
                        Ok(()) => tracing::trace!(progress = percent, "heartbeat"),
                        Err(err) if lease_lost(&err) => {
                            tracing::warn!("lease lost; abandoning job");
                            return Ok(Outcome::Abandoned { job_id: job.id.clone() });
                        }
                        // Transient backend trouble; the next tick tries again.
                        Err(_) => {}
                    }
                }
            }
        };
        drop(work);

        let settled = match result {
            Ok(payload) => self.queue.complete(&job.id, worker_id, payload).await,
            Err(error) => {
                tracing::debug!(code = %error.code, "processor failed");
                self.queue.fail(&job.id, worker_id, error).await
            }
        };
        match settled {
            Ok(job) if job.status == JobStatus::Completed => Ok(Outcome::Completed(job)),
            Ok(job) if job.status == JobStatus::Queued => Ok(Outcome::Retrying(job)),
            Ok(job) => Ok(Outcome::Failed(job)),
            Err(err) if lease_lost(&err) => {
                tracing::warn!("lease lost before settling; result discarded");
                Ok(Outcome::Abandoned { job_id: job.id })
            }
            Err(err) => Err(err),
        }
    }
}
