use crate::backend::fake::FakeDurableProvider;
use crate::backend::memory::InMemoryProvider;
use crate::backend::{Backend, QueueProvider, Submitted};
use crate::error::{config_error, Result};
use crate::job::{EnqueueRequest, Job, JobError, JobStatus, Payload, QueueStats};
use crate::settings::QueueSettings;
use relayq_core::{job_span, log_app_error, QueueMetrics};
use std::sync::Arc;
use std::time::Duration;

/// Shared entry point for producers, workers and the reaper.
///
/// Wraps a provider with metrics and job-scoped logging. Cloning is cheap and
/// every clone talks to the same queue.
#[derive(Clone)]
pub struct QueueHandle {
    provider: Arc<dyn QueueProvider>,
    metrics: QueueMetrics,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("backend", &self.provider.backend())
            .finish_non_exhaustive()
    }
}

impl QueueHandle {
    pub fn new<P: QueueProvider + 'static>(provider: P) -> Self {
        Self::with_metrics(Arc::new(provider), QueueMetrics::new())
    }

    pub fn with_metrics(provider: Arc<dyn QueueProvider>, metrics: QueueMetrics) -> Self {
        Self { provider, metrics }
    }

    /// Build the provider named by `settings.backend`.
    ///
    /// A durable backend that cannot be configured or reached is an error;
    /// there is no fallback to another backend.
    pub async fn from_settings(settings: &QueueSettings) -> Result<Self> {
        settings.validate().map_err(config_error)?;
        let config = settings.provider_config();
        let provider: Arc<dyn QueueProvider> = match settings.backend {
            Backend::InProcess => Arc::new(InMemoryProvider::with_config(config)),
            Backend::TestDouble => Arc::new(
                FakeDurableProvider::new(config)
                    .with_seed(settings.test_double_seed)
                    .with_simulation(settings.simulation()),
            ),
            Backend::Durable => connect_durable(settings).await?,
        };
        tracing::info!(backend = %provider.backend(), "queue ready");
        Ok(Self::with_metrics(provider, QueueMetrics::new()))
    }

    pub fn provider(&self) -> &Arc<dyn QueueProvider> {
        &self.provider
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    pub fn backend(&self) -> Backend {
        self.provider.backend()
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Job> {
        let queue = request.job_type.clone();
        match self.provider.submit(request).await {
            Ok(Submitted { job, created: true }) => {
                self.metrics.record_enqueued(&queue);
                job_span(&job.log_context()).in_scope(|| {
                    tracing::info!(priority = %job.priority, status = %job.status, "job accepted");
                });
                Ok(job)
            }
            Ok(Submitted { job, created: false }) => {
                job_span(&job.log_context()).in_scope(|| {
                    tracing::debug!(status = %job.status, "idempotency key reused active job");
                });
                Ok(job)
            }
            Err(err) => {
                self.metrics.record_rejected(err.code);
                log_app_error(&err, "enqueue");
                Err(err)
            }
        }
    }

    pub async fn reserve(&self, worker_id: &str, types: Option<&[String]>) -> Result<Option<Job>> {
        let reserved = self.provider.reserve(worker_id, types).await.map_err(|err| {
            log_app_error(&err, "reserve");
            err
        })?;
        if let Some(job) = &reserved {
            self.metrics.record_attempt(&job.attempt());
            job_span(&job.log_context().with_worker(worker_id))
                .in_scope(|| tracing::debug!("job reserved"));
        }
        Ok(reserved)
    }

    pub async fn heartbeat(&self, job_id: &str, worker_id: &str, progress: Option<i64>) -> Result<()> {
        self.provider
            .heartbeat(job_id, worker_id, progress)
            .await
            .map_err(|err| {
                log_app_error(&err, "heartbeat");
                err
            })
    }

    pub async fn complete(&self, job_id: &str, worker_id: &str, result: Payload) -> Result<Job> {
        let job = self
            .provider
            .complete(job_id, worker_id, result)
            .await
            .map_err(|err| {
                log_app_error(&err, "complete");
                err
            })?;
        self.metrics
            .record_completion(&job.attempt(), job.processing_time().unwrap_or_default());
        Ok(job)
    }

    pub async fn fail(&self, job_id: &str, worker_id: &str, error: JobError) -> Result<Job> {
        let code = error.code.clone();
        let job = self
            .provider
            .fail(job_id, worker_id, error)
            .await
            .map_err(|err| {
                log_app_error(&err, "fail");
                err
            })?;
        let will_retry = job.status == JobStatus::Queued;
        self.metrics.record_failure(&job.attempt(), will_retry, &code);
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.provider.get_job(job_id).await
    }

    pub async fn get_stats(&self) -> Result<QueueStats> {
        self.provider.get_stats().await
    }

    pub async fn get_request_jobs(&self, request_id: &str) -> Result<Vec<Job>> {
        self.provider.get_request_jobs(request_id).await
    }

    pub async fn get_request_job_count(&self, request_id: &str) -> Result<usize> {
        self.provider.get_request_job_count(request_id).await
    }

    pub async fn clean_old_jobs(&self, max_age: Duration) -> Result<usize> {
        let evicted = self.provider.clean_old_jobs(max_age).await?;
        self.metrics.record_evicted(evicted);
        Ok(evicted)
    }

    pub async fn reclaim_expired_leases(&self) -> Result<usize> {
        let reclaimed = self.provider.reclaim_expired_leases().await?;
        self.metrics.record_reclaimed(reclaimed);
        Ok(reclaimed)
    }
}

#[cfg(feature = "redis")]
async fn connect_durable(settings: &QueueSettings) -> Result<Arc<dyn QueueProvider>> {
    use crate::backend::redis::RedisProvider;
    use relayq_extras::config::ConfigError;

    let url = settings.redis_url.as_deref().ok_or_else(|| {
        config_error(ConfigError::invalid("redis_url", "required when backend is durable"))
    })?;
    let provider = RedisProvider::connect(
        url,
        settings.provider_config(),
        settings.key_prefix.clone(),
        settings.job_ttl(),
    )
    .await?;
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "redis"))]
async fn connect_durable(_settings: &QueueSettings) -> Result<Arc<dyn QueueProvider>> {
    use relayq_extras::config::ConfigError;

    Err(config_error(ConfigError::invalid(
        "backend",
        "durable backend requires building with the `redis` feature",
    )))
}
