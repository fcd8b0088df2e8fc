//! Periodic lease reclamation and retention.

use crate::error::Result;
use crate::queue::QueueHandle;
use crate::settings::QueueSettings;
use relayq_core::log_app_error;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub evicted: usize,
}

/// Background task that returns expired leases to the queue and evicts
/// terminal jobs past retention.
#[derive(Debug, Clone)]
pub struct Reaper {
    queue: QueueHandle,
    interval: Duration,
    retention: Duration,
}

impl Reaper {
    pub fn new(queue: QueueHandle, interval: Duration, retention: Duration) -> Self {
        Self {
            queue,
            interval,
            retention,
        }
    }

    pub fn from_settings(queue: QueueHandle, settings: &QueueSettings) -> Self {
        Self::new(queue, settings.reap_interval(), settings.retention())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one reclaim-then-evict pass.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let reclaimed = self.queue.reclaim_expired_leases().await?;
        let evicted = self.queue.clean_old_jobs(self.retention).await?;
        Ok(SweepReport { reclaimed, evicted })
    }

    /// Sweep every `interval` until `cancel` fires. The first sweep happens
    /// one interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.sweep().await {
                    Ok(report) if report != SweepReport::default() => {
                        tracing::info!(
                            reclaimed = report.reclaimed,
                            evicted = report.evicted,
                            "maintenance sweep"
                        );
                    }
                    Ok(_) => tracing::trace!("maintenance sweep found nothing"),
                    Err(err) => log_app_error(&err, "maintenance_sweep"),
                },
            }
        }
        tracing::debug!("reaper stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
