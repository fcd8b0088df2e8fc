//! Prometheus metrics for the job queue
//!
//! # Metrics Collected
//!
//! - `relayq_jobs_enqueued_total{queue}` - Jobs accepted by `enqueue`
//! - `relayq_jobs_rejected_total{code}` - Calls rejected by admission control or validation
//! - `relayq_jobs_reserved_total{queue}` - Successful reservations
//! - `relayq_jobs_completed_total{queue}` - Completed jobs
//! - `relayq_jobs_failed_total{queue, will_retry}` - Failures, split by retry decision
//! - `relayq_leases_reclaimed_total` - Leases recovered after expiry
//! - `relayq_jobs_evicted_total` - Terminal jobs removed by retention
//! - `relayq_job_attempts{queue}` - Histogram of the attempt number at reservation
//! - `relayq_job_processing_seconds{queue}` - Histogram of reserve-to-complete time
//!
//! Besides the registry, the collector keeps the last 1000 processing times
//! in memory so percentiles can be read without a Prometheus server.

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default histogram buckets for processing duration (in seconds)
const PROCESSING_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

const ATTEMPT_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 5.0, 8.0, 13.0];

/// Number of processing samples kept for percentile queries
pub const PROCESSING_WINDOW: usize = 1000;

/// One attempt-level observation about a job.
#[derive(Debug, Clone)]
pub struct JobAttempt<'a> {
    pub job_id: &'a str,
    pub queue: &'a str,
    pub trace_id: &'a str,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of the processing-time window, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessingSnapshot {
    pub samples: usize,
    pub avg_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

/// Bounded window of recent processing times.
#[derive(Debug, Clone)]
pub struct ProcessingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl ProcessingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, millis: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(millis);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nearest-rank percentile, `p` in `0.0..=100.0`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }
}

/// Queue metrics collector
///
/// Cheap to clone; clones share the same registry and window.
#[derive(Clone)]
pub struct QueueMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    enqueued: IntCounterVec,
    rejected: IntCounterVec,
    reserved: IntCounterVec,
    completed: IntCounterVec,
    failed: IntCounterVec,
    reclaimed: IntCounter,
    evicted: IntCounter,
    attempts: HistogramVec,
    processing: HistogramVec,
    window: Mutex<ProcessingWindow>,
}

impl QueueMetrics {
    /// Create a collector with its own registry
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Create a collector on a shared registry
    pub fn with_registry(registry: Registry) -> Self {
        let enqueued = IntCounterVec::new(
            Opts::new("relayq_jobs_enqueued_total", "Jobs accepted by enqueue"),
            &["queue"],
        )
        .expect("Failed to create relayq_jobs_enqueued_total metric");

        let rejected = IntCounterVec::new(
            Opts::new("relayq_jobs_rejected_total", "Enqueue calls rejected"),
            &["code"],
        )
        .expect("Failed to create relayq_jobs_rejected_total metric");

        let reserved = IntCounterVec::new(
            Opts::new("relayq_jobs_reserved_total", "Jobs reserved by workers"),
            &["queue"],
        )
        .expect("Failed to create relayq_jobs_reserved_total metric");

        let completed = IntCounterVec::new(
            Opts::new("relayq_jobs_completed_total", "Jobs completed"),
            &["queue"],
        )
        .expect("Failed to create relayq_jobs_completed_total metric");

        let failed = IntCounterVec::new(
            Opts::new("relayq_jobs_failed_total", "Job failures"),
            &["queue", "will_retry"],
        )
        .expect("Failed to create relayq_jobs_failed_total metric");

        let reclaimed = IntCounter::new(
            "relayq_leases_reclaimed_total",
            "Leases recovered after expiry",
        )
        .expect("Failed to create relayq_leases_reclaimed_total metric");

        let evicted = IntCounter::new(
            "relayq_jobs_evicted_total",
            "Terminal jobs removed by retention",
        )
        .expect("Failed to create relayq_jobs_evicted_total metric");

        let attempts = HistogramVec::new(
            HistogramOpts::new("relayq_job_attempts", "Attempt number at reservation")
                .buckets(ATTEMPT_BUCKETS.to_vec()),
            &["queue"],
        )
        .expect("Failed to create relayq_job_attempts metric");

        let processing = HistogramVec::new(
            HistogramOpts::new(
                "relayq_job_processing_seconds",
                "Time from reservation to completion in seconds",
            )
            .buckets(PROCESSING_BUCKETS.to_vec()),
            &["queue"],
        )
        .expect("Failed to create relayq_job_processing_seconds metric");

        registry
            .register(Box::new(enqueued.clone()))
            .expect("Failed to register relayq_jobs_enqueued_total");
        registry
            .register(Box::new(rejected.clone()))
            .expect("Failed to register relayq_jobs_rejected_total");
        registry
            .register(Box::new(reserved.clone()))
            .expect("Failed to register relayq_jobs_reserved_total");
        registry
            .register(Box::new(completed.clone()))
            .expect("Failed to register relayq_jobs_completed_total");
        registry
            .register(Box::new(failed.clone()))
            .expect("Failed to register relayq_jobs_failed_total");
        registry
            .register(Box::new(reclaimed.clone()))
            .expect("Failed to register relayq_leases_reclaimed_total");
        registry
            .register(Box::new(evicted.clone()))
            .expect("Failed to register relayq_jobs_evicted_total");
        registry
            .register(Box::new(attempts.clone()))
            .expect("Failed to register relayq_job_attempts");
        registry
            .register(Box::new(processing.clone()))
            .expect("Failed to register relayq_job_processing_seconds");

        Self {
            inner: Arc::new(MetricsInner {
                registry,
                enqueued,
                rejected,
                reserved,
                completed,
                failed,
                reclaimed,
                evicted,
                attempts,
                processing,
                window: Mutex::new(ProcessingWindow::new(PROCESSING_WINDOW)),
            }),
        }
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn record_enqueued(&self, queue: &str) {
        self.inner.enqueued.with_label_values(&[queue]).inc();
    }

    pub fn record_rejected(&self, code: ErrorCode) {
        self.inner.rejected.with_label_values(&[code.as_str()]).inc();
    }

    /// Record a reservation (the start of an attempt)
    pub fn record_attempt(&self, attempt: &JobAttempt<'_>) {
        self.inner.reserved.with_label_values(&[attempt.queue]).inc();
        self.inner
            .attempts
            .with_label_values(&[attempt.queue])
            .observe(f64::from(attempt.attempts));

        tracing::info!(
            target: "relayq::metrics",
            event = "job_attempt",
            job_id = attempt.job_id,
            queue = attempt.queue,
            trace_id = attempt.trace_id,
            attempts = attempt.attempts,
            max_attempts = attempt.max_attempts,
            "job attempt started"
        );
    }

    pub fn record_completion(&self, attempt: &JobAttempt<'_>, processing: Duration) {
        self.inner.completed.with_label_values(&[attempt.queue]).inc();
        self.inner
            .processing
            .with_label_values(&[attempt.queue])
            .observe(processing.as_secs_f64());

        let millis = processing.as_secs_f64() * 1000.0;
        self.window().push(millis);

        tracing::info!(
            target: "relayq::metrics",
            event = "job_completed",
            job_id = attempt.job_id,
            queue = attempt.queue,
            trace_id = attempt.trace_id,
            attempts = attempt.attempts,
            max_attempts = attempt.max_attempts,
            processing_ms = millis,
            "job completed"
        );
    }

    pub fn record_failure(&self, attempt: &JobAttempt<'_>, will_retry: bool, error_code: &str) {
        let retry_label = if will_retry { "true" } else { "false" };
        self.inner
            .failed
            .with_label_values(&[attempt.queue, retry_label])
            .inc();

        let next_attempt_at = attempt.next_attempt_at.map(|at| at.to_rfc3339());
        tracing::info!(
            target: "relayq::metrics",
            event = "job_failed",
            job_id = attempt.job_id,
            queue = attempt.queue,
            trace_id = attempt.trace_id,
            attempts = attempt.attempts,
            max_attempts = attempt.max_attempts,
            next_attempt_at = next_attempt_at.as_deref(),
            will_retry,
            error_code,
            "job failed"
        );
    }

    pub fn record_reclaimed(&self, count: usize) {
        self.inner.reclaimed.inc_by(count as u64);
    }

    pub fn record_evicted(&self, count: usize) {
        self.inner.evicted.inc_by(count as u64);
    }

    /// Percentile over the recent processing window, in milliseconds.
    pub fn processing_percentile(&self, p: f64) -> Option<f64> {
        self.window().percentile(p)
    }

    pub fn snapshot(&self) -> ProcessingSnapshot {
        let window = self.window();
        ProcessingSnapshot {
            samples: window.len(),
            avg_ms: window.average(),
            p50_ms: window.percentile(50.0),
            p95_ms: window.percentile(95.0),
            p99_ms: window.percentile(99.0),
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    fn window(&self) -> std::sync::MutexGuard<'_, ProcessingWindow> {
        // Samples are plain floats, a poisoned guard is still usable.
        self.inner
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}
