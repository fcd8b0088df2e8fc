//! Job-scoped log context.
//!
//! Queue operations run inside a [`job_span`] so every event they emit
//! carries the job id, queue, trace id, worker and attempt counters without
//! repeating them at each call site.

use crate::error::AppError;
use tracing::field::Empty;
use tracing::Span;

/// Fields attached to every log line about a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobLogContext {
    pub job_id: String,
    pub queue: String,
    pub trace_id: String,
    pub worker_id: Option<String>,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobLogContext {
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

/// Open a span carrying the job's correlation fields.
pub fn job_span(ctx: &JobLogContext) -> Span {
    let span = tracing::info_span!(
        "job",
        job_id = %ctx.job_id,
        queue = %ctx.queue,
        trace_id = %ctx.trace_id,
        worker_id = Empty,
        attempt = ctx.attempt,
        max_attempts = ctx.max_attempts,
    );
    if let Some(worker_id) = &ctx.worker_id {
        span.record("worker_id", worker_id.as_str());
    }
    span
}

/// Emit an error at a level matching its status class.
///
/// Client-side codes (4xx) log at `warn`, server-side codes at `error`.
pub fn log_app_error(err: &AppError, operation: &str) {
    let status = err.status().as_u16();
    let internal = err.internal_details().unwrap_or("");
    if err.status().is_server_error() {
        tracing::error!(
            operation,
            code = %err.code,
            status,
            trace_id = %err.trace_id,
            retry_after = err.retry_after,
            internal,
            "{}",
            err
        );
    } else {
        tracing::warn!(
            operation,
            code = %err.code,
            status,
            trace_id = %err.trace_id,
            retry_after = err.retry_after,
            "{}",
            err
        );
    }
}
