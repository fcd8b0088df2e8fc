//! Core types for relayq
//!
//! This crate holds what every other relayq crate shares: the error
//! taxonomy and its wire payload, trace id generation, job-scoped logging
//! spans, and the queue metrics collector.

pub mod error;
pub mod logging;
pub mod metrics;
pub mod trace;

pub use error::{AppError, ErrorCode, ErrorPayload, Result, Violation};
pub use logging::{job_span, log_app_error, JobLogContext};
pub use metrics::{JobAttempt, ProcessingSnapshot, QueueMetrics};
pub use trace::generate_trace_id;
