//! Mapping of backend and configuration failures onto the error taxonomy.

use relayq_core::AppError;
use relayq_extras::config::ConfigError;

pub use relayq_core::Result;

pub(crate) fn lock_poisoned() -> AppError {
    AppError::internal("Queue state lock poisoned")
}

/// Misconfiguration surfaces as 503: the queue cannot serve until fixed.
pub fn config_error(err: ConfigError) -> AppError {
    AppError::service_unavailable("Queue is misconfigured").with_internal(err.to_string())
}

#[cfg(feature = "redis")]
pub(crate) fn redis_error(err: redis::RedisError) -> AppError {
    AppError::service_unavailable("Redis backend error").with_internal(err.to_string())
}
