//! Queue configuration from `RELAYQ_*` environment variables.

use crate::backend::fake::Simulation;
use crate::backend::{Backend, ProviderConfig};
use relayq_extras::config::{load_dotenv, Config, ConfigError};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Prefix shared by every queue variable.
pub const ENV_PREFIX: &str = "RELAYQ";

fn backend_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Backend, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_rate_limit_per_minute() -> u32 {
    60
}

fn default_rate_limit_per_request() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_visibility_timeout_ms() -> u64 {
    30_000
}

fn default_idempotency_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_job_ttl_secs() -> u64 {
    3600
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_reap_interval_ms() -> u64 {
    60_000
}

fn default_key_prefix() -> String {
    "relayq:".to_string()
}

fn default_test_double_latency_ms() -> u64 {
    10
}

fn default_test_double_seed() -> u64 {
    42
}

/// Everything needed to build a queue and its maintenance task.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueSettings {
    #[serde(default, deserialize_with = "backend_from_str")]
    pub backend: Backend,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_rate_limit_per_request")]
    pub rate_limit_per_request: u32,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,
    /// Terminal jobs older than this are evicted by the reaper
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_test_double_latency_ms")]
    pub test_double_latency_ms: u64,
    #[serde(default)]
    pub test_double_failure_rate: f64,
    #[serde(default = "default_test_double_seed")]
    pub test_double_seed: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_per_request: default_rate_limit_per_request(),
            default_max_attempts: default_max_attempts(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            job_ttl_secs: default_job_ttl_secs(),
            retention_secs: default_retention_secs(),
            reap_interval_ms: default_reap_interval_ms(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            test_double_latency_ms: default_test_double_latency_ms(),
            test_double_failure_rate: 0.0,
            test_double_seed: default_test_double_seed(),
        }
    }
}

impl QueueSettings {
    /// Load `.env` if present, then read `RELAYQ_*` from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        let settings = Config::<Self>::from_env_prefixed(ENV_PREFIX)?.into_inner();
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from explicit `(name, value)` pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let settings = Config::<Self>::from_iter(ENV_PREFIX, vars)?.into_inner();
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent", "must be at least 1"));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::invalid("max_queue_size", "must be at least 1"));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::invalid("default_max_attempts", "must be at least 1"));
        }
        if self.visibility_timeout_ms == 0 {
            return Err(ConfigError::invalid("visibility_timeout_ms", "must be positive"));
        }
        if self.reap_interval_ms == 0 {
            return Err(ConfigError::invalid("reap_interval_ms", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.test_double_failure_rate) {
            return Err(ConfigError::invalid(
                "test_double_failure_rate",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.backend == Backend::Durable && self.redis_url.is_none() {
            return Err(ConfigError::invalid(
                "redis_url",
                "required when backend is durable",
            ));
        }
        Ok(())
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            max_concurrent: self.max_concurrent,
            max_queue_size: self.max_queue_size,
            rate_limit_per_minute: self.rate_limit_per_minute,
            rate_limit_per_request: self.rate_limit_per_request,
            default_max_attempts: self.default_max_attempts,
            visibility_timeout: self.visibility_timeout(),
            idempotency_ttl: Duration::from_secs(self.idempotency_ttl_secs),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn simulation(&self) -> Simulation {
        Simulation {
            latency: Duration::from_millis(self.test_double_latency_ms),
            failure_rate: self.test_double_failure_rate,
        }
    }
}
