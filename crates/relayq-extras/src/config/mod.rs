//! Configuration loading from the environment.
//!
//! Values come from process environment variables, optionally seeded from a
//! `.env` file. Typed settings are deserialized with `envy`, so a field
//! `max_queue_size` under prefix `RELAYQ` reads `RELAYQ_MAX_QUEUE_SIZE`.
//!
//! # Example
//!
//! ```ignore
//! use relayq_extras::config::{Config, load_dotenv};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct WorkerSettings {
//!     #[serde(default)]
//!     poll_interval_ms: u64,
//! }
//!
//! load_dotenv();
//! let settings = Config::<WorkerSettings>::from_env_prefixed("RELAYQ")?;
//! ```

use serde::de::DeserializeOwned;
use std::fmt;
use thiserror::Error;

/// Variable that selects the deployment profile.
pub const ENVIRONMENT_VAR: &str = "RELAYQ_ENV";

/// Error type for configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable deserialization failed.
    #[error("Configuration error: {0}")]
    Envy(#[from] envy::Error),
    /// A value was present but unusable.
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Deployment profile, detected from `RELAYQ_ENV`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    /// Verbose logging, human-readable output.
    Development,
    /// JSON logs at `info`.
    Production,
    /// Any other profile name (staging, ci, ...).
    Custom(String),
}

impl Environment {
    /// Detect the current environment.
    ///
    /// `production`/`prod` map to `Production`, `development`/`dev` or an
    /// unset variable map to `Development`, anything else is `Custom`.
    pub fn current() -> Self {
        match std::env::var(ENVIRONMENT_VAR).as_deref() {
            Ok("production") | Ok("prod") => Self::Production,
            Ok("development") | Ok("dev") | Err(_) => Self::Development,
            Ok(other) => Self::Custom(other.to_string()),
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Default log level for this profile.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Self::Development => "debug",
            Self::Production | Self::Custom(_) => "info",
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed configuration deserialized from environment variables.
#[derive(Debug, Clone)]
pub struct Config<T>(pub T);

impl<T: DeserializeOwned> Config<T> {
    /// Load from unprefixed environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config(envy::from_env::<T>()?))
    }

    /// Load from variables starting with `{prefix}_`.
    pub fn from_env_prefixed(prefix: &str) -> Result<Self, ConfigError> {
        Ok(Config(envy::prefixed(format!("{}_", prefix)).from_env::<T>()?))
    }

    /// Load from an explicit iterator of `(name, value)` pairs, e.g. in tests.
    pub fn from_iter<I>(prefix: &str, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(Config(
            envy::prefixed(format!("{}_", prefix)).from_iter::<_, T>(vars)?,
        ))
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::ops::Deref for Config<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Load variables from `.env` in the current directory.
///
/// A missing file is not an error and existing variables are never
/// overridden.
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "loaded .env");
    }
}

/// Load variables from a specific file.
pub fn load_dotenv_from<P: AsRef<std::path::Path>>(path: P) {
    let _ = dotenvy::from_path(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;

    #[test]
    #[serial]
    fn environment_defaults_to_development() {
        std::env::remove_var(ENVIRONMENT_VAR);
        let env = Environment::current();
        assert!(env.is_development());
        assert_eq!(env.default_log_level(), "debug");
    }

    #[test]
    #[serial]
    fn environment_detects_production_aliases() {
        for value in ["production", "prod"] {
            std::env::set_var(ENVIRONMENT_VAR, value);
            assert!(Environment::current().is_production());
        }
        std::env::remove_var(ENVIRONMENT_VAR);
    }

    #[test]
    #[serial]
    fn environment_keeps_custom_names() {
        std::env::set_var(ENVIRONMENT_VAR, "staging");
        let env = Environment::current();
        assert_eq!(env, Environment::Custom("staging".to_string()));
        assert_eq!(env.to_string(), "staging");
        assert_eq!(env.default_log_level(), "info");
        std::env::remove_var(ENVIRONMENT_VAR);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct PoolSettings {
        url: String,
        #[serde(default = "default_size")]
        size: u32,
    }

    fn default_size() -> u32 {
        4
    }

    #[test]
    #[serial]
    fn prefixed_env_fills_fields_and_defaults() {
        std::env::set_var("RQTEST_URL", "redis://localhost:6379");
        std::env::remove_var("RQTEST_SIZE");

        let config = Config::<PoolSettings>::from_env_prefixed("RQTEST").unwrap();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.size, 4);

        std::env::remove_var("RQTEST_URL");
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let result = Config::<PoolSettings>::from_iter("RQTEST", Vec::new());
        assert!(matches!(result, Err(ConfigError::Envy(_))));
    }

    #[test]
    fn from_iter_parses_numbers() {
        let vars = vec![
            ("RQTEST_URL".to_string(), "redis://cache".to_string()),
            ("RQTEST_SIZE".to_string(), "16".to_string()),
        ];
        let config = Config::<PoolSettings>::from_iter("RQTEST", vars).unwrap();
        assert_eq!(
            config.into_inner(),
            PoolSettings {
                url: "redis://cache".to_string(),
                size: 16
            }
        );
    }
}
