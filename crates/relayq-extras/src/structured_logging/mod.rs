//! Structured logging setup
//!
//! Installs a global `tracing-subscriber` with an `EnvFilter` and the chosen
//! output format. Queue code logs inside job spans (see
//! `relayq_core::logging::job_span`), and the JSON format keeps those span
//! fields on every line, so a single job can be followed by `job_id` or
//! `trace_id`.
//!
//! # Example
//!
//! ```ignore
//! use relayq_extras::structured_logging::{LogOutputFormat, StructuredLoggingConfig};
//!
//! StructuredLoggingConfig::builder()
//!     .format(LogOutputFormat::Json)
//!     .service_name("relayq-worker")
//!     .build()
//!     .init()?;
//! ```

mod config;

pub use config::{LogOutputFormat, StructuredLoggingConfig, StructuredLoggingConfigBuilder};

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

impl StructuredLoggingConfig {
    /// Build the filter: `RUST_LOG` wins, otherwise `self.level`.
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| LoggingError::InvalidFilter {
            directive: self.level.clone(),
            reason: e.to_string(),
        })
    }

    /// Install this configuration as the global subscriber.
    pub fn init(&self) -> Result<(), LoggingError> {
        let filter = self.env_filter()?;
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_file(self.include_caller_info)
            .with_line_number(self.include_caller_info)
            .with_thread_names(self.include_thread_names);

        let installed = match self.format {
            LogOutputFormat::Json => builder
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .try_init(),
            LogOutputFormat::Pretty => builder.pretty().try_init(),
            LogOutputFormat::Compact => builder.compact().try_init(),
        };
        installed.map_err(|_| LoggingError::AlreadyInitialized)?;

        tracing::info!(
            service = %self.service_name,
            environment = self.environment.as_deref().unwrap_or("unknown"),
            format = ?self.format,
            "logging initialised"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_pick_formats() {
        assert_eq!(StructuredLoggingConfig::development().format, LogOutputFormat::Pretty);
        assert_eq!(
            StructuredLoggingConfig::production_json().format,
            LogOutputFormat::Json
        );
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = StructuredLoggingConfig::builder()
            .format(LogOutputFormat::Compact)
            .level("relayq_jobs=trace")
            .service_name("relayq-worker")
            .environment("staging")
            .include_caller_info(true)
            .build();

        assert_eq!(config.format, LogOutputFormat::Compact);
        assert_eq!(config.level, "relayq_jobs=trace");
        assert_eq!(config.service_name, "relayq-worker");
        assert_eq!(config.environment.as_deref(), Some("staging"));
        assert!(config.include_caller_info);
    }

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!("JSON".parse::<LogOutputFormat>(), Ok(LogOutputFormat::Json));
        assert_eq!("text".parse::<LogOutputFormat>(), Ok(LogOutputFormat::Compact));
        assert!("xml".parse::<LogOutputFormat>().is_err());
    }

    #[test]
    fn second_init_reports_already_initialized() {
        let config = StructuredLoggingConfig::builder()
            .format(LogOutputFormat::Compact)
            .level("warn")
            .build();
        // Another test may have installed one first; either way the second call fails.
        let _ = config.init();
        assert!(matches!(config.init(), Err(LoggingError::AlreadyInitialized)));
    }

    #[cfg(feature = "config")]
    #[test]
    fn environment_preset_uses_profile_level() {
        use crate::config::Environment;

        let prod = StructuredLoggingConfig::for_environment(&Environment::Production);
        assert_eq!(prod.format, LogOutputFormat::Json);
        assert_eq!(prod.level, "info");

        let dev = StructuredLoggingConfig::for_environment(&Environment::Development);
        assert_eq!(dev.format, LogOutputFormat::Pretty);
        assert_eq!(dev.level, "debug");
    }
}
