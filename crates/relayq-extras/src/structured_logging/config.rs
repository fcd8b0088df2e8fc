//! Structured logging configuration types

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogOutputFormat {
    /// One JSON object per line, span fields included (default)
    #[default]
    Json,
    /// Multi-line human-readable output for development
    Pretty,
    /// Single-line human-readable output
    Compact,
}

impl std::str::FromStr for LogOutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" | "text" => Ok(Self::Compact),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Structured logging configuration
#[derive(Clone, Debug)]
pub struct StructuredLoggingConfig {
    /// Output format for logs
    pub format: LogOutputFormat,
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    /// Service name, logged once at startup
    pub service_name: String,
    /// Environment name (production, staging, etc.)
    pub environment: Option<String>,
    /// Whether to include file and line of the call site
    pub include_caller_info: bool,
    /// Whether to include the emitting thread name
    pub include_thread_names: bool,
}

impl Default for StructuredLoggingConfig {
    fn default() -> Self {
        Self {
            format: LogOutputFormat::default(),
            level: "info".to_string(),
            service_name: "relayq".to_string(),
            environment: None,
            include_caller_info: false,
            include_thread_names: false,
        }
    }
}

impl StructuredLoggingConfig {
    /// Create a new builder for StructuredLoggingConfig
    pub fn builder() -> StructuredLoggingConfigBuilder {
        StructuredLoggingConfigBuilder::default()
    }

    /// Create a config optimized for development
    pub fn development() -> Self {
        Self {
            format: LogOutputFormat::Pretty,
            level: "debug".to_string(),
            environment: Some("development".to_string()),
            include_caller_info: true,
            ..Default::default()
        }
    }

    /// Create a config optimized for production JSON logging
    pub fn production_json() -> Self {
        Self {
            format: LogOutputFormat::Json,
            level: "info".to_string(),
            environment: Some("production".to_string()),
            ..Default::default()
        }
    }

    /// Pick a preset from the deployment profile.
    #[cfg(feature = "config")]
    pub fn for_environment(env: &crate::config::Environment) -> Self {
        let mut config = if env.is_development() {
            Self::development()
        } else {
            Self::production_json()
        };
        config.level = env.default_log_level().to_string();
        config.environment = Some(env.as_str().to_string());
        config
    }
}

/// Builder for StructuredLoggingConfig
#[derive(Default)]
pub struct StructuredLoggingConfigBuilder {
    config: StructuredLoggingConfig,
}

impl StructuredLoggingConfigBuilder {
    /// Set the output format
    pub fn format(mut self, format: LogOutputFormat) -> Self {
        self.config.format = format;
        self
    }

    /// Set the fallback filter directive
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    /// Set the service name
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = name.into();
        self
    }

    /// Set the environment name
    pub fn environment(mut self, env: impl Into<String>) -> Self {
        self.config.environment = Some(env.into());
        self
    }

    /// Set whether to include caller info
    pub fn include_caller_info(mut self, include: bool) -> Self {
        self.config.include_caller_info = include;
        self
    }

    /// Set whether to include thread names
    pub fn include_thread_names(mut self, include: bool) -> Self {
        self.config.include_thread_names = include;
        self
    }

    /// Build the configuration
    pub fn build(self) -> StructuredLoggingConfig {
        self.config
    }
}
