//! Supporting pieces for relayq
//!
//! Each module sits behind its own feature so the queue crate only pulls in
//! what it uses:
//!
//! - `config` - `.env` loading and typed environment configuration
//! - `rate-limit` - fixed-window admission counters
//! - `structured-logging` - `tracing-subscriber` initialisation

#[cfg(feature = "config")]
pub mod config;

#[cfg(feature = "rate-limit")]
pub mod rate_limit;

#[cfg(feature = "structured-logging")]
pub mod structured_logging;

#[cfg(feature = "config")]
pub use config::{load_dotenv, Config, ConfigError, Environment};

#[cfg(feature = "rate-limit")]
pub use rate_limit::{Admission, FixedWindowLimiter};

#[cfg(feature = "structured-logging")]
pub use structured_logging::{LogOutputFormat, LoggingError, StructuredLoggingConfig};
