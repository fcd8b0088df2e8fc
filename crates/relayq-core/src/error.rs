//! Error taxonomy for relayq
//!
//! Every failure surfaced by a queue operation is an [`AppError`] carrying a
//! closed [`ErrorCode`]. Codes map to an HTTP status, a human title, a fix
//! hint, and retry guidance, so callers can turn any error into an
//! [`ErrorPayload`] without knowing where it came from.

use crate::trace::generate_trace_id;
use chrono::{DateTime, SecondsFormat, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result type alias for relayq operations
pub type Result<T, E = AppError> = std::result::Result<T, E>;

const PROBLEM_TYPE_BASE: &str = "https://relayq.dev/problems/";

/// Closed set of error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Admission control or backoff gate rejected the call
    RateLimited,
    /// An upstream provider ran out of quota
    ProviderQuotaExceeded,
    /// An upstream provider refused the work on policy grounds
    ProviderPolicyBlocked,
    /// Caller does not own the resource (e.g. not the lease holder)
    Forbidden,
    /// Job or lease does not exist
    ResourceNotFound,
    /// Input failed validation
    ValidationError,
    /// State conflict
    Conflict,
    /// Backend unreachable or misconfigured
    ServiceUnavailable,
    /// Anything else
    InternalServerError,
}

impl ErrorCode {
    /// Every code, in declaration order.
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::RateLimited,
        ErrorCode::ProviderQuotaExceeded,
        ErrorCode::ProviderPolicyBlocked,
        ErrorCode::Forbidden,
        ErrorCode::ResourceNotFound,
        ErrorCode::ValidationError,
        ErrorCode::Conflict,
        ErrorCode::ServiceUnavailable,
        ErrorCode::InternalServerError,
    ];

    /// Wire name, e.g. `RATE_LIMITED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::ProviderQuotaExceeded => "PROVIDER_QUOTA_EXCEEDED",
            Self::ProviderPolicyBlocked => "PROVIDER_POLICY_BLOCKED",
            Self::Forbidden => "FORBIDDEN",
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Conflict => "CONFLICT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited | Self::ProviderQuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ProviderPolicyBlocked | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ResourceNotFound => StatusCode::NOT_FOUND,
            Self::ValidationError => StatusCode::BAD_REQUEST,
            Self::Conflict => StatusCode::CONFLICT,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::RateLimited => "Too many requests",
            Self::ProviderQuotaExceeded => "Provider quota exceeded",
            Self::ProviderPolicyBlocked => "Blocked by provider policy",
            Self::Forbidden => "Access forbidden",
            Self::ResourceNotFound => "Resource not found",
            Self::ValidationError => "Validation error",
            Self::Conflict => "Conflicting state",
            Self::ServiceUnavailable => "Service unavailable",
            Self::InternalServerError => "Internal server error",
        }
    }

    /// Short remediation hint shown alongside the title.
    pub fn fix(&self) -> &'static str {
        match self {
            Self::RateLimited => "Back off for retryAfter seconds before resubmitting.",
            Self::ProviderQuotaExceeded => "Honor retryAfter and reduce batch size.",
            Self::ProviderPolicyBlocked => "Remove the flagged parameters and resubmit.",
            Self::Forbidden => "Only the current lease holder may act on this job.",
            Self::ResourceNotFound => "Check the job id; the job or its lease may have expired.",
            Self::ValidationError => "Check the request fields listed in violations.",
            Self::Conflict => "Reload the resource and retry the operation.",
            Self::ServiceUnavailable => "Check backend connectivity and configuration.",
            Self::InternalServerError => "Retry later; contact support if the issue persists.",
        }
    }

    /// Slug used in the problem type URI.
    fn slug(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate-limited",
            Self::ProviderQuotaExceeded => "provider-quota",
            Self::ProviderPolicyBlocked => "provider-policy",
            Self::Forbidden => "forbidden",
            Self::ResourceNotFound => "not-found",
            Self::ValidationError => "validation-error",
            Self::Conflict => "conflict",
            Self::ServiceUnavailable => "service-unavailable",
            Self::InternalServerError => "internal-error",
        }
    }

    pub fn problem_type(&self) -> String {
        format!("{}{}", PROBLEM_TYPE_BASE, self.slug())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ProviderQuotaExceeded
                | Self::ServiceUnavailable
                | Self::InternalServerError
        )
    }

    /// Default `retryAfter` (seconds) for retryable codes.
    pub fn default_retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited => Some(60),
            Self::ProviderQuotaExceeded => Some(3600),
            Self::ServiceUnavailable => Some(5),
            Self::InternalServerError => Some(30),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| UnknownErrorCode(s.to_string()))
    }
}

/// Returned when parsing a string that is not a known [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownErrorCode(pub String);

impl fmt::Display for UnknownErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown error code: {}", self.0)
    }
}

impl std::error::Error for UnknownErrorCode {}

/// Field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Field name (nested fields use dots: "retryPolicy.maxAttempts")
    pub field: String,
    /// Human-readable message
    pub message: String,
    /// Machine-readable rule name (e.g. "required", "range")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Standard relayq error type
#[derive(Debug, Clone)]
pub struct AppError {
    /// Taxonomy code
    pub code: ErrorCode,
    /// Human-readable detail for this occurrence
    pub detail: Option<String>,
    /// Seconds the caller should wait before retrying
    pub retry_after: Option<u64>,
    /// Field-level validation errors
    pub violations: Vec<Violation>,
    /// Correlation id
    pub trace_id: String,
    /// When the error was raised
    pub timestamp: DateTime<Utc>,
    /// Internal details (driver messages and the like), never serialized
    pub(crate) internal: Option<String>,
}

impl AppError {
    /// Create a new error. Retryable codes start with their default `retry_after`.
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            code,
            detail: (!detail.is_empty()).then_some(detail),
            retry_after: code.default_retry_after(),
            violations: Vec::new(),
            trace_id: generate_trace_id(),
            timestamp: Utc::now(),
            internal: None,
        }
    }

    /// 429 with an explicit wait in seconds
    pub fn rate_limited(detail: impl Into<String>, retry_after: u64) -> Self {
        Self::new(ErrorCode::RateLimited, detail).with_retry_after(retry_after)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceNotFound, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, detail)
    }

    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalServerError, detail)
    }

    /// Create a validation error with field details
    pub fn validation(violations: Vec<Violation>) -> Self {
        let mut err = Self::new(ErrorCode::ValidationError, "Request validation failed");
        err.violations = violations;
        err
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Add internal details (for logging, never part of the payload)
    pub fn with_internal(mut self, details: impl Into<String>) -> Self {
        self.internal = Some(details.into());
        self
    }

    pub fn internal_details(&self) -> Option<&str> {
        self.internal.as_deref()
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Build the serializable payload for this error.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            problem_type: self.code.problem_type(),
            code: self.code,
            status: self.code.status().as_u16(),
            title: self.code.title().to_string(),
            detail: self.detail.clone(),
            fix: self.code.fix().to_string(),
            retry_after: self.retry_after,
            violations: (!self.violations.is_empty()).then(|| self.violations.clone()),
            trace_id: self.trace_id.clone(),
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.code, detail),
            None => write!(f, "{}: {}", self.code, self.code.title()),
        }
    }
}

impl std::error::Error for AppError {}

/// Wire representation of an [`AppError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub code: ErrorCode,
    pub status: u16,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub fix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<Violation>>,
    pub trace_id: String,
    pub timestamp: String,
}

impl From<AppError> for ErrorPayload {
    fn from(err: AppError) -> Self {
        err.to_payload()
    }
}

// Stored records that fail to (de)serialize are an internal fault.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::internal("Stored record could not be decoded").with_internal(err.to_string())
    }
}
