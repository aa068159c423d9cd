//! Canonical error taxonomy for PromptArc
//!
//! Every failure the application observes ends up as exactly one
//! [`ClassifiedError`]: a kind-tagged, immutable value carrying severity,
//! retryability, a pre-baked user message and an owned [`ErrorContext`].
//!
//! # Error Handling Architecture
//!
//! 1. **[`ErrorKind`]**: a closed sum type. Each kind supplies defaults for
//!    severity, retryability, user message and retry policy.
//!
//! 2. **[`ClassifiedError`]**: the single error type surfaced to callers.
//!    Kind-specific constructors (`network`, `api_with_status`,
//!    `validation_field`, ...) pre-seed the per-kind defaults; the builder
//!    lets callers override any of them.
//!
//! 3. **Error factory** ([`classify`], [`from_response`]): turns arbitrary
//!    caught failures and HTTP-like responses into a `ClassifiedError`.
//!    Classification is idempotent: an already classified error comes back
//!    unchanged.
//!
//! ## Kind Defaults
//!
//! | Kind | Retryable | Severity |
//! |------|-----------|----------|
//! | **Network** | yes | Medium |
//! | **Api** | yes | Medium |
//! | **Validation** | no | Low |
//! | **Storage** | no | High |
//! | **Timeout** | yes | Medium |
//! | **Permission** | no | Medium |
//! | **RateLimit** | yes | Medium |
//! | **Authentication** | no | High |
//! | **Unknown** | no | Medium |
//!
//! ## Messages
//!
//! `message()` is for logs and diagnostics. `user_message()` is the
//! non-technical text a UI renders; it never echoes the internal message
//! unless a caller sets it explicitly.
//!
//! ## Serialization
//!
//! [`ClassifiedError::to_diagnostics`] is the only stable shape for logging
//! and telemetry.
//!
//! ```rust
//! use promptarc_common::error::{ClassifiedError, ErrorClassification, ErrorKind};
//!
//! let err = ClassifiedError::api_with_status("upstream exploded", 503);
//! assert_eq!(err.kind(), ErrorKind::Api);
//! assert!(err.is_retryable());
//! assert_eq!(err.code(), Some("HTTP_503"));
//! ```

mod context;
mod factory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use self::context::{ContextOverrides, ErrorContext, FieldOverride, Metadata};
pub use self::factory::{classify, from_response, parse_retry_after, Failure};
use crate::utils::serde::duration_millis;

/// Standard result type using ClassifiedError
pub type ClassifiedResult<T> = Result<T, ClassifiedError>;

/// Shared handle to the original failure, kept for diagnostics only
pub type SharedCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Code carried by errors raised when a retry invocation is cancelled
pub const ABORTED_CODE: &str = "ABORTED";

/// Code carried by errors raised when a circuit breaker rejects a call
pub const CIRCUIT_OPEN_CODE: &str = "CIRCUIT_OPEN";

/// Closed set of failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Connectivity failure: refused, reset or unreachable
    Network,
    /// Upstream service answered with a failure
    Api,
    /// Caller input was rejected
    Validation,
    /// Local persistence failed
    Storage,
    /// An operation exceeded its deadline
    Timeout,
    /// The caller may not perform the action
    Permission,
    /// The upstream asked us to slow down
    RateLimit,
    /// Credentials were missing or refused
    Authentication,
    /// Anything that fits no other kind
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration order
    pub const ALL: [Self; 9] = [
        Self::Network,
        Self::Api,
        Self::Validation,
        Self::Storage,
        Self::Timeout,
        Self::Permission,
        Self::RateLimit,
        Self::Authentication,
        Self::Unknown,
    ];

    /// Severity assigned when a constructor does not override it
    pub const fn default_severity(self) -> Severity {
        match self {
            Self::Storage | Self::Authentication => Severity::High,
            Self::Validation => Severity::Low,
            _ => Severity::Medium,
        }
    }

    /// Transient kinds are retryable unless a constructor says otherwise
    pub const fn is_retryable_by_default(self) -> bool {
        matches!(self, Self::Network | Self::Api | Self::Timeout | Self::RateLimit)
    }

    /// Non-technical text shown to users when no override is given
    pub const fn default_user_message(self) -> &'static str {
        match self {
            Self::Network => {
                "Network connection failed. Please check your internet connection and try again."
            }
            Self::Api => "The service is temporarily unavailable. Please try again later.",
            Self::Validation => "Please check your input and try again.",
            Self::Storage => "Failed to save data. Please check your available storage space.",
            Self::Timeout => "The request took too long to complete. Please try again.",
            Self::Permission => "You don't have permission to perform this action.",
            Self::RateLimit => "Too many requests. Please wait a moment before trying again.",
            Self::Authentication => "Authentication failed. Please check your credentials.",
            Self::Unknown => "An unexpected error occurred. Please try again.",
        }
    }

    /// Type-style name reported in diagnostics (`NetworkError`, ...)
    pub const fn error_name(self) -> &'static str {
        match self {
            Self::Network => "NetworkError",
            Self::Api => "ApiError",
            Self::Validation => "ValidationError",
            Self::Storage => "StorageError",
            Self::Timeout => "TimeoutError",
            Self::Permission => "PermissionError",
            Self::RateLimit => "RateLimitError",
            Self::Authentication => "AuthenticationError",
            Self::Unknown => "UnknownError",
        }
    }

    /// Short token used in structured log fields
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Api => "api",
            Self::Validation => "validation",
            Self::Storage => "storage",
            Self::Timeout => "timeout",
            Self::Permission => "permission",
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity levels, ordered low to critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Retry hints a caller may consult before resubmitting a failed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicySnapshot {
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicySnapshot {
    pub const fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self { max_retries, initial_delay, max_delay, backoff_multiplier }
    }

    /// Policy pre-seeded for a kind, if that kind is worth retrying at all
    pub fn default_for(kind: ErrorKind) -> Option<Self> {
        match kind {
            ErrorKind::Network | ErrorKind::Api => {
                Some(Self::new(3, Duration::from_secs(1), Duration::from_secs(10), 2.0))
            }
            ErrorKind::Timeout => {
                Some(Self::new(2, Duration::from_secs(2), Duration::from_secs(10), 2.0))
            }
            ErrorKind::RateLimit => Some(Self::rate_limited(None)),
            _ => None,
        }
    }

    /// Rate-limit policy: wait the server-provided delay, else a minute
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        let initial = retry_after.unwrap_or(Duration::from_secs(60));
        Self::new(3, initial, initial.max(Duration::from_secs(60)), 1.0)
    }
}

/// The canonical error value
///
/// Instances are immutable: every `with_*` method returns a new error and
/// leaves the receiver untouched.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    user_message: String,
    severity: Severity,
    retryable: bool,
    code: Option<String>,
    retry_policy: Option<RetryPolicySnapshot>,
    retry_after: Option<Duration>,
    context: ErrorContext,
    cause: Option<SharedCause>,
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl ClassifiedError {
    /// Start building an error of the given kind
    pub fn builder<S: Into<String>>(kind: ErrorKind, message: S) -> ClassifiedErrorBuilder {
        ClassifiedErrorBuilder::new(kind, message)
    }

    /// Create an error with every per-kind default
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self::builder(kind, message).build()
    }

    /// Connectivity failure
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Upstream service failure without a known status
    pub fn api<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Api, message)
    }

    /// Upstream service failure with a protocol status
    ///
    /// Retryable only for server-side (5xx) statuses.
    pub fn api_with_status<S: Into<String>>(message: S, status: u16) -> Self {
        let retryable = status >= 500;
        let mut builder = Self::builder(ErrorKind::Api, message)
            .retryable(retryable)
            .code(format!("HTTP_{status}"))
            .context(ContextOverrides::new().status_code(status));
        if !retryable {
            builder = builder.no_retry_policy();
        }
        builder.build()
    }

    /// Rejected input; never retried
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Validation failure attributed to one input field
    pub fn validation_field<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::builder(ErrorKind::Validation, message)
            .context(ContextOverrides::new().metadata_entry("field", field.into()))
            .build()
    }

    /// Persistence failure, high severity
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    /// Deadline exceeded; retried with a slower policy than network errors
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Timeout that records the deadline which was exceeded
    pub fn timeout_after<S: Into<String>>(message: S, limit: Duration) -> Self {
        let limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        Self::builder(ErrorKind::Timeout, message)
            .context(ContextOverrides::new().metadata_entry("timeoutMs", limit_ms))
            .build()
    }

    /// Action not allowed for this caller
    pub fn permission<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    /// Rate-limit rejection without a server-provided wait
    pub fn rate_limit<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    /// Rate-limit rejection with a server-provided wait in seconds
    pub fn rate_limit_after<S: Into<String>>(message: S, retry_after_secs: u64) -> Self {
        let wait = Duration::from_secs(retry_after_secs);
        Self::builder(ErrorKind::RateLimit, message)
            .retry_after(wait)
            .retry_policy(RetryPolicySnapshot::rate_limited(Some(wait)))
            .build()
    }

    /// Credentials refused; high severity and never retried
    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    /// Unclassifiable failure with the `Unknown` defaults
    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Raised when a retry invocation observes cancellation
    pub fn aborted() -> Self {
        Self::builder(ErrorKind::Unknown, "Operation was aborted")
            .retryable(false)
            .code(ABORTED_CODE)
            .user_message("The operation was cancelled.")
            .build()
    }

    /// Raised by an open circuit breaker without invoking the operation
    pub fn circuit_open(retry_after: Option<Duration>) -> Self {
        let mut builder = Self::builder(ErrorKind::Api, "Circuit breaker is open")
            .retryable(false)
            .code(CIRCUIT_OPEN_CODE)
            .no_retry_policy()
            .user_message(
                "The service is temporarily unavailable. Please wait a moment and try again.",
            );
        if let Some(wait) = retry_after {
            builder = builder.retry_after(wait);
        }
        builder.build()
    }

    /// Category of this failure
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Internal message, for logs and diagnostics only
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Non-technical text safe to render to an end user
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Machine-readable code such as `HTTP_503` or `ABORTED`
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Retry hints for callers that resubmit the failed request
    pub fn retry_policy(&self) -> Option<&RetryPolicySnapshot> {
        self.retry_policy.as_ref()
    }

    /// Diagnostic context captured at classification time
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// The original failure, if one was captured
    pub fn cause(&self) -> Option<&SharedCause> {
        self.cause.as_ref()
    }

    /// True for the error a cancelled retry invocation returns
    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Unknown && self.code() == Some(ABORTED_CODE)
    }

    /// True for the rejection of an open circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::Api && self.code() == Some(CIRCUIT_OPEN_CODE)
    }

    /// Copy of this error whose context records `count` prior attempts
    pub fn with_retry_count(&self, count: u32) -> Self {
        let mut next = self.clone();
        next.context.retry_count = count;
        next
    }

    /// Copy of this error with `overrides` merged into its context
    pub fn with_context(&self, overrides: &ContextOverrides) -> Self {
        let mut next = self.clone();
        overrides.apply(&mut next.context);
        next
    }

    /// Copy of this error with a different user-facing message
    pub fn with_user_message<S: Into<String>>(&self, user_message: S) -> Self {
        let mut next = self.clone();
        next.user_message = user_message.into();
        next
    }

    /// Copy of this error with a different severity
    pub fn with_severity(&self, severity: Severity) -> Self {
        let mut next = self.clone();
        next.severity = severity;
        next
    }

    /// Copy of this error with `code` set
    pub fn with_code<S: Into<String>>(&self, code: S) -> Self {
        let mut next = self.clone();
        next.code = Some(code.into());
        next
    }

    /// Copy of this error with its retry hints replaced or removed
    pub fn with_retry_policy(&self, policy: Option<RetryPolicySnapshot>) -> Self {
        let mut next = self.clone();
        next.retry_policy = policy;
        next
    }

    /// Copy of this error with `cause` attached for diagnostics
    pub fn with_cause(&self, cause: SharedCause) -> Self {
        let mut next = self.clone();
        next.cause = Some(cause);
        next
    }

    /// Plain-data snapshot; the sole serialization contract for telemetry
    pub fn to_diagnostics(&self) -> ErrorDiagnostics {
        ErrorDiagnostics {
            name: self.kind.error_name().to_string(),
            kind: self.kind,
            severity: self.severity,
            message: self.message.clone(),
            user_message: self.user_message.clone(),
            code: self.code.clone(),
            retryable: self.retryable,
            context: self.context.clone(),
            stack: self.cause.as_deref().map(render_cause_chain),
        }
    }

    /// Key/value pairs suitable for structured logging
    pub fn as_tracing_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("error_kind", self.kind.as_str().to_string()),
            ("severity", self.severity.to_string()),
            ("retryable", self.retryable.to_string()),
            ("retry_count", self.context.retry_count.to_string()),
        ];
        if let Some(code) = &self.code {
            fields.push(("code", code.clone()));
        }
        if let Some(component) = &self.context.component {
            fields.push(("component", component.clone()));
        }
        if let Some(operation) = &self.context.operation {
            fields.push(("operation", operation.clone()));
        }
        if let Some(status) = self.context.status_code {
            fields.push(("status_code", status.to_string()));
        }
        if let Some(error_id) = &self.context.error_id {
            fields.push(("error_id", error_id.clone()));
        }
        fields
    }

    /// Emit one tracing event at a level matching the severity
    #[cfg(feature = "observability")]
    pub fn log(&self) {
        macro_rules! emit {
            ($level:ident, $err:expr) => {
                tracing::$level!(
                    error_kind = $err.kind.as_str(),
                    severity = %$err.severity,
                    code = ?$err.code,
                    retryable = $err.retryable,
                    retry_count = $err.context.retry_count,
                    component = ?$err.context.component,
                    operation = ?$err.context.operation,
                    "{}",
                    $err.message
                )
            };
        }

        match self.severity {
            Severity::Low => emit!(debug, self),
            Severity::Medium => emit!(warn, self),
            Severity::High | Severity::Critical => emit!(error, self),
        }
    }
}

fn render_cause_chain(cause: &(dyn std::error::Error + Send + Sync + 'static)) -> String {
    let mut rendered = cause.to_string();
    let mut next = cause.source();
    while let Some(inner) = next {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&inner.to_string());
        next = inner.source();
    }
    rendered
}

/// Builder for [`ClassifiedError`]; unset fields fall back to kind defaults
#[derive(Debug)]
pub struct ClassifiedErrorBuilder {
    kind: ErrorKind,
    message: String,
    user_message: Option<String>,
    severity: Option<Severity>,
    retryable: Option<bool>,
    code: Option<String>,
    retry_policy: FieldOverride<RetryPolicySnapshot>,
    retry_after: Option<Duration>,
    overrides: ContextOverrides,
    cause: Option<SharedCause>,
}

impl ClassifiedErrorBuilder {
    /// Start from the defaults of `kind`
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            user_message: None,
            severity: None,
            retryable: None,
            code: None,
            retry_policy: FieldOverride::Keep,
            retry_after: None,
            overrides: ContextOverrides::default(),
            cause: None,
        }
    }

    /// Override the kind's default user message
    pub fn user_message<S: Into<String>>(mut self, user_message: S) -> Self {
        self.user_message = Some(user_message.into());
        self
    }

    /// Override the kind's default severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Override the kind's default retryability
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Attach a machine-readable code
    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Replace the kind's default retry policy
    pub fn retry_policy(mut self, policy: RetryPolicySnapshot) -> Self {
        self.retry_policy = FieldOverride::Set(policy);
        self
    }

    /// Drop the kind's default retry policy
    pub fn no_retry_policy(mut self) -> Self {
        self.retry_policy = FieldOverride::Clear;
        self
    }

    /// Suggested wait before retrying
    pub fn retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    /// Layer context overrides; later calls win field by field
    pub fn context(mut self, overrides: ContextOverrides) -> Self {
        self.overrides = self.overrides.merged_with(&overrides);
        self
    }

    /// Attach the original failure
    pub fn cause(mut self, cause: SharedCause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Resolve every unset field from the kind defaults
    pub fn build(self) -> ClassifiedError {
        let retryable = self.retryable.unwrap_or_else(|| self.kind.is_retryable_by_default());
        let mut context = ErrorContext::new(retryable);
        self.overrides.apply(&mut context);

        ClassifiedError {
            kind: self.kind,
            user_message: self
                .user_message
                .unwrap_or_else(|| self.kind.default_user_message().to_string()),
            severity: self.severity.unwrap_or_else(|| self.kind.default_severity()),
            retryable,
            code: self.code,
            retry_policy: self.retry_policy.resolve(RetryPolicySnapshot::default_for(self.kind)),
            retry_after: self.retry_after,
            context,
            cause: self.cause,
            message: self.message,
        }
    }
}

/// Plain-data snapshot of a [`ClassifiedError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDiagnostics {
    pub name: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub user_message: String,
    pub code: Option<String>,
    pub retryable: bool,
    pub context: ErrorContext,
    /// Rendered cause chain of the original failure
    pub stack: Option<String>,
}

/// Error classification trait for consistent handling across modules
///
/// Lets retry logic, UI banners and monitoring ask the same questions of any
/// error type.
pub trait ErrorClassification {
    /// Can the failed operation reasonably be attempted again?
    fn is_retryable(&self) -> bool;

    /// How serious is this error?
    fn severity(&self) -> Severity;

    /// Does this error require immediate attention?
    fn is_critical(&self) -> bool;

    /// Suggested wait before retrying, e.g. from a `Retry-After` header
    fn retry_after(&self) -> Option<Duration>;
}

impl ErrorClassification for ClassifiedError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}
