//! Resilience core shared across PromptArc crates.
//!
//! Every failure the application observes is turned into one canonical
//! [`ClassifiedError`], and every fallible asynchronous unit of work can be
//! wrapped in classification-aware retry, a circuit breaker, or a bounded
//! batch of retries.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error taxonomy, error factory, serde helpers
//! - `observability`: structured `tracing` output for classified errors
//! - `runtime` (default): retry driver, circuit breaker, batch coordinator,
//!   settings

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod resilience;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{
    classify, from_response, ClassifiedError, ClassifiedErrorBuilder, ContextOverrides,
    ErrorClassification, ErrorContext, ErrorDiagnostics, ErrorKind, Failure, FieldOverride,
    RetryPolicySnapshot, Severity,
};
#[cfg(feature = "runtime")]
pub use resilience::{
    retry, run_batch, BatchItem, BatchResults, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitState, Clock, ConfigError,
    ConfigResult, MockClock, ResilienceSettings, RetryCondition, RetryConfig, RetryConfigBuilder,
    RetryExecutor, RetrySuccess, SystemClock,
};
#[cfg(feature = "foundation")]
pub use utils::serde::duration_millis;
