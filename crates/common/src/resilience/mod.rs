//! Resilience patterns built on the error taxonomy
//!
//! - **Retry driver** ([`retry`], [`RetryExecutor`]): repeats an operation
//!   with exponential backoff, additive jitter and cooperative cancellation,
//!   deciding on the classified form of each failure.
//! - **Circuit breaker** ([`CircuitBreaker`]): wraps the retry driver and
//!   stops calling a resource after consecutive terminal failures, probing
//!   once per cooldown.
//! - **Batch coordinator** ([`run_batch`]): fans many retry invocations out
//!   with a concurrency cap and per-item isolation.
//! - **Settings** ([`ResilienceSettings`]): TOML/JSON-backed defaults for all
//!   of the above.
//!
//! | Concern | Retry | Circuit breaker | Batch |
//! |---------|-------|-----------------|-------|
//! | **State** | per call | shared across calls | per batch |
//! | **Suspension** | backoff sleep, attempt | attempt | attempt, slot wait |
//! | **Cancellation** | token in `RetryConfig` | via retry config | via retry config |
//! | **Errors** | terminal `ClassifiedError` | adds `CIRCUIT_OPEN` | per item |

pub mod batch;
pub mod circuit_breaker;
pub mod retry;
pub mod settings;

pub use batch::{run_batch, BatchItem, BatchResults};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState, Clock, MockClock, SystemClock,
};
pub use retry::{
    retry, RetryCondition, RetryConfig, RetryConfigBuilder, RetryExecutor, RetryObserver,
    RetryPredicate, RetrySuccess,
};
pub use settings::{
    BatchSettings, CircuitBreakerSettings, ConfigError, ConfigResult, ResilienceSettings,
    RetrySettings,
};
