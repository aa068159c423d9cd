//! Circuit breaker guarding one failing resource
//!
//! The breaker sits in front of the retry driver and counts *terminal* retry
//! outcomes only: a call that recovers after internal retries is one success.
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────▶ Open
//!     ▲                                  │ recovery_timeout elapsed
//!     │ trial succeeds                   ▼
//!     └──────────────────────────── HalfOpen
//!                 trial fails: back to Open, cooldown restarts
//! ```
//!
//! Admission (state read, cooldown check, `HalfOpen` transition, trial claim)
//! happens in one critical section, so two concurrent calls can never both
//! become the `HalfOpen` trial.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::retry::{retry, RetryConfig, RetrySuccess};
use super::settings::{ConfigError, ConfigResult};
use crate::error::{ClassifiedError, Failure};

//==============================================================================
// Time Abstraction for Testability
//==============================================================================

/// Trait for time operations to enable deterministic testing
///
/// Production breakers use [`SystemClock`]; tests drive a [`MockClock`] to
/// exercise recovery timeouts without sleeping.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant
    fn now(&self) -> Instant;
}

/// Real system clock implementation for production use
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Mock clock for deterministic testing
///
/// Clones share the same elapsed time, so a test can keep one handle and
/// give another to the breaker.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Frozen clock starting at the current instant
    pub fn new() -> Self {
        Self { start: Instant::now(), elapsed: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Advance the mock clock by a duration
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Set the mock clock to a specific elapsed time
    pub fn set_elapsed(&self, duration: Duration) {
        *self.elapsed.lock() = duration;
    }

    /// Total time advanced so far
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }
}

//==============================================================================
// Configuration
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls flow through the retry driver
    Closed,
    /// Calls are rejected without invoking the operation
    Open,
    /// A single trial call is testing recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior; immutable once a breaker exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive terminal failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait after the last failure before probing
    pub recovery_timeout: Duration,
    /// Label used in log output
    pub name: Option<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Self::DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: Self::DEFAULT_RECOVERY_TIMEOUT,
            name: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a new configuration with validation
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Create a configuration builder (alias for `new()`)
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Start from [`CircuitBreakerConfig::default`]
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    /// Consecutive terminal failures that open the circuit; must be > 0
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Cooldown after the last failure before a trial is admitted
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    /// Label breaker log events with `name`
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Validate and produce the configuration
    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Breaker
//==============================================================================

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Calls submitted, admitted or not
    pub total_calls: u64,
    /// Calls rejected without invoking the operation
    pub rejected_calls: u64,
    pub last_failure_time: Option<Instant>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped by `reset()` so outcomes admitted earlier are ignored
    generation: u64,
    total_calls: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            trial_in_flight: false,
            generation: 0,
            total_calls: 0,
            rejected_calls: 0,
        }
    }
}

/// Circuit breaker wrapping the retry driver
///
/// Cloning yields another handle to the same breaker state.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker with the given configuration using system
    /// clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::from_parts(CircuitBreakerConfig::default(), SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, clock))
    }

    fn from_parts(config: CircuitBreakerConfig, clock: C) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BreakerState::closed())),
            clock: Arc::new(clock),
        }
    }

    /// Configuration shared by every clone of this breaker
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn label(&self) -> &str {
        self.config.name.as_deref().unwrap_or("circuit_breaker")
    }

    /// Run `operation` through the retry driver if the circuit admits it
    ///
    /// When the circuit is open the operation is not invoked and a
    /// non-retryable `Api` error ("Circuit breaker is open") is returned,
    /// carrying the remaining cooldown as its `retry_after` hint.
    #[instrument(skip_all, fields(breaker = %self.label()))]
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: F,
        retry_config: &RetryConfig,
    ) -> Result<RetrySuccess<T>, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Failure>,
    {
        let mut permit = self.admit()?;

        let outcome = retry(operation, retry_config).await;
        match &outcome {
            Ok(_) => permit.record_success(),
            Err(error) if error.is_aborted() => permit.release(),
            Err(_) => permit.record_failure(),
        }
        outcome
    }

    /// Current state; an expired cooldown is only observed by the next call
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Terminal failures since the last success or reset
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Point-in-time snapshot for monitoring
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            last_failure_time: inner.last_failure,
        }
    }

    /// Force the circuit closed with a zero failure count
    ///
    /// Outcomes of calls admitted before the reset are discarded.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        inner.generation = inner.generation.wrapping_add(1);
        info!(breaker = %self.label(), "Circuit breaker manually reset to closed state");
    }

    fn admit(&self) -> Result<Permit<'_, C>, ClassifiedError> {
        let mut inner = self.inner.lock();
        inner.total_calls = inner.total_calls.saturating_add(1);

        if inner.state == CircuitState::Open {
            let now = self.clock.now();
            let elapsed = inner
                .last_failure
                .map_or(self.config.recovery_timeout, |at| now.saturating_duration_since(at));
            let remaining = self.config.recovery_timeout.saturating_sub(elapsed);

            if !remaining.is_zero() {
                inner.rejected_calls = inner.rejected_calls.saturating_add(1);
                debug!(breaker = %self.label(), ?remaining, "Circuit breaker rejecting call");
                return Err(ClassifiedError::circuit_open(Some(remaining)));
            }

            inner.state = CircuitState::HalfOpen;
            info!(breaker = %self.label(), "Circuit breaker half-open, probing recovery");
        }

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                true
            }
            _ => {
                inner.rejected_calls = inner.rejected_calls.saturating_add(1);
                debug!(breaker = %self.label(), "Circuit breaker rejecting call, trial in flight");
                return Err(ClassifiedError::circuit_open(None));
            }
        };

        Ok(Permit { breaker: self, trial, generation: inner.generation, settled: false })
    }

    fn on_success(&self, trial: bool, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }

        if trial {
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.trial_in_flight = false;
            info!(breaker = %self.label(), "Circuit breaker closed after successful trial");
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }

        let now = self.clock.now();
        if trial {
            inner.state = CircuitState::Open;
            inner.last_failure = Some(now);
            inner.trial_in_flight = false;
            warn!(
                breaker = %self.label(),
                failures = inner.consecutive_failures,
                "Circuit breaker reopened after failed trial"
            );
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.last_failure = Some(now);
            if inner.consecutive_failures >= self.config.failure_threshold {
                inner.state = CircuitState::Open;
                warn!(
                    breaker = %self.label(),
                    failures = inner.consecutive_failures,
                    "Circuit breaker opened after {} consecutive failures",
                    inner.consecutive_failures
                );
            }
        }
        // Calls admitted while closed that finish after the circuit opened
        // leave the open state alone.
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.trial_in_flight = false;
        }
    }
}

/// Admission ticket for one call; an unsettled trial frees its slot on drop
struct Permit<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl<C: Clock> Permit<'_, C> {
    fn record_success(&mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial, self.generation);
    }

    fn record_failure(&mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial, self.generation);
    }

    /// Settle without counting the outcome either way
    fn release(&mut self) {
        self.settled = true;
        if self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

impl<C: Clock> Drop for Permit<'_, C> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}
