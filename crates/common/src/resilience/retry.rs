//! Classification-aware retry with exponential backoff and jitter
//!
//! Every failed attempt is classified through [`classify`] before any
//! decision is made, so retry conditions, observers and the final error all
//! see the same [`ClassifiedError`] shape regardless of what the operation
//! returned.
//!
//! The delay before attempt `n + 1` is
//! `min(initial_delay * multiplier^(n-1) * (1 + jitter_sample), max_delay)`
//! where the jitter sample is drawn uniformly from `[0, jitter]`. Jitter only
//! ever lengthens a delay.
//!
//! Cancellation is cooperative: the token is checked before each attempt and
//! races the backoff sleep, but an attempt that is already running is never
//! interrupted.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::settings::{ConfigError, ConfigResult};
use crate::error::{classify, ClassifiedError, ContextOverrides, Failure, RetryPolicySnapshot};

/// Predicate deciding whether a classified failure should be retried
pub type RetryPredicate = Arc<dyn Fn(&ClassifiedError, u32) -> bool + Send + Sync>;

/// Observer invoked before each backoff sleep
pub type RetryObserver = Arc<dyn Fn(&ClassifiedError, u32) + Send + Sync>;

/// Which classified failures are worth another attempt
#[derive(Clone, Default)]
pub enum RetryCondition {
    /// Retry iff the error is marked retryable
    #[default]
    Retryable,
    /// Retry every failure until attempts run out
    Always,
    /// Never retry; one attempt only
    Never,
    /// Caller-supplied predicate over `(error, attempt)`
    Custom(RetryPredicate),
}

impl RetryCondition {
    /// Wrap a closure as a [`RetryCondition::Custom`]
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&ClassifiedError, u32) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Decide for a failure observed on `attempt` (1-based)
    ///
    /// The driver only consults this while attempts remain, so `Always`
    /// still stops at `max_retries`.
    pub fn should_retry(&self, error: &ClassifiedError, attempt: u32) -> bool {
        use crate::error::ErrorClassification as _;

        match self {
            Self::Retryable => error.is_retryable(),
            Self::Always => true,
            Self::Never => false,
            Self::Custom(predicate) => predicate(error, attempt),
        }
    }
}

impl fmt::Debug for RetryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => f.write_str("Retryable"),
            Self::Always => f.write_str("Always"),
            Self::Never => f.write_str("Never"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Retry policy for one or more retry invocations
#[derive(Clone)]
pub struct RetryConfig {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: f64,
    retry_condition: RetryCondition,
    on_retry: Option<RetryObserver>,
    cancellation: Option<CancellationToken>,
    context: ContextOverrides,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("retry_condition", &self.retry_condition)
            .field("on_retry", &self.on_retry.is_some())
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            initial_delay: Self::DEFAULT_INITIAL_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
            backoff_multiplier: Self::DEFAULT_BACKOFF_MULTIPLIER,
            jitter: Self::DEFAULT_JITTER,
            retry_condition: RetryCondition::default(),
            on_retry: None,
            cancellation: None,
            context: ContextOverrides::default(),
        }
    }
}

impl RetryConfig {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);
    pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const DEFAULT_JITTER: f64 = 0.1;

    /// Create a new retry configuration with validation
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Create a configuration builder (alias for `new()`)
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Builder seeded from the retry hints carried by a classified error
    pub fn from_policy(policy: &RetryPolicySnapshot) -> RetryConfigBuilder {
        RetryConfigBuilder::new()
            .max_retries(policy.max_retries)
            .initial_delay(policy.initial_delay)
            .max_delay(policy.max_delay)
            .backoff_multiplier(policy.backoff_multiplier)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(format!(
                "backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }

        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid(format!(
                "initial_delay ({:?}) must not exceed max_delay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid(format!(
                "jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }

        Ok(())
    }

    /// Retries after the first attempt; an always-failing call runs this + 1 times
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay after the first failed attempt, before jitter
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Upper bound on any single delay, jitter included
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Growth factor applied per failed attempt
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Largest additive jitter, as a fraction of the base delay
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Which classified failures get another attempt
    pub fn retry_condition(&self) -> &RetryCondition {
        &self.retry_condition
    }

    /// Token checked before each attempt and raced against each backoff sleep
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Context merged into every failure this policy classifies
    pub fn context(&self) -> &ContextOverrides {
        &self.context
    }

    /// Copy of this policy bound to `token`
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self { cancellation: Some(token), ..self.clone() }
    }

    /// Delay after failed attempt `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.scaled_delay(attempt, 0.0)
    }

    /// Delay after failed attempt `attempt` for a given jitter sample
    ///
    /// The sample is clamped to `[0, jitter]`.
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let sample = if sample.is_nan() { 0.0 } else { sample.clamp(0.0, self.jitter) };
        self.scaled_delay(attempt, sample)
    }

    /// Delay after failed attempt `attempt` with a fresh jitter sample
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample =
            if self.jitter > 0.0 { rand::thread_rng().gen_range(0.0..=self.jitter) } else { 0.0 };
        self.delay_with_jitter(attempt, sample)
    }

    fn scaled_delay(&self, attempt: u32, jitter_fraction: f64) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent) * (1.0 + jitter_fraction);
        let delay_us = self.initial_delay.as_micros() as f64 * factor;
        let max_us = self.max_delay.as_micros() as f64;

        if delay_us.is_finite() && delay_us < max_us {
            Duration::from_micros(delay_us.round() as u64)
        } else {
            self.max_delay
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn aborted(&self, attempts_made: u32) -> ClassifiedError {
        ClassifiedError::aborted().with_context(&self.context).with_retry_count(attempts_made)
    }

    fn notify_retry(&self, error: &ClassifiedError, attempt: u32) {
        let Some(observer) = &self.on_retry else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| observer(error, attempt))).is_err() {
            warn!(attempt, "on_retry observer panicked; continuing with retry");
        }
    }

    /// Sleep for `delay` unless cancellation wins the race
    async fn pause(&self, delay: Duration) -> bool {
        match &self.cancellation {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => false,
                    () = tokio::time::sleep(delay) => true,
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Start from [`RetryConfig::default`]
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    /// Set the number of retries after the first attempt (0 disables retrying)
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the delay after the first failure; zero disables backoff entirely
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    /// Set the cap for every delay; must not be below `initial_delay`
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set the per-attempt growth factor; must be finite and at least 1.0
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    /// Set the jitter fraction, within `[0, 1]`
    pub fn jitter(mut self, fraction: f64) -> Self {
        self.config.jitter = fraction;
        self
    }

    /// Use exact delays; handy in tests
    pub fn no_jitter(self) -> Self {
        self.jitter(0.0)
    }

    /// Replace the default [`RetryCondition::Retryable`]
    pub fn retry_condition(mut self, condition: RetryCondition) -> Self {
        self.config.retry_condition = condition;
        self
    }

    /// Shorthand for `retry_condition(RetryCondition::custom(predicate))`
    pub fn retry_if<F>(self, predicate: F) -> Self
    where
        F: Fn(&ClassifiedError, u32) -> bool + Send + Sync + 'static,
    {
        self.retry_condition(RetryCondition::custom(predicate))
    }

    /// Observe each failure that is about to be retried
    ///
    /// Called with the classified error and the 1-based attempt that failed,
    /// before the backoff sleep. A panicking observer is logged and ignored.
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(&ClassifiedError, u32) + Send + Sync + 'static,
    {
        self.config.on_retry = Some(Arc::new(observer));
        self
    }

    /// Bind a cancellation token
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.config.cancellation = Some(token);
        self
    }

    /// Context merged into every failure this policy classifies
    pub fn context(mut self, overrides: ContextOverrides) -> Self {
        self.config.context = overrides;
        self
    }

    /// Validate and produce the configuration
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when any of these fail:
    /// - the multiplier is finite and at least 1.0
    /// - `initial_delay <= max_delay`
    /// - jitter lies within `[0, 1]`
    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Successful retry outcome with attempt telemetry
#[derive(Debug, Clone)]
pub struct RetrySuccess<T> {
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
    pub total_elapsed: Duration,
    /// Classified failures of the earlier attempts, oldest first
    pub errors: Vec<ClassifiedError>,
}

impl<T> RetrySuccess<T> {
    /// Discard the telemetry and keep the value
    pub fn into_value(self) -> T {
        self.value
    }
}

/// Reusable retry runner bound to one policy
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Bind an executor to `config`
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The policy every `execute` call uses
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: F,
    ) -> Result<RetrySuccess<T>, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Failure>,
    {
        retry(operation, &self.config).await
    }
}

/// Run `operation` until it succeeds, is exhausted, or is cancelled
///
/// With `max_retries = n` an operation that always fails is invoked `n + 1`
/// times. The returned error is the last classified failure, tagged with the
/// number of attempts that preceded it, or an aborted error if cancellation
/// was observed.
#[instrument(skip_all, fields(max_retries = config.max_retries))]
pub async fn retry<F, Fut, T, E>(
    mut operation: F,
    config: &RetryConfig,
) -> Result<RetrySuccess<T>, ClassifiedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<Failure>,
{
    let started = Instant::now();
    let mut errors = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);

        if config.is_cancelled() {
            debug!(attempt, "Retry cancelled before attempt");
            return Err(config.aborted(attempt - 1));
        }

        debug!(
            attempt,
            "Executing operation (attempt {}/{})",
            attempt,
            config.max_retries.saturating_add(1)
        );

        let failure = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after {} retries", attempt - 1);
                }
                return Ok(RetrySuccess {
                    value,
                    attempts: attempt,
                    total_elapsed: started.elapsed(),
                    errors,
                });
            }
            Err(failure) => failure,
        };

        let error = classify(failure, &config.context).with_retry_count(attempt - 1);
        errors.push(error.clone());

        if attempt > config.max_retries || !config.retry_condition.should_retry(&error, attempt) {
            warn!(
                attempt,
                error_kind = error.kind().as_str(),
                "Giving up after {} attempt(s): {}",
                attempt,
                error
            );
            return Err(error);
        }

        config.notify_retry(&error, attempt);

        if config.is_cancelled() {
            debug!(attempt, "Retry cancelled before backoff");
            return Err(config.aborted(attempt));
        }

        let delay = config.next_delay(attempt);
        warn!(attempt, ?delay, error_kind = error.kind().as_str(), "Operation failed, retrying");

        if !config.pause(delay).await {
            debug!(attempt, "Retry cancelled during backoff");
            return Err(config.aborted(attempt));
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the retry driver
    //!
    //! Tests cover configuration validation, the backoff formula, jitter
    //! bounds, retry conditions, observers and cancellation points.

    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::error::{ErrorClassification, ErrorKind};

    fn fast_config() -> RetryConfigBuilder {
        RetryConfig::builder()
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(100))
    }

    /// Defaults are 3 retries, 1s initial, 10s cap, x2, 10% jitter.
    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();

        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.initial_delay(), Duration::from_millis(1000));
        assert_eq!(config.max_delay(), Duration::from_millis(10_000));
        assert!((config.backoff_multiplier() - 2.0).abs() < f64::EPSILON);
        assert!((config.jitter() - 0.1).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    /// Invalid multipliers, delay bounds and jitter are rejected.
    #[test]
    fn test_retry_config_validation() {
        assert!(RetryConfig::builder().backoff_multiplier(0.5).build().is_err());
        assert!(RetryConfig::builder().backoff_multiplier(f64::NAN).build().is_err());
        assert!(RetryConfig::builder().backoff_multiplier(f64::INFINITY).build().is_err());
        assert!(RetryConfig::builder()
            .initial_delay(Duration::from_secs(20))
            .max_delay(Duration::from_secs(10))
            .build()
            .is_err());
        assert!(RetryConfig::builder().jitter(1.5).build().is_err());
        assert!(RetryConfig::builder().jitter(-0.1).build().is_err());
        assert!(RetryConfig::builder().max_retries(0).no_jitter().build().is_ok());
    }

    /// Base delay doubles per attempt and caps at max_delay.
    #[test]
    fn test_base_delay_progression() {
        let config = RetryConfig::default();
        let delays: Vec<_> = (1..=6).map(|attempt| config.base_delay(attempt)).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
    }

    /// Extreme attempt numbers saturate at max_delay instead of overflowing.
    #[test]
    fn test_base_delay_saturates() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay(u32::MAX), Duration::from_secs(10));
    }

    /// Jitter adds up to the configured fraction and never subtracts.
    #[test]
    fn test_delay_with_jitter_bounds() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_with_jitter(1, 0.0), Duration::from_secs(1));
        assert_eq!(config.delay_with_jitter(1, 0.1), Duration::from_millis(1100));
        assert_eq!(config.delay_with_jitter(1, 0.5), Duration::from_millis(1100));
        assert_eq!(config.delay_with_jitter(1, -1.0), Duration::from_secs(1));
        assert_eq!(config.delay_with_jitter(5, 0.1), Duration::from_secs(10));
    }

    /// Random delays stay inside [base, base * 1.1].
    #[test]
    fn test_next_delay_within_bounds() {
        let config = RetryConfig::default();

        for attempt in 1..=4 {
            let base = config.base_delay(attempt);
            for _ in 0..50 {
                let delay = config.next_delay(attempt);
                assert!(delay >= base);
                assert!(delay <= base.mul_f64(1.1) + Duration::from_micros(1));
            }
        }
    }

    /// A retry policy snapshot carries over into a runtime config.
    #[test]
    fn test_from_policy() {
        let error = ClassifiedError::rate_limit_after("slow down", 5);
        let config = RetryConfig::from_policy(error.retry_policy().unwrap()).build().unwrap();

        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.base_delay(1), Duration::from_secs(5));
        assert_eq!(config.base_delay(3), Duration::from_secs(5));
    }

    /// Built-in conditions and custom predicates decide as documented.
    #[test]
    fn test_retry_conditions() {
        let retryable = ClassifiedError::network("down");
        let fatal = ClassifiedError::validation("bad");

        assert!(RetryCondition::Retryable.should_retry(&retryable, 1));
        assert!(!RetryCondition::Retryable.should_retry(&fatal, 1));
        assert!(RetryCondition::Always.should_retry(&fatal, 1));
        assert!(!RetryCondition::Never.should_retry(&retryable, 1));

        let first_only = RetryCondition::custom(|_, attempt| attempt < 2);
        assert!(first_only.should_retry(&fatal, 1));
        assert!(!first_only.should_retry(&fatal, 2));
        assert_eq!(format!("{first_only:?}"), "Custom(..)");
    }

    /// First-try success reports one attempt and no errors.
    #[tokio::test]
    async fn test_retry_immediate_success() {
        let outcome = retry(|| async { Ok::<_, ClassifiedError>(42) }, &RetryConfig::default())
            .await
            .unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.errors.is_empty());
    }

    /// An always-failing operation runs max_retries + 1 times.
    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = fast_config().max_retries(2).build().unwrap();

        let err = retry(
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ClassifiedError::network("down"))
                }
            },
            &config,
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.context().retry_count, 2);
    }

    /// Zero retries means exactly one attempt.
    #[tokio::test(start_paused = true)]
    async fn test_retry_zero_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = fast_config().max_retries(0).build().unwrap();
        let started = Instant::now();

        let result = retry(
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                }
            },
            &config,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    /// A bare string failure is opaque and never retried.
    #[tokio::test(start_paused = true)]
    async fn test_retry_primitive_failure_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let err = retry(
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                }
            },
            &RetryConfig::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.message(), "An unknown error occurred");
        assert!(!err.is_retryable());
    }

    /// Non-retryable failures stop the loop after one attempt.
    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));

        let err = retry(
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ClassifiedError::validation_field("prompt", "empty"))
                }
            },
            &RetryConfig::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.context().retry_count, 0);
    }

    /// `Always` retries even non-retryable kinds; `Never` retries nothing.
    #[tokio::test(start_paused = true)]
    async fn test_retry_condition_overrides() {
        let calls = Arc::new(AtomicU32::new(0));
        let always =
            fast_config().max_retries(2).retry_condition(RetryCondition::Always).build().unwrap();
        let op = || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ClassifiedError::validation("bad"))
            }
        };

        let _ = retry(op, &always).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let never =
            fast_config().max_retries(5).retry_condition(RetryCondition::Never).build().unwrap();
        let _ = retry(op, &never).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Earlier failures are reported with increasing retry counts.
    #[tokio::test(start_paused = true)]
    async fn test_retry_collects_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = fast_config().build().unwrap();

        let outcome = retry(
            || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ClassifiedError::timeout("slow"))
                    } else {
                        Ok("done")
                    }
                }
            },
            &config,
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.value, "done");
        let counts: Vec<_> = outcome.errors.iter().map(|e| e.context().retry_count).collect();
        assert_eq!(counts, vec![0, 1]);
        assert!(outcome.total_elapsed >= Duration::from_millis(30));
    }

    /// The observer sees every non-terminal failure with its attempt number.
    #[tokio::test(start_paused = true)]
    async fn test_on_retry_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let config = fast_config()
            .max_retries(3)
            .on_retry(move |error, attempt| {
                sink.lock().push((attempt, error.context().retry_count));
            })
            .build()
            .unwrap();

        let _ = retry(|| async { Err::<(), _>(ClassifiedError::api("flaky")) }, &config).await;

        assert_eq!(*seen.lock(), vec![(1, 0), (2, 1), (3, 2)]);
    }

    /// A panicking observer does not abort the loop.
    #[tokio::test(start_paused = true)]
    async fn test_on_retry_panic_is_contained() {
        let calls = Arc::new(AtomicU32::new(0));
        let config =
            fast_config().max_retries(2).on_retry(|_, _| panic!("observer bug")).build().unwrap();

        let err = retry(
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ClassifiedError::network("down"))
                }
            },
            &config,
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!err.is_aborted());
    }

    /// A token cancelled up front prevents every attempt.
    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        token.cancel();
        let config = RetryConfig::builder().cancellation(token).build().unwrap();

        let err = retry(
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ClassifiedError>(())
                }
            },
            &config,
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(err.is_aborted());
        assert_eq!(err.message(), "Operation was aborted");
        assert!(!err.is_retryable());
    }

    /// Cancelling inside an attempt is seen before the backoff sleep.
    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let config = RetryConfig::builder().cancellation(token.clone()).build().unwrap();

        let err = retry(
            || {
                let calls = Arc::clone(&calls);
                let token = token.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    token.cancel();
                    Err::<(), _>(ClassifiedError::network("down"))
                }
            },
            &config,
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is_aborted());
        assert_eq!(err.context().retry_count, 1);
    }

    /// Cancelling during the backoff sleep ends it early.
    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let config = RetryConfig::builder()
            .initial_delay(Duration::from_secs(5))
            .cancellation(token.clone())
            .build()
            .unwrap();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };

        let started = Instant::now();
        let err = retry(
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ClassifiedError::network("down"))
                }
            },
            &config,
        )
        .await
        .unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Context overrides from the policy land on classified failures.
    #[tokio::test]
    async fn test_context_overrides_applied() {
        let config = RetryConfig::builder()
            .max_retries(0)
            .context(ContextOverrides::at("ImageToPrompt", "upload"))
            .build()
            .unwrap();

        let err = retry(|| async { Err::<(), _>(anyhow::anyhow!("upload rejected")) }, &config)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.message(), "upload rejected");
        assert_eq!(err.context().component.as_deref(), Some("ImageToPrompt"));
        assert_eq!(err.context().operation.as_deref(), Some("upload"));
    }

    /// The executor reuses one policy across calls.
    #[tokio::test]
    async fn test_retry_executor() {
        let executor = RetryExecutor::new(RetryConfig::default());

        let first = executor.execute(|| async { Ok::<_, ClassifiedError>(1) }).await.unwrap();
        let second = executor.execute(|| async { Ok::<_, ClassifiedError>(2) }).await.unwrap();

        assert_eq!(first.into_value() + second.into_value(), 3);
        assert_eq!(executor.config().max_retries(), 3);
    }
}
