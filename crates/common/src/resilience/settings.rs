//! File-backed resilience settings
//!
//! Settings are plain serde data (durations in milliseconds) that convert
//! into validated [`RetryConfig`] and [`CircuitBreakerConfig`] values.
//!
//! ```toml
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 1000
//! max_delay_ms = 10000
//! backoff_multiplier = 2.0
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout_ms = 60000
//!
//! [batch]
//! concurrency = 4
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::circuit_breaker::CircuitBreakerConfig;
use super::retry::RetryConfig;
use crate::utils::serde::duration_millis;

/// Configuration errors raised by builders, settings and batch misuse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to load configuration: {message}")]
    Load { message: String },
}

impl ConfigError {
    pub(crate) fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Default number of operations a batch runs at once
pub const DEFAULT_BATCH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the additive jitter, as a fraction of the delay
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: RetryConfig::DEFAULT_MAX_RETRIES,
            initial_delay: RetryConfig::DEFAULT_INITIAL_DELAY,
            max_delay: RetryConfig::DEFAULT_MAX_DELAY,
            backoff_multiplier: RetryConfig::DEFAULT_BACKOFF_MULTIPLIER,
            jitter: RetryConfig::DEFAULT_JITTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    #[serde(rename = "recovery_timeout_ms", with = "duration_millis")]
    pub recovery_timeout: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: CircuitBreakerConfig::DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: CircuitBreakerConfig::DEFAULT_RECOVERY_TIMEOUT,
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { concurrency: DEFAULT_BATCH_CONCURRENCY }
    }
}

/// Top-level resilience settings; every section is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub batch: BatchSettings,
}

impl ResilienceSettings {
    /// Parse and validate TOML settings
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        let settings: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::Load { message: format!("Invalid TOML format: {e}") })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse and validate JSON settings
    pub fn from_json_str(contents: &str) -> ConfigResult<Self> {
        let settings: Self = serde_json::from_str(contents)
            .map_err(|e| ConfigError::Load { message: format!("Invalid JSON format: {e}") })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a `.toml` or `.json` file
    ///
    /// The format is picked from the file extension; anything else is
    /// rejected.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading resilience settings");

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            other => Err(ConfigError::Load {
                message: format!("Unsupported settings format: {}", other.unwrap_or("<none>")),
            }),
        }
    }

    /// Check every section by building its runtime configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry_config()?;
        self.circuit_breaker_config()?;
        if self.batch.concurrency == 0 {
            return Err(ConfigError::invalid("batch.concurrency must be greater than 0"));
        }
        Ok(())
    }

    /// Retry policy described by the `[retry]` section
    pub fn retry_config(&self) -> ConfigResult<RetryConfig> {
        RetryConfig::builder()
            .max_retries(self.retry.max_retries)
            .initial_delay(self.retry.initial_delay)
            .max_delay(self.retry.max_delay)
            .backoff_multiplier(self.retry.backoff_multiplier)
            .jitter(self.retry.jitter)
            .build()
    }

    /// Breaker configuration described by the `[circuit_breaker]` section
    pub fn circuit_breaker_config(&self) -> ConfigResult<CircuitBreakerConfig> {
        let mut builder = CircuitBreakerConfig::builder()
            .failure_threshold(self.circuit_breaker.failure_threshold)
            .recovery_timeout(self.circuit_breaker.recovery_timeout);
        if let Some(name) = &self.circuit_breaker.name {
            builder = builder.name(name.clone());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Defaults match the documented retry and breaker defaults.
    #[test]
    fn test_default_settings() {
        let settings = ResilienceSettings::default();

        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.initial_delay, Duration::from_millis(1000));
        assert_eq!(settings.retry.max_delay, Duration::from_millis(10_000));
        assert_eq!(settings.circuit_breaker.failure_threshold, 5);
        assert_eq!(settings.batch.concurrency, 4);
        assert!(settings.validate().is_ok());
    }

    /// Partial TOML keeps defaults for everything not mentioned.
    #[test]
    fn test_partial_toml() {
        let settings = ResilienceSettings::from_toml_str(
            r#"
            [retry]
            max_retries = 5
            initial_delay_ms = 250

            [circuit_breaker]
            name = "image-api"
            "#,
        )
        .unwrap();

        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(settings.retry.max_delay, Duration::from_secs(10));
        assert_eq!(settings.circuit_breaker.name.as_deref(), Some("image-api"));

        let retry = settings.retry_config().unwrap();
        assert_eq!(retry.max_retries(), 5);
        let breaker = settings.circuit_breaker_config().unwrap();
        assert_eq!(breaker.name.as_deref(), Some("image-api"));
    }

    /// Inconsistent values are rejected at load time.
    #[test]
    fn test_invalid_values_rejected() {
        let err = ResilienceSettings::from_toml_str(
            r#"
            [retry]
            initial_delay_ms = 5000
            max_delay_ms = 100
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = ResilienceSettings::from_toml_str("[batch]\nconcurrency = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = ResilienceSettings::from_toml_str("[circuit_breaker]\nfailure_threshold = 0")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    /// Malformed input is a load error, not a panic.
    #[test]
    fn test_malformed_input() {
        let err = ResilienceSettings::from_toml_str("retry = = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));

        let err = ResilienceSettings::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
    }

    /// JSON uses the same field names as TOML.
    #[test]
    fn test_json_settings() {
        let settings = ResilienceSettings::from_json_str(
            r#"{"retry": {"max_retries": 0}, "batch": {"concurrency": 8}}"#,
        )
        .unwrap();

        assert_eq!(settings.retry.max_retries, 0);
        assert_eq!(settings.batch.concurrency, 8);
    }

    /// Files are read and dispatched by extension.
    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();

        let toml_path = dir.path().join("resilience.toml");
        std::fs::write(&toml_path, "[retry]\nmax_retries = 1\n").unwrap();
        assert_eq!(ResilienceSettings::load_from_file(&toml_path).unwrap().retry.max_retries, 1);

        let json_path = dir.path().join("resilience.json");
        std::fs::write(&json_path, r#"{"batch": {"concurrency": 2}}"#).unwrap();
        assert_eq!(ResilienceSettings::load_from_file(&json_path).unwrap().batch.concurrency, 2);

        let yaml_path = dir.path().join("resilience.yaml");
        std::fs::write(&yaml_path, "retry: {}").unwrap();
        assert!(matches!(
            ResilienceSettings::load_from_file(&yaml_path),
            Err(ConfigError::Load { .. })
        ));

        assert!(ResilienceSettings::load_from_file(dir.path().join("missing.toml")).is_err());
    }
}
