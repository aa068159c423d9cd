//! Conversion of arbitrary failures into [`ClassifiedError`]s
//!
//! [`classify`] is the single entry point for caught failures and
//! [`from_response`] maps protocol-level responses. Both are idempotent with
//! respect to already classified values: nothing is ever wrapped twice.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{ClassifiedError, ContextOverrides, ErrorKind, RetryPolicySnapshot, SharedCause};

const NETWORK_FAILURE_MESSAGE: &str = "Network connection failed";
const OPAQUE_FAILURE_MESSAGE: &str = "An unknown error occurred";

/// Anything the factory can be asked to classify
#[derive(Debug)]
pub enum Failure {
    /// A value that is already in the taxonomy
    Classified(ClassifiedError),
    /// A structured failure with a message and optional cause chain
    Error(anyhow::Error),
    /// A non-error value: nothing was thrown, or only a bare primitive
    Opaque,
}

impl Failure {
    /// Wrap any standard error type
    pub fn error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Error(anyhow::Error::new(error))
    }
}

impl From<ClassifiedError> for Failure {
    fn from(error: ClassifiedError) -> Self {
        Self::Classified(error)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        Self::Error(error)
    }
}

impl From<io::Error> for Failure {
    fn from(error: io::Error) -> Self {
        Self::error(error)
    }
}

/// A bare string is a primitive, not a structured failure; its text is dropped
impl From<String> for Failure {
    fn from(_: String) -> Self {
        Self::Opaque
    }
}

impl From<&str> for Failure {
    fn from(_: &str) -> Self {
        Self::Opaque
    }
}

impl From<()> for Failure {
    fn from((): ()) -> Self {
        Self::Opaque
    }
}

/// Produce the canonical representation of `failure`
///
/// An already classified failure (directly, or anywhere in an
/// `anyhow::Error` chain) is returned unchanged and `overrides` are ignored.
/// Otherwise the overrides are merged on top of the computed context.
///
/// A structured failure that is not a connectivity problem becomes a
/// *retryable* `Unknown` error, while a [`Failure::Opaque`] value becomes a
/// *non-retryable* one. The two deliberately differ.
pub fn classify(failure: impl Into<Failure>, overrides: &ContextOverrides) -> ClassifiedError {
    match failure.into() {
        Failure::Classified(error) => error,
        Failure::Error(error) => classify_error(error, overrides),
        Failure::Opaque => ClassifiedError::builder(ErrorKind::Unknown, OPAQUE_FAILURE_MESSAGE)
            .context(overrides.clone())
            .build(),
    }
}

fn classify_error(error: anyhow::Error, overrides: &ContextOverrides) -> ClassifiedError {
    let nested = error.chain().find_map(|cause| cause.downcast_ref::<ClassifiedError>());
    if let Some(classified) = nested {
        return classified.clone();
    }

    let builder = if is_connectivity_failure(&error) {
        ClassifiedError::builder(ErrorKind::Network, NETWORK_FAILURE_MESSAGE)
    } else {
        ClassifiedError::builder(ErrorKind::Unknown, error.to_string()).retryable(true)
    };

    let cause: SharedCause = Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(error));
    builder.context(overrides.clone()).cause(cause).build()
}

fn is_connectivity_failure(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.downcast_ref::<io::Error>().is_some_and(|io_error| {
            matches!(
                io_error.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::BrokenPipe
            )
        })
    })
}

/// Map an HTTP-like response to a classified error
///
/// | Status | Kind |
/// |--------|------|
/// | 401, 403 | Authentication |
/// | 429 | RateLimit (delay seeded from `Retry-After`) |
/// | other 4xx | Validation |
/// | 5xx | Api |
/// | anything else | Network |
pub fn from_response(
    status: u16,
    status_text: &str,
    url: Option<&str>,
    headers: &HashMap<String, String>,
) -> ClassifiedError {
    let message = format!("HTTP {status}: {status_text}");

    let mut builder = match status {
        401 | 403 => ClassifiedError::builder(ErrorKind::Authentication, message),
        429 => {
            let builder = ClassifiedError::builder(ErrorKind::RateLimit, message);
            match header_value(headers, "retry-after").and_then(parse_retry_after) {
                Some(wait) => builder
                    .retry_after(wait)
                    .retry_policy(RetryPolicySnapshot::rate_limited(Some(wait))),
                None => builder,
            }
        }
        400..=499 => ClassifiedError::builder(ErrorKind::Validation, message),
        500.. => ClassifiedError::builder(ErrorKind::Api, message).retryable(true),
        _ => ClassifiedError::builder(ErrorKind::Network, message),
    };

    let mut overrides = ContextOverrides::new().status_code(status);
    if let Some(url) = url {
        overrides = overrides.url(url);
    }
    builder = builder.code(format!("HTTP_{status}")).context(overrides);
    builder.build()
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date
///
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

impl From<anyhow::Error> for ClassifiedError {
    fn from(error: anyhow::Error) -> Self {
        classify(error, &ContextOverrides::default())
    }
}

impl From<io::Error> for ClassifiedError {
    fn from(error: io::Error) -> Self {
        classify(error, &ContextOverrides::default())
    }
}
