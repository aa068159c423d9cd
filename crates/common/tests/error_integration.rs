//! Integration tests for `promptarc_common::error`.
//!
//! These suites validate classification idempotence, response mapping and
//! the diagnostics contract that downstream logging relies on.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use promptarc_common::error::{
    classify, from_response, ClassifiedError, ContextOverrides, ErrorClassification, ErrorKind,
    Failure, FieldOverride, Severity,
};

fn no_headers() -> HashMap<String, String> {
    HashMap::new()
}

/// Validates that classification is a no-op on every kind of input once
/// classified.
///
/// Assertions:
/// - `classify(classify(x))` has the same diagnostics as `classify(x)` for
///   generic, connectivity, opaque and typed inputs.
#[test]
fn classification_is_idempotent_for_every_input_shape() {
    let inputs: Vec<Failure> = vec![
        Failure::from(anyhow::anyhow!("render failed")),
        Failure::from("bare text"),
        Failure::from(io::Error::new(io::ErrorKind::ConnectionAborted, "aborted")),
        Failure::Opaque,
        Failure::from(ClassifiedError::permission("read-only workspace")),
    ];

    for input in inputs {
        let once = classify(input, &ContextOverrides::at("Gallery", "refresh"));
        let twice = classify(once.clone(), &ContextOverrides::at("Other", "ignored"));
        assert_eq!(twice.to_diagnostics(), once.to_diagnostics());
    }
}

/// Validates the generic/opaque retryability asymmetry.
///
/// A structured failure with a message is classified as retryable `Unknown`,
/// while an opaque value falls back to the non-retryable `Unknown` default.
/// Both behaviors are intentional and pinned here.
#[test]
fn generic_and_opaque_failures_differ_in_retryability() {
    let generic = classify(anyhow::anyhow!("socket closed mid-stream"), &ContextOverrides::new());
    let opaque = classify(Failure::Opaque, &ContextOverrides::new());

    assert_eq!(generic.kind(), ErrorKind::Unknown);
    assert_eq!(opaque.kind(), ErrorKind::Unknown);
    assert!(generic.is_retryable());
    assert!(!opaque.is_retryable());
    assert_eq!(generic.message(), "socket closed mid-stream");
    assert_eq!(opaque.message(), "An unknown error occurred");

    let bare = classify("socket closed mid-stream", &ContextOverrides::new());
    assert_eq!(bare.to_diagnostics().message, opaque.message());
    assert!(!bare.is_retryable());
}

/// Validates the `ApiError("boom", 503)` scenario.
#[test]
fn api_error_with_server_status() {
    let err = ClassifiedError::api_with_status("boom", 503);

    assert_eq!(err.kind(), ErrorKind::Api);
    assert!(err.is_retryable());
    assert_eq!(err.code(), Some("HTTP_503"));
    assert_eq!(err.severity(), Severity::Medium);
}

/// Validates that a 429 with `Retry-After: 5` seeds the retry delay.
#[test]
fn rate_limit_response_seeds_retry_delay() {
    let headers: HashMap<String, String> =
        [("Retry-After".to_string(), "5".to_string())].into_iter().collect();
    let err = from_response(429, "Too Many Requests", Some("https://api.example.com"), &headers);

    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
    assert_eq!(err.retry_policy().map(|p| p.initial_delay), Some(Duration::from_secs(5)));
    assert_eq!(err.context().url.as_deref(), Some("https://api.example.com"));
}

/// Validates that authentication failures are high severity and final.
#[test]
fn auth_responses_are_not_retryable() {
    for status in [401, 403] {
        let err = from_response(status, "Denied", None, &no_headers());
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.severity(), Severity::High);
        assert!(!err.is_retryable());
        assert!(err.retry_policy().is_none());
    }
}

/// Validates that explicit clears survive classification.
///
/// Assertions:
/// - A `Clear` override removes a field the factory would otherwise set.
/// - An explicitly empty value is kept rather than treated as absent.
#[test]
fn explicit_absence_is_preserved() {
    let overrides = ContextOverrides {
        url: FieldOverride::Clear,
        ..ContextOverrides::new().user_agent("").url("https://computed")
    };

    let err = classify(anyhow::anyhow!("quota exceeded"), &overrides);
    assert!(err.context().url.is_none());
    assert_eq!(err.context().user_agent.as_deref(), Some(""));
}

/// Validates that user messages never leak internal details.
#[test]
fn user_messages_are_non_technical() {
    let err = classify(
        io::Error::new(io::ErrorKind::Other, "ECONNRESET at 10.0.0.7:443"),
        &ContextOverrides::new(),
    );

    assert!(err.message().contains("ECONNRESET"));
    assert!(!err.user_message().contains("ECONNRESET"));
    assert_eq!(err.user_message(), ErrorKind::Unknown.default_user_message());
}

/// Validates the serialized diagnostics contract.
///
/// Assertions:
/// - Keys are camelCase and absent context fields are omitted.
/// - `stack` renders the captured cause chain.
#[test]
fn diagnostics_serialize_with_stable_shape() {
    let err = classify(
        anyhow::Error::new(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            .context("loading templates"),
        &ContextOverrides::at("Templates", "load").generated_error_id(),
    );

    let json = serde_json::to_value(err.to_diagnostics()).unwrap();
    assert_eq!(json["name"], "NetworkError");
    assert_eq!(json["kind"], "NETWORK");
    assert_eq!(json["severity"], "MEDIUM");
    assert_eq!(json["retryable"], true);
    assert_eq!(json["context"]["component"], "Templates");
    assert_eq!(json["context"]["retryCount"], 0);
    assert!(json["context"]["errorId"].is_string());
    assert!(json["context"].get("statusCode").is_none());

    let stack = json["stack"].as_str().unwrap();
    assert!(stack.starts_with("loading templates"));
    assert!(stack.contains("caused by: refused"));
}

/// Validates that typed constructors pre-seed per-kind defaults.
#[test]
fn typed_constructors_match_kind_defaults() {
    let cases = [
        (ClassifiedError::network("n"), ErrorKind::Network, true),
        (ClassifiedError::api("a"), ErrorKind::Api, true),
        (ClassifiedError::validation("v"), ErrorKind::Validation, false),
        (ClassifiedError::storage("s"), ErrorKind::Storage, false),
        (ClassifiedError::timeout_after("t", Duration::from_secs(30)), ErrorKind::Timeout, true),
        (ClassifiedError::rate_limit("r"), ErrorKind::RateLimit, true),
        (ClassifiedError::authentication("x"), ErrorKind::Authentication, false),
    ];

    for (err, kind, retryable) in cases {
        assert_eq!(err.kind(), kind);
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(err.severity(), kind.default_severity());
        assert_eq!(err.retry_policy().is_some(), retryable);
    }
}
