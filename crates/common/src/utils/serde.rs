//! Serialization helpers for resilience data types
//!
//! Retry policy snapshots and settings files carry durations as whole
//! milliseconds so they read naturally in TOML and in telemetry payloads.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde adapter that stores a [`Duration`] as integer milliseconds
///
/// # Usage
/// ```rust
/// use std::time::Duration;
///
/// use promptarc_common::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Backoff {
///     #[serde(with = "duration_millis")]
///     initial_delay: Duration,
/// }
/// ```
pub mod duration_millis {
    use serde::ser::Error as SerError;

    use super::*;

    type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

    /// Serialize a Duration as milliseconds, rejecting values beyond `u64`
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).map_err(|_| {
            SerError::custom("duration too large to fit into a 64-bit millisecond representation")
        })?;
        serializer.serialize_u64(millis)
    }

    /// Deserialize milliseconds into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
