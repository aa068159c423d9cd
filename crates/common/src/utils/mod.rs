//! Small shared helpers
//!
//! - **[`serde`]**: Serialization helpers for durations carried by error
//!   snapshots and resilience settings

pub mod serde;

pub use self::serde::duration_millis;
