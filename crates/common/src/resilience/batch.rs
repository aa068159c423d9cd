//! Bounded fan-out of independent retry invocations
//!
//! Each operation gets its own retry loop under a shared policy. At most
//! `concurrency` loops are in flight at once and a freed slot is refilled
//! immediately. One item's failure never cancels or fails its siblings.

use std::future::Future;

use futures::stream::{self, StreamExt};
use tracing::{debug, instrument};

use super::retry::{retry, RetryConfig, RetrySuccess};
use super::settings::{ConfigError, ConfigResult};
use crate::error::{ClassifiedError, Failure};

/// Outcome of one batch entry, tagged with its input position
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    pub index: usize,
    /// Attempts actually made for this entry
    pub attempts: u32,
    pub result: Result<T, ClassifiedError>,
}

impl<T> BatchItem<T> {
    fn from_outcome(index: usize, outcome: Result<RetrySuccess<T>, ClassifiedError>) -> Self {
        match outcome {
            Ok(success) => Self { index, attempts: success.attempts, result: Ok(success.value) },
            Err(error) => {
                let made = error.context().retry_count;
                let attempts = if error.is_aborted() { made } else { made.saturating_add(1) };
                Self { index, attempts, result: Err(error) }
            }
        }
    }

    /// Whether this entry produced a value
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ClassifiedError> {
        self.result.as_ref().err()
    }
}

/// Summary helpers over a batch result slice
pub trait BatchResults {
    /// Entries that produced a value
    fn succeeded(&self) -> usize;
    /// Entries that ended in a classified error
    fn failed(&self) -> usize;
}

impl<T> BatchResults for [BatchItem<T>] {
    fn succeeded(&self) -> usize {
        self.iter().filter(|item| item.is_ok()).count()
    }

    fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }
}

/// Run every operation under `config` with at most `concurrency` in flight
///
/// The returned items are in input order. The only error is misuse of the
/// batch itself (`concurrency == 0`).
#[instrument(skip(operations, config))]
pub async fn run_batch<I, F, Fut, T, E>(
    operations: I,
    concurrency: usize,
    config: &RetryConfig,
) -> ConfigResult<Vec<BatchItem<T>>>
where
    I: IntoIterator<Item = F>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<Failure>,
{
    if concurrency == 0 {
        return Err(ConfigError::invalid("batch concurrency must be greater than 0"));
    }

    let mut items: Vec<BatchItem<T>> = stream::iter(operations.into_iter().enumerate())
        .map(|(index, operation)| async move {
            BatchItem::from_outcome(index, retry(operation, config).await)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    items.sort_unstable_by_key(|item| item.index);

    debug!(
        total = items.len(),
        succeeded = items.succeeded(),
        failed = items.failed(),
        "Batch finished"
    );
    Ok(items)
}
