//! Retrying unit-of-work scope.
//!
//! A [`TransactionScope`] runs an async closure and, if it fails with a retryable error
//! (a version conflict), runs it again with exponential backoff. The closure must be
//! re-entrant: every attempt re-reads the entities it mutates, so that it works against the
//! state committed by whichever writer won the previous race.

use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use monitoring::{OperationId, logging};

use crate::retryable::RetryableErrorExt;

/// Default maximum number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: usize = 7;

/// Default delay before the first retry.
pub const DEFAULT_MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Default upper bound for the delay between retries.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Bounded exponential backoff applied to conflicting units of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_delay: DEFAULT_MIN_RETRY_DELAY,
            max_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionScope {
    policy: RetryPolicy,
}

impl TransactionScope {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `unit` until it succeeds, fails with a fatal error, or the retry budget runs out.
    ///
    /// When the budget runs out the last conflict is converted into [`RetriesExhausted`].
    pub async fn run<T, E, F, Fut>(&self, name: &str, mut unit: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableErrorExt + From<RetriesExhausted>,
    {
        let operation_id = OperationId::new();
        let attempts = AtomicUsize::new(0);

        tracing::debug!(%operation_id, unit = name, "transaction started");

        let result = (|| {
            attempts.fetch_add(1, Ordering::Relaxed);
            unit()
        })
        .retry(self.policy.backoff())
        .when(|err: &E| err.is_retryable())
        .notify(|err: &E, delay: Duration| {
            tracing::debug!(
                %operation_id,
                unit = name,
                error = %err, error_source = logging::error_source(err),
                "transaction conflicted, retrying after {:.1}s",
                delay.as_secs_f32()
            );
        })
        .await;

        let attempts = attempts.load(Ordering::Relaxed);
        match result {
            Ok(value) => {
                tracing::debug!(%operation_id, unit = name, attempts, "transaction committed");
                Ok(value)
            }
            Err(err) if err.is_retryable() => {
                tracing::error!(
                    %operation_id,
                    unit = name,
                    attempts,
                    error = %err, error_source = logging::error_source(&err),
                    "transaction gave up after repeated conflicts"
                );
                Err(E::from(RetriesExhausted {
                    unit: name.to_string(),
                    attempts,
                    last_error: err.to_string(),
                }))
            }
            Err(err) => Err(err),
        }
    }
}

/// A unit of work kept conflicting with concurrent writers until the retry budget ran out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transaction '{unit}' gave up after {attempts} attempts: {last_error}")]
pub struct RetriesExhausted {
    pub unit: String,
    pub attempts: usize,
    pub last_error: String,
}
