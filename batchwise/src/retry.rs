//! Retry policy engine.
//!
//! Runs an [`Operation`] until it succeeds, fails with a kind the
//! [`RetryConfig`] does not retry, or runs out of attempts. Delays grow
//! exponentially from `base_delay`, are capped at `max_delay`, and are then
//! spread by jitter. A server-directed `retry_after` replaces the computed
//! delay outright.
//!
//! ```rust,ignore
//! let config = RetryConfig::default();
//! let document = retry::execute(|| transport.request(Method::Get, &path, None), &config).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::{classify, ClassifiedError, FailureDetails};
use crate::config::RetryConfig;

/// A zero-argument unit of remote work that can be invoked repeatedly.
///
/// Implemented for every `Fn() -> impl Future<Output = Result<T, E>>`
/// closure, so callers normally pass a closure.
pub trait Operation {
    /// Value produced on success.
    type Output;
    /// Failure type handed to the classifier.
    type Failure: FailureDetails;

    /// Start one attempt.
    fn call(&self) -> impl Future<Output = Result<Self::Output, Self::Failure>> + Send;
}

impl<F, Fut, T, E> Operation for F
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send,
    E: FailureDetails,
{
    type Output = T;
    type Failure = E;

    fn call(&self) -> impl Future<Output = Result<T, E>> + Send {
        self()
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The operation returned a value.
    Succeeded,
    /// The operation failed with this classification.
    Failed(ClassifiedError),
}

/// Bookkeeping for one attempt of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based attempt counter.
    pub attempt_number: u32,
    /// Wall-clock time the attempt started.
    pub started_at: DateTime<Utc>,
    /// What happened.
    pub outcome: AttemptOutcome,
    /// Wait scheduled before the next attempt; `None` on the final attempt.
    pub delay_before_next: Option<Duration>,
}

/// Receives every [`AttemptRecord`] as soon as it is complete.
pub trait AttemptObserver: Send + Sync {
    /// Called once per attempt, in attempt order.
    fn on_attempt(&self, record: &AttemptRecord);
}

/// Result of a retried operation together with its attempt history.
#[derive(Debug)]
pub struct RetryReport<T> {
    /// Final value or last classified failure.
    pub result: Result<T, ClassifiedError>,
    /// One record per attempt, ordered by attempt number.
    pub attempts: Vec<AttemptRecord>,
}

impl<T> RetryReport<T> {
    /// Number of attempts made.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Drop the history and keep the result.
    pub fn into_result(self) -> Result<T, ClassifiedError> {
        self.result
    }
}

/// Retry loop bound to one configuration.
///
/// Holds no per-operation state, so a single `Retrier` can drive any number
/// of concurrent operations.
#[derive(Clone)]
pub struct Retrier<'a> {
    config: &'a RetryConfig,
    observer: Option<&'a dyn AttemptObserver>,
    cancellation: Option<CancellationToken>,
}

impl std::fmt::Debug for Retrier<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("config", self.config)
            .field("observer", &self.observer.is_some())
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

impl<'a> Retrier<'a> {
    /// Create a retrier for `config`.
    pub const fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            observer: None,
            cancellation: None,
        }
    }

    /// Report every attempt to `observer`.
    #[must_use]
    pub const fn with_observer(mut self, observer: &'a dyn AttemptObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Abandon pending backoff waits once `token` is cancelled.
    ///
    /// An attempt already in flight always runs to completion.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// The configuration this retrier applies.
    pub const fn config(&self) -> &RetryConfig {
        self.config
    }

    /// Run `operation` under the retry policy.
    pub async fn run<O>(&self, operation: &O) -> RetryReport<O::Output>
    where
        O: Operation + ?Sized,
    {
        let max_attempts = self.config.max_attempts();
        let mut attempts = Vec::new();
        let mut attempt_number = 1;

        loop {
            let started_at = Utc::now();

            let error = match operation.call().await {
                Ok(value) => {
                    self.record(
                        &mut attempts,
                        AttemptRecord {
                            attempt_number,
                            started_at,
                            outcome: AttemptOutcome::Succeeded,
                            delay_before_next: None,
                        },
                    );
                    if attempt_number > 1 {
                        debug!(
                            attempt = attempt_number,
                            "[retry.execute] operation succeeded after retries"
                        );
                    }
                    return RetryReport {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(failure) => classify(&failure),
            };

            if !self.config.is_retryable(error.kind) || attempt_number >= max_attempts {
                warn!(
                    attempt = attempt_number,
                    max_attempts,
                    kind = %error.kind,
                    error = %error.message,
                    "[retry.execute] giving up"
                );
                self.record(
                    &mut attempts,
                    AttemptRecord {
                        attempt_number,
                        started_at,
                        outcome: AttemptOutcome::Failed(error.clone()),
                        delay_before_next: None,
                    },
                );
                return RetryReport {
                    result: Err(error),
                    attempts,
                };
            }

            let delay = next_delay(self.config, attempt_number, &error);
            warn!(
                attempt = attempt_number,
                max_attempts,
                kind = %error.kind,
                delay_ms = delay.as_millis() as u64,
                error = %error.message,
                "[retry.execute] attempt failed, retrying"
            );
            self.record(
                &mut attempts,
                AttemptRecord {
                    attempt_number,
                    started_at,
                    outcome: AttemptOutcome::Failed(error.clone()),
                    delay_before_next: Some(delay),
                },
            );

            if !self.wait(delay).await {
                warn!(
                    attempt = attempt_number,
                    "[retry.execute] cancelled during backoff"
                );
                return RetryReport {
                    result: Err(error),
                    attempts,
                };
            }

            attempt_number += 1;
        }
    }

    fn record(&self, attempts: &mut Vec<AttemptRecord>, record: AttemptRecord) {
        if let Some(observer) = self.observer {
            observer.on_attempt(&record);
        }
        attempts.push(record);
    }

    /// Sleep for `delay`; false when cancelled first.
    async fn wait(&self, delay: Duration) -> bool {
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

/// Run `operation` under `config` and return its final result.
pub async fn execute<O>(operation: O, config: &RetryConfig) -> Result<O::Output, ClassifiedError>
where
    O: Operation,
{
    Retrier::new(config).run(&operation).await.into_result()
}

/// Delay after the failed attempt number `attempt`, before jitter.
///
/// `min(max_delay, base_delay * backoff_multiplier^(attempt - 1))`
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let grown = config.base_delay().as_nanos() as f64 * config.backoff_multiplier().powi(exponent);
    let capped = grown.min(config.max_delay().as_nanos() as f64);
    Duration::from_nanos(capped.round() as u64)
}

/// Scale `delay` by a factor drawn uniformly from `[1 - fraction, 1 + fraction]`.
pub fn jittered_delay(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::rng().random_range((1.0 - fraction)..=(1.0 + fraction));
    Duration::from_nanos((delay.as_nanos() as f64 * factor).round() as u64)
}

fn next_delay(config: &RetryConfig, attempt: u32, error: &ClassifiedError) -> Duration {
    error.retry_after.unwrap_or_else(|| {
        jittered_delay(backoff_delay(config, attempt), config.jitter_fraction())
    })
}
