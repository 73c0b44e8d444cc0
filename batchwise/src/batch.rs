//! Bounded-concurrency batch execution.
//!
//! A batch is a list of independent [`BatchItem`]s. Up to
//! [`ConcurrencyLimit`] worker futures claim items through a shared atomic
//! counter, run each one through the retry engine and record its terminal
//! outcome. One item's failure never stops the others, and the returned
//! [`BatchResult`] lists items in submission order whatever order they
//! finished in.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::classify::ClassifiedError;
use crate::config::{ConcurrencyLimit, RetryConfig};
use crate::retry::{AttemptObserver, Operation, Retrier, RetryReport};

/// One unit of work in a batch.
#[derive(Debug, Clone)]
pub struct BatchItem<K, O> {
    /// Caller-supplied identifier, unique within the batch.
    pub key: K,
    /// Work to perform.
    pub operation: O,
}

impl<K, O> BatchItem<K, O> {
    /// Pair `key` with `operation`.
    pub const fn new(key: K, operation: O) -> Self {
        Self { key, operation }
    }
}

/// Terminal state of one batch item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ItemOutcome<T> {
    /// The operation produced a value.
    Succeeded(T),
    /// The operation failed for good.
    Failed(ClassifiedError),
    /// The item was never claimed because the batch was cancelled.
    NotRun,
}

impl<T> ItemOutcome<T> {
    /// Whether the item succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// The failure, if the item failed.
    pub const fn error(&self) -> Option<&ClassifiedError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Result slot of one submitted item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchEntry<K, T> {
    /// Key the item was submitted with.
    pub key: K,
    /// What happened to it.
    pub outcome: ItemOutcome<T>,
    /// Attempts spent on it; zero when not run.
    pub attempts: u32,
}

/// Tally of outcomes across a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    /// Items that succeeded.
    pub succeeded: usize,
    /// Items that failed after retries.
    pub failed: usize,
    /// Items never started.
    pub not_run: usize,
}

/// Aggregate outcome of a batch, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult<K, T> {
    /// One entry per submitted item, in submission order.
    pub entries: Vec<BatchEntry<K, T>>,
    /// Outcome tallies.
    pub counts: BatchCounts,
    /// True when cancellation left at least one item `NotRun`. A token
    /// cancelled after every item was claimed leaves this false.
    pub cancelled: bool,
}

impl<K, T> BatchResult<K, T> {
    fn from_entries(entries: Vec<BatchEntry<K, T>>, token_cancelled: bool) -> Self {
        let mut counts = BatchCounts::default();
        for entry in &entries {
            match entry.outcome {
                ItemOutcome::Succeeded(_) => counts.succeeded += 1,
                ItemOutcome::Failed(_) => counts.failed += 1,
                ItemOutcome::NotRun => counts.not_run += 1,
            }
        }
        let cancelled = token_cancelled && counts.not_run > 0;
        Self {
            entries,
            counts,
            cancelled,
        }
    }

    /// Number of submitted items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True for an empty batch.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every item succeeded.
    pub const fn all_succeeded(&self) -> bool {
        self.counts.failed == 0 && self.counts.not_run == 0
    }

    /// Successful items with their values.
    pub fn successes(&self) -> impl Iterator<Item = (&K, &T)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            ItemOutcome::Succeeded(value) => Some((&entry.key, value)),
            _ => None,
        })
    }

    /// Failed items with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&K, &ClassifiedError)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.outcome.error().map(|error| (&entry.key, error)))
    }

    /// Keys of items that never ran.
    pub fn not_run(&self) -> impl Iterator<Item = &K> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.outcome, ItemOutcome::NotRun))
            .map(|entry| &entry.key)
    }

    /// Transform every success value, keeping order and failures.
    pub fn map_values<U>(self, mut f: impl FnMut(T) -> U) -> BatchResult<K, U> {
        let entries = self
            .entries
            .into_iter()
            .map(|entry| BatchEntry {
                key: entry.key,
                outcome: match entry.outcome {
                    ItemOutcome::Succeeded(value) => ItemOutcome::Succeeded(f(value)),
                    ItemOutcome::Failed(error) => ItemOutcome::Failed(error),
                    ItemOutcome::NotRun => ItemOutcome::NotRun,
                },
                attempts: entry.attempts,
            })
            .collect();
        BatchResult {
            entries,
            counts: self.counts,
            cancelled: self.cancelled,
        }
    }
}

/// Runs batches under one retry policy and concurrency limit.
#[derive(Clone)]
pub struct BatchExecutor<'a> {
    config: &'a RetryConfig,
    concurrency: ConcurrencyLimit,
    cancellation: Option<CancellationToken>,
    observer: Option<&'a dyn AttemptObserver>,
}

impl std::fmt::Debug for BatchExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("config", self.config)
            .field("concurrency", &self.concurrency)
            .field("cancellation", &self.cancellation)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl<'a> BatchExecutor<'a> {
    /// Executor with the default concurrency limit.
    pub fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            concurrency: ConcurrencyLimit::default(),
            cancellation: None,
            observer: None,
        }
    }

    /// Allow at most `limit` items in flight.
    #[must_use]
    pub const fn with_concurrency(mut self, limit: ConcurrencyLimit) -> Self {
        self.concurrency = limit;
        self
    }

    /// Stop claiming items once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Report every attempt of every item to `observer`.
    #[must_use]
    pub const fn with_observer(mut self, observer: &'a dyn AttemptObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run every item and collect their outcomes in submission order.
    #[instrument(
        name = "batch.execute",
        skip_all,
        fields(items = items.len(), concurrency = %self.concurrency)
    )]
    pub async fn execute<K, O>(&self, items: Vec<BatchItem<K, O>>) -> BatchResult<K, O::Output>
    where
        O: Operation,
    {
        let total = items.len();
        let (keys, operations): (Vec<K>, Vec<O>) = items
            .into_iter()
            .map(|item| (item.key, item.operation))
            .unzip();

        let retrier = self.retrier();
        let claimed = AtomicUsize::new(0);
        let workers = self.concurrency.into_inner().min(total);

        let retrier = &retrier;
        let claimed = &claimed;
        let operations = &operations;
        let finished = join_all((0..workers).map(move |worker| async move {
            let mut done = Vec::new();
            loop {
                if self.is_cancelled() {
                    debug!(worker, "[batch.execute] cancelled, worker stopping");
                    break;
                }
                let index = claimed.fetch_add(1, Ordering::SeqCst);
                let Some(operation) = operations.get(index) else {
                    break;
                };
                debug!(worker, index, "[batch.execute] claimed item");
                done.push((index, retrier.run(operation).await));
            }
            done
        }))
        .await;

        let mut slots: Vec<Option<RetryReport<O::Output>>> = (0..total).map(|_| None).collect();
        for (index, report) in finished.into_iter().flatten() {
            slots[index] = Some(report);
        }

        let entries = keys
            .into_iter()
            .zip(slots)
            .enumerate()
            .map(|(index, (key, slot))| match slot {
                Some(report) => {
                    let attempts = report.attempt_count();
                    let outcome = match report.result {
                        Ok(value) => ItemOutcome::Succeeded(value),
                        Err(error) => {
                            warn!(
                                index,
                                attempts,
                                kind = %error.kind,
                                error = %error.message,
                                "[batch.execute] item failed"
                            );
                            ItemOutcome::Failed(error)
                        }
                    };
                    BatchEntry {
                        key,
                        outcome,
                        attempts,
                    }
                }
                None => BatchEntry {
                    key,
                    outcome: ItemOutcome::NotRun,
                    attempts: 0,
                },
            })
            .collect();

        let result = BatchResult::from_entries(entries, self.is_cancelled());
        info!(
            succeeded = result.counts.succeeded,
            failed = result.counts.failed,
            not_run = result.counts.not_run,
            cancelled = result.cancelled,
            "[batch.execute] batch finished"
        );
        result
    }

    fn retrier(&self) -> Retrier<'a> {
        let mut retrier = Retrier::new(self.config);
        if let Some(observer) = self.observer {
            retrier = retrier.with_observer(observer);
        }
        if let Some(token) = &self.cancellation {
            retrier = retrier.with_cancellation(token.clone());
        }
        retrier
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Run `items` with at most `concurrency` in flight under `config`.
pub async fn execute_batch<K, O>(
    items: Vec<BatchItem<K, O>>,
    concurrency: ConcurrencyLimit,
    config: &RetryConfig,
) -> BatchResult<K, O::Output>
where
    O: Operation,
{
    BatchExecutor::new(config)
        .with_concurrency(concurrency)
        .execute(items)
        .await
}
