//! `batchwise` - resilient bulk operations against a remote document,
//! storage and identity service.
//!
//! Single-entity, rate-limited, occasionally failing remote calls become
//! bulk operations with bounded concurrency, automatic retry and
//! cursor-transparent listing:
//!
//! - [`classify`] maps raw failures onto a fixed [`ErrorKind`] taxonomy.
//! - [`retry`] runs an operation with exponential backoff and jitter.
//! - [`paginate`] turns a cursor-based endpoint into a lazy stream.
//! - [`batch`] drives many independent operations with a concurrency limit
//!   and collects per-item outcomes in submission order.
//! - [`client`] and [`helpers`] wire those engines to a [`Transport`].
//!
//! The library never installs a tracing subscriber; it only emits events
//! and spans.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod classify;
pub mod client;
pub mod config;
pub mod helpers;
pub mod paginate;
pub mod query;
pub mod retry;
pub mod transport;

pub use batch::{
    execute_batch, BatchCounts, BatchEntry, BatchExecutor, BatchItem, BatchResult, ItemOutcome,
};
pub use classify::{classify, ClassifiedError, ErrorKind, FailureDetails};
pub use client::{Client, ClientConfig};
pub use config::{
    BackoffMultiplier, ConcurrencyLimit, ConfigError, JitterFraction, MaxAttempts, PageSize,
    RetryConfig, RetryConfigBuilder,
};
pub use helpers::{Databases, FileUpload, NewUser, OffsetPage, ProfileUpdate, Storage, Users};
pub use paginate::{paginate, Page, PageCursor, PageFetcher, Paginator};
pub use query::{Query, QueryParseError};
pub use retry::{
    AttemptObserver, AttemptOutcome, AttemptRecord, Operation, Retrier, RetryReport,
};
pub use transport::{Method, Transport, TransportFailure};
