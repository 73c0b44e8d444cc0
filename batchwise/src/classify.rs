//! Failure classification.
//!
//! Every failure raised by a remote call is mapped onto a fixed taxonomy
//! ([`ErrorKind`]) before the retry engine looks at it. Transports expose
//! what they know about a failure through the [`FailureDetails`] capability
//! trait; [`classify`] turns that into a [`ClassifiedError`].
//!
//! # Mapping policy
//!
//! Checked in order, first match wins:
//!
//! | Signal                                              | Kind           |
//! |-----------------------------------------------------|----------------|
//! | status 429 or a rate-limit message                  | `RateLimited`  |
//! | status 500/502/503/504, connection failure, or a    | `Transient`    |
//! | connection/timeout message with no status           |                |
//! | status 404                                          | `NotFound`     |
//! | status 409                                          | `Conflict`     |
//! | status 401/403                                      | `Unauthorized` |
//! | status 400/422                                      | `InvalidInput` |
//! | anything else, including no status                  | `Fatal`        |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Taxonomy of remote failures. Drives retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Server-side or connection-level hiccup; retrying may succeed.
    Transient,
    /// The service asked us to slow down.
    RateLimited,
    /// The addressed resource does not exist.
    NotFound,
    /// The resource already exists or was modified concurrently.
    Conflict,
    /// Missing or insufficient credentials.
    Unauthorized,
    /// The request payload was rejected.
    InvalidInput,
    /// Anything the classifier could not place elsewhere.
    Fatal,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Transient,
        Self::RateLimited,
        Self::NotFound,
        Self::Conflict,
        Self::Unauthorized,
        Self::InvalidInput,
        Self::Fatal,
    ];

    /// Whether the default retry configuration retries this kind.
    pub const fn is_retryable_by_default(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }

    /// Stable snake_case name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::InvalidInput => "invalid_input",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities a failure type exposes to the classifier.
///
/// Transports implement this for their own failure type instead of the
/// classifier probing arbitrary errors at runtime.
pub trait FailureDetails {
    /// Numeric status reported by the remote service, if any.
    fn status(&self) -> Option<u16>;

    /// Human-readable description, if any.
    fn message(&self) -> Option<&str>;

    /// Server-directed wait before the next attempt (e.g. `Retry-After`).
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// True when the failure happened below the protocol level
    /// (connection refused, reset, timed out).
    fn is_connection_failure(&self) -> bool {
        false
    }

    /// Kind already decided by an earlier classification.
    fn kind_hint(&self) -> Option<ErrorKind> {
        None
    }
}

/// A failure after classification.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    /// Taxonomy bucket.
    pub kind: ErrorKind,
    /// Server-directed backoff, overriding computed delays.
    pub retry_after: Option<Duration>,
    /// Description carried over from the original failure.
    pub message: String,
    /// Status carried over from the original failure.
    pub raw_status: Option<u16>,
}

impl ClassifiedError {
    /// Build a classified error directly.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retry_after: None,
            message: message.into(),
            raw_status: None,
        }
    }

    /// Shorthand for a `Fatal` error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Attach a server-directed wait.
    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Attach the raw status.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.raw_status = Some(status);
        self
    }
}

impl FailureDetails for ClassifiedError {
    fn status(&self) -> Option<u16> {
        self.raw_status
    }

    fn message(&self) -> Option<&str> {
        Some(&self.message)
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    fn kind_hint(&self) -> Option<ErrorKind> {
        Some(self.kind)
    }
}

const RATE_LIMIT_SIGNATURES: [&str; 2] = ["rate limit", "too many requests"];
const CONNECTION_SIGNATURES: [&str; 4] = ["timeout", "timed out", "connection", "network"];

/// Classify a failure. Pure and deterministic; never fails.
pub fn classify<F>(failure: &F) -> ClassifiedError
where
    F: FailureDetails + ?Sized,
{
    let status = failure.status();
    let message = failure.message();

    if status.is_none() && message.is_none() && failure.kind_hint().is_none() {
        return ClassifiedError {
            kind: ErrorKind::Fatal,
            retry_after: None,
            message: "unclassified failure without status or message".to_string(),
            raw_status: None,
        };
    }

    let lowered = message.map(str::to_ascii_lowercase).unwrap_or_default();
    let kind = failure
        .kind_hint()
        .unwrap_or_else(|| kind_for(status, &lowered, failure.is_connection_failure()));

    // Wait hints only travel with kinds the service expects to be retried.
    let retry_after = match kind {
        ErrorKind::RateLimited | ErrorKind::Transient => failure.retry_after(),
        _ if failure.kind_hint().is_some() => failure.retry_after(),
        _ => None,
    };

    ClassifiedError {
        kind,
        retry_after,
        message: message.map_or_else(|| default_message(status), ToString::to_string),
        raw_status: status,
    }
}

fn kind_for(status: Option<u16>, lowered_message: &str, connection: bool) -> ErrorKind {
    let mentions = |signatures: &[&str]| signatures.iter().any(|s| lowered_message.contains(s));

    if status == Some(429) || mentions(&RATE_LIMIT_SIGNATURES) {
        return ErrorKind::RateLimited;
    }
    // A response with a status came back over a working connection.
    let connection_words = status.is_none() && mentions(&CONNECTION_SIGNATURES);
    if matches!(status, Some(500 | 502 | 503 | 504)) || connection || connection_words {
        return ErrorKind::Transient;
    }
    match status {
        Some(404) => ErrorKind::NotFound,
        Some(409) => ErrorKind::Conflict,
        Some(401 | 403) => ErrorKind::Unauthorized,
        Some(400 | 422) => ErrorKind::InvalidInput,
        _ => ErrorKind::Fatal,
    }
}

fn default_message(status: Option<u16>) -> String {
    status.map_or_else(
        || "remote call failed".to_string(),
        |status| format!("remote call failed with status {status}"),
    )
}
