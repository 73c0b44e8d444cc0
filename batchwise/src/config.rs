//! Retry and concurrency configuration with type-safe validation.
//!
//! Bounded numeric settings use `nutype` so an out-of-range value cannot be
//! constructed. Cross-field rules (`max_delay >= base_delay`) are checked
//! by [`RetryConfigBuilder::build`], which is also the path taken when a
//! [`RetryConfig`] is deserialized.

use std::collections::BTreeSet;
use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::ErrorKind;

/// Errors raised while assembling configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A required setting was not provided.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl ToString) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Maximum number of attempts per operation, including the first (1 to 100).
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    ),
    default = 3
)]
pub struct MaxAttempts(u32);

/// Exponential backoff multiplier; strictly greater than one, at most ten.
#[nutype(
    validate(finite, greater = 1.0, less_or_equal = 10.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Default, Serialize, Deserialize),
    default = 2.0
)]
pub struct BackoffMultiplier(f64);

/// Fraction of a delay that jitter may add or remove.
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Default, Serialize, Deserialize),
    default = 0.2
)]
pub struct JitterFraction(f64);

/// Number of batch items that may be in flight at once.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Display,
        Serialize,
        Deserialize
    ),
    default = 4
)]
pub struct ConcurrencyLimit(usize);

/// Number of entities requested per listing page.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 5_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Display,
        Serialize,
        Deserialize
    ),
    default = 100
)]
pub struct PageSize(u32);

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Immutable retry policy shared by every operation of a client.
///
/// Build one with [`RetryConfig::builder`]; the value is never mutated
/// afterwards and can be shared freely across workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RetryConfigBuilder")]
pub struct RetryConfig {
    max_attempts: MaxAttempts,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: BackoffMultiplier,
    jitter_fraction: JitterFraction,
    retryable_kinds: BTreeSet<ErrorKind>,
}

impl RetryConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Single attempt, nothing retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: MaxAttempts::try_new(1).expect("1 is a valid attempt count"),
            ..Self::default()
        }
    }

    /// Short delays and few attempts, for interactive callers.
    pub fn fast() -> Self {
        Self {
            max_attempts: MaxAttempts::try_new(2).expect("2 is a valid attempt count"),
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: BackoffMultiplier::try_new(1.5).expect("1.5 is a valid multiplier"),
            ..Self::default()
        }
    }

    /// Many attempts with long ceilings, for unattended bulk jobs.
    pub fn fault_tolerant() -> Self {
        Self {
            max_attempts: MaxAttempts::try_new(10).expect("10 is a valid attempt count"),
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: BackoffMultiplier::try_new(2.5).expect("2.5 is a valid multiplier"),
            ..Self::default()
        }
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.into_inner()
    }

    /// Delay before the second attempt.
    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Ceiling for computed delays.
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Growth factor between consecutive delays.
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier.into_inner()
    }

    /// Jitter spread as a fraction of the delay.
    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction.into_inner()
    }

    /// Kinds that trigger another attempt.
    pub const fn retryable_kinds(&self) -> &BTreeSet<ErrorKind> {
        &self.retryable_kinds
    }

    /// Whether a failure of `kind` is retried.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MaxAttempts::default(),
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: BackoffMultiplier::default(),
            jitter_fraction: JitterFraction::default(),
            retryable_kinds: default_retryable_kinds(),
        }
    }
}

fn default_retryable_kinds() -> BTreeSet<ErrorKind> {
    ErrorKind::ALL
        .into_iter()
        .filter(|kind| kind.is_retryable_by_default())
        .collect()
}

/// Builder for [`RetryConfig`]. Unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfigBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    backoff_multiplier: Option<f64>,
    jitter_fraction: Option<f64>,
    retryable_kinds: Option<BTreeSet<ErrorKind>>,
}

impl RetryConfigBuilder {
    /// Maximum attempts (1..=100).
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before the second attempt (> 0).
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Ceiling for computed delays (>= base delay).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Backoff multiplier (> 1.0, <= 10.0).
    #[must_use]
    pub const fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    /// Jitter fraction (0.0..=1.0).
    #[must_use]
    pub const fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = Some(fraction);
        self
    }

    /// Replace the set of retryable kinds.
    #[must_use]
    pub fn retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<RetryConfig, ConfigError> {
        let defaults = RetryConfig::default();

        let max_attempts = match self.max_attempts {
            Some(value) => {
                MaxAttempts::try_new(value).map_err(|e| ConfigError::invalid("max_attempts", e))?
            }
            None => defaults.max_attempts,
        };
        let backoff_multiplier = match self.backoff_multiplier {
            Some(value) => BackoffMultiplier::try_new(value)
                .map_err(|e| ConfigError::invalid("backoff_multiplier", e))?,
            None => defaults.backoff_multiplier,
        };
        let jitter_fraction = match self.jitter_fraction {
            Some(value) => JitterFraction::try_new(value)
                .map_err(|e| ConfigError::invalid("jitter_fraction", e))?,
            None => defaults.jitter_fraction,
        };

        let base_delay = self.base_delay.unwrap_or(defaults.base_delay);
        if base_delay.is_zero() {
            return Err(ConfigError::invalid("base_delay", "must be greater than zero"));
        }
        let max_delay = self.max_delay.unwrap_or_else(|| defaults.max_delay.max(base_delay));
        if max_delay < base_delay {
            return Err(ConfigError::invalid(
                "max_delay",
                format!("{max_delay:?} is shorter than base_delay {base_delay:?}"),
            ));
        }

        Ok(RetryConfig {
            max_attempts,
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter_fraction,
            retryable_kinds: self.retryable_kinds.unwrap_or(defaults.retryable_kinds),
        })
    }
}

impl TryFrom<RetryConfigBuilder> for RetryConfig {
    type Error = ConfigError;

    fn try_from(builder: RetryConfigBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}
