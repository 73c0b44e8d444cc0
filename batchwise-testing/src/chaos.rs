//! Fault injection at the transport seam.
//!
//! [`ChaosTransport`] wraps any [`Transport`] and fails a configurable
//! share of requests with rate limits or service errors, drawn from a
//! seeded RNG so failing runs can be replayed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use batchwise::{Method, Transport, TransportFailure};
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use serde_json::Value;
use tracing::debug;

/// Probability value for fault injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject and 1.0 means always inject.
///
/// # Examples
///
/// ```ignore
/// use batchwise_testing::chaos::Probability;
///
/// let never = Probability::try_new(0.0).unwrap();
/// let always = Probability::try_new(1.0).unwrap();
///
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f64);

impl Probability {
    fn clamped(value: f64) -> Option<Self> {
        Self::try_new(value.clamp(0.0, 1.0)).ok()
    }
}

/// What a [`ChaosTransport`] injects and how often.
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Option<Probability>,
    rate_limit_probability: Option<Probability>,
    retry_after: Option<Duration>,
}

impl ChaosConfig {
    /// Injection decisions drawn from a fixed seed.
    pub fn deterministic() -> Self {
        Self::seeded(0)
    }

    /// Injection decisions drawn from `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            deterministic_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Fail requests with a 503 before they reach the service.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f64) -> Self {
        self.failure_probability = Probability::clamped(probability);
        self
    }

    /// Reject requests with a 429 before they reach the service.
    #[must_use]
    pub fn with_rate_limit_probability(mut self, probability: f64) -> Self {
        self.rate_limit_probability = Probability::clamped(probability);
        self
    }

    /// Wait hint attached to injected rate limits.
    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Wrap any transport in a [`ChaosTransport`].
pub trait ChaosTransportExt: Sized {
    /// Inject faults according to `config`.
    fn with_chaos(self, config: ChaosConfig) -> ChaosTransport<Self>;
}

/// Transport decorator that fails a share of requests before forwarding
/// them. Injected failures never reach the inner transport.
pub struct ChaosTransport<T> {
    inner: T,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    injected: AtomicUsize,
}

impl<T> ChaosTransport<T> {
    /// Decorate `inner`.
    pub fn new(inner: T, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            inner,
            config,
            rng: Mutex::new(rng),
            injected: AtomicUsize::new(0),
        }
    }

    /// Number of faults injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    /// The wrapped transport.
    pub const fn inner(&self) -> &T {
        &self.inner
    }

    fn should_inject(&self, probability: Option<Probability>) -> bool {
        let Some(probability) = probability.map(Probability::into_inner) else {
            return false;
        };

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(probability)
    }

    fn injected_failure(&self, method: Method, path: &str) -> Option<TransportFailure> {
        let failure = if self.should_inject(self.config.rate_limit_probability) {
            let failure = TransportFailure::from_status(429, "injected rate limit");
            match self.config.retry_after {
                Some(wait) => failure.with_retry_after(wait),
                None => failure,
            }
        } else if self.should_inject(self.config.failure_probability) {
            TransportFailure::from_status(503, "injected service failure")
        } else {
            return None;
        };

        let injected = self.injected.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(%method, path, injected, failure = %failure, "[chaos.request] fault injected");
        Some(failure)
    }
}

#[async_trait]
impl<T> Transport for ChaosTransport<T>
where
    T: Transport,
{
    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<Value, TransportFailure> {
        if let Some(failure) = self.injected_failure(method, path) {
            return Err(failure);
        }
        self.inner.request(method, path, payload).await
    }
}

impl<T> ChaosTransportExt for T
where
    T: Transport,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosTransport<Self> {
        ChaosTransport::new(self, config)
    }
}
