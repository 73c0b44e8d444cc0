//! Client configuration and the retrying request entry point.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::classify::ClassifiedError;
use crate::config::{ConcurrencyLimit, ConfigError, PageSize, RetryConfig};
use crate::helpers::{Databases, Storage, Users};
use crate::retry;
use crate::transport::{Method, Transport, TransportFailure};

/// Environment variable names read by [`ClientConfig::from_env`].
pub mod env {
    /// Service base URL.
    pub const ENDPOINT: &str = "BATCHWISE_ENDPOINT";
    /// Project identifier.
    pub const PROJECT_ID: &str = "BATCHWISE_PROJECT_ID";
    /// API key.
    pub const API_KEY: &str = "BATCHWISE_API_KEY";
    /// Per-attempt timeout in seconds.
    pub const TIMEOUT_SECS: &str = "BATCHWISE_TIMEOUT_SECS";
    /// Retries after the first attempt.
    pub const RETRY_ATTEMPTS: &str = "BATCHWISE_RETRY_ATTEMPTS";
    /// Base backoff delay in milliseconds.
    pub const RETRY_DELAY_MS: &str = "BATCHWISE_RETRY_DELAY_MS";
    /// Batch concurrency limit.
    pub const CONCURRENCY: &str = "BATCHWISE_CONCURRENCY";
    /// Listing page size.
    pub const PAGE_SIZE: &str = "BATCHWISE_PAGE_SIZE";
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection and behaviour settings for a [`Client`].
#[derive(Clone, PartialEq)]
pub struct ClientConfig {
    endpoint: String,
    project_id: String,
    api_key: String,
    timeout: Duration,
    retry: RetryConfig,
    concurrency: ConcurrencyLimit,
    page_size: PageSize,
}

impl ClientConfig {
    /// Settings for `endpoint` and `project_id` authenticated with `api_key`;
    /// everything else at its default.
    pub fn new(
        endpoint: impl Into<String>,
        project_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            project_id: project_id.into(),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryConfig::default(),
            concurrency: ConcurrencyLimit::default(),
            page_size: PageSize::default(),
        }
    }

    /// Read settings from the process environment. See [`env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let mut config = Self::new(
            required(env::ENDPOINT)?,
            required(env::PROJECT_ID)?,
            required(env::API_KEY)?,
        );

        if let Some(secs) = parse_var::<u64>(&lookup, env::TIMEOUT_SECS)? {
            config.timeout = Duration::from_secs(secs);
        }

        let retries = parse_var::<u32>(&lookup, env::RETRY_ATTEMPTS)?;
        let delay_ms = parse_var::<u64>(&lookup, env::RETRY_DELAY_MS)?;
        if retries.is_some() || delay_ms.is_some() {
            let mut builder = RetryConfig::builder();
            if let Some(retries) = retries {
                builder = builder.max_attempts(retries.saturating_add(1));
            }
            if let Some(delay_ms) = delay_ms {
                builder = builder.base_delay(Duration::from_millis(delay_ms));
            }
            config.retry = builder.build()?;
        }

        if let Some(limit) = parse_var::<usize>(&lookup, env::CONCURRENCY)? {
            config.concurrency = ConcurrencyLimit::try_new(limit)
                .map_err(|e| ConfigError::invalid(env::CONCURRENCY, e))?;
        }
        if let Some(size) = parse_var::<u32>(&lookup, env::PAGE_SIZE)? {
            config.page_size =
                PageSize::try_new(size).map_err(|e| ConfigError::invalid(env::PAGE_SIZE, e))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the batch concurrency limit.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: ConcurrencyLimit) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Replace the listing page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Check that the settings can be used to reach a service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid("endpoint", "must not be empty"));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "endpoint",
                format!("`{}` is not an http(s) URL", self.endpoint),
            ));
        }
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::invalid("project_id", "must not be empty"));
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::invalid("api_key", "must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than zero"));
        }
        Ok(())
    }

    /// Service base URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Project identifier.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// API key. Never logged.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Per-attempt timeout.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retry policy applied to every request.
    pub const fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Concurrency limit for bulk helpers.
    pub const fn concurrency(&self) -> ConcurrencyLimit {
        self.concurrency
    }

    /// Page size for listing helpers.
    pub const fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Settings as a flat map that is safe to log.
    pub fn redacted(&self) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([
            ("endpoint", json!(self.endpoint)),
            ("project_id", json!(self.project_id)),
            ("api_key", json!(self.masked_key())),
            ("timeout_secs", json!(self.timeout.as_secs())),
            ("max_attempts", json!(self.retry.max_attempts())),
            ("retry_delay_ms", json!(self.retry.base_delay().as_millis() as u64)),
            ("concurrency", json!(self.concurrency.into_inner())),
            ("page_size", json!(self.page_size.into_inner())),
        ])
    }

    fn masked_key(&self) -> &'static str {
        if self.api_key.is_empty() {
            ""
        } else {
            "***"
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("project_id", &self.project_id)
            .field("api_key", &self.masked_key())
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("concurrency", &self.concurrency)
            .field("page_size", &self.page_size)
            .finish()
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(name)
        .map(|raw| raw.trim().parse::<T>().map_err(|e| ConfigError::invalid(name, e)))
        .transpose()
}

/// Entry point for talking to the remote service.
///
/// Cheap to clone; clones share the transport.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Validate `config` and wrap `transport`.
    pub fn new(transport: impl Transport + 'static, config: ClientConfig) -> Result<Self, ConfigError> {
        Self::with_shared_transport(Arc::new(transport), config)
    }

    /// Like [`Client::new`] for a transport that is already shared.
    pub fn with_shared_transport(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            transport,
            config: Arc::new(config),
        })
    }

    /// Settings this client runs with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send one request without retrying.
    ///
    /// The attempt is bounded by the configured timeout; running out of time
    /// is reported as a connection failure.
    pub async fn request_once(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<Value, TransportFailure> {
        let timeout = self.config.timeout;
        tokio::time::timeout(timeout, self.transport.request(method, path, payload))
            .await
            .unwrap_or_else(|_| {
                Err(TransportFailure::connection(format!(
                    "request timed out after {timeout:?}"
                )))
            })
    }

    /// Send one request, retrying under the configured policy.
    #[instrument(name = "client.request", skip(self, method, payload), fields(method = %method))]
    pub async fn request_with_retry(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<Value, ClassifiedError> {
        let attempt = move || self.request_once(method, path, payload.clone());
        retry::execute(attempt, &self.config.retry).await
    }

    /// Ask the service whether it is healthy.
    pub async fn health_check(&self) -> Result<Value, ClassifiedError> {
        self.request_with_retry(Method::Get, "/health", None).await
    }

    /// Project id, endpoint and redacted settings of this client. Answered
    /// from local configuration without a request.
    pub fn get_project_info(&self) -> Value {
        json!({
            "project_id": self.config.project_id(),
            "endpoint": self.config.endpoint(),
            "config": self.config.redacted(),
        })
    }

    /// True when the service answers the health check.
    pub async fn test_connection(&self) -> bool {
        match self.health_check().await {
            Ok(_) => true,
            Err(error) => {
                debug!(kind = %error.kind, error = %error.message, "[client.test_connection] service unreachable");
                false
            }
        }
    }

    /// Document helpers.
    pub const fn databases(&self) -> Databases<'_> {
        Databases::new(self)
    }

    /// File helpers.
    pub const fn storage(&self) -> Storage<'_> {
        Storage::new(self)
    }

    /// User helpers.
    pub const fn users(&self) -> Users<'_> {
        Users::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKind;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        (env::ENDPOINT, "https://api.example.test/v1"),
        (env::PROJECT_ID, "proj"),
        (env::API_KEY, "secret-key"),
    ];

    #[test]
    fn loads_required_settings_with_defaults() {
        let config = ClientConfig::from_lookup(vars(&REQUIRED)).unwrap();

        assert_eq!(config.endpoint(), "https://api.example.test/v1");
        assert_eq!(config.project_id(), "proj");
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.retry(), &RetryConfig::default());
        assert_eq!(config.page_size(), PageSize::default());
    }

    #[test]
    fn optional_settings_override_defaults() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            (env::TIMEOUT_SECS, "5"),
            (env::RETRY_ATTEMPTS, "4"),
            (env::RETRY_DELAY_MS, "250"),
            (env::CONCURRENCY, "8"),
            (env::PAGE_SIZE, "50"),
        ]);

        let config = ClientConfig::from_lookup(vars(&pairs)).unwrap();

        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.retry().max_attempts(), 5);
        assert_eq!(config.retry().base_delay(), Duration::from_millis(250));
        assert_eq!(config.concurrency().into_inner(), 8);
        assert_eq!(config.page_size().into_inner(), 50);
    }

    #[test]
    fn missing_api_key_is_reported_by_name() {
        let result = ClientConfig::from_lookup(vars(&REQUIRED[..2]));

        assert_eq!(result.unwrap_err(), ConfigError::Missing(env::API_KEY));
    }

    #[test]
    fn unparsable_numbers_are_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push((env::CONCURRENCY, "lots"));

        let err = ClientConfig::from_lookup(vars(&pairs)).unwrap_err();

        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == env::CONCURRENCY));
    }

    #[test]
    fn validate_rejects_non_http_endpoint_and_zero_timeout() {
        assert!(ClientConfig::new("ftp://x", "p", "k").validate().is_err());
        assert!(ClientConfig::new("https://x", "p", "k")
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ClientConfig::new("https://x", "", "k").validate().is_err());
    }

    #[test]
    fn api_key_never_appears_in_debug_or_redacted_output() {
        let config = ClientConfig::new("https://x", "p", "super-secret");

        assert!(!format!("{config:?}").contains("super-secret"));
        let redacted = config.redacted();
        assert_eq!(redacted["api_key"], json!("***"));
        assert!(!serde_json::to_string(&redacted).unwrap().contains("super-secret"));
    }

    #[test]
    fn project_info_is_local_and_redacted() {
        let client = Client::new(
            Flaky {
                calls: AtomicU32::new(0),
                failures: u32::MAX,
            },
            ClientConfig::new("https://api.example.test/v1", "proj", "super-secret"),
        )
        .unwrap();

        let info = client.get_project_info();

        assert_eq!(info["project_id"], "proj");
        assert_eq!(info["endpoint"], "https://api.example.test/v1");
        assert_eq!(info["config"]["api_key"], "***");
        assert!(!info.to_string().contains("super-secret"));
    }

    struct Flaky {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn request(
            &self,
            _method: Method,
            path: &str,
            _payload: Option<Value>,
        ) -> Result<Value, TransportFailure> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(TransportFailure::from_status(503, "unavailable"))
            } else {
                Ok(json!({ "path": path }))
            }
        }
    }

    struct Stalled;

    #[async_trait]
    impl Transport for Stalled {
        async fn request(
            &self,
            _method: Method,
            _path: &str,
            _payload: Option<Value>,
        ) -> Result<Value, TransportFailure> {
            std::future::pending().await
        }
    }

    fn fast_config() -> ClientConfig {
        ClientConfig::new("https://x", "p", "k").with_retry(
            RetryConfig::builder()
                .max_attempts(3)
                .base_delay(Duration::from_millis(10))
                .jitter_fraction(0.0)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn request_with_retry_recovers_from_server_errors() {
        let client = Client::new(
            Flaky {
                calls: AtomicU32::new(0),
                failures: 2,
            },
            fast_config(),
        )
        .unwrap();

        let value = client.request_with_retry(Method::Get, "/ping", None).await.unwrap();

        assert_eq!(value, json!({ "path": "/ping" }));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempts_are_transient_and_retried() {
        let client = Client::new(Stalled, fast_config().with_timeout(Duration::from_secs(1))).unwrap();

        let err = client.health_check().await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(err.message.contains("timed out"));
        assert!(!client.test_connection().await);
    }

    #[test]
    fn client_refuses_invalid_config() {
        let result = Client::new(Stalled, ClientConfig::new("", "p", "k"));

        assert!(result.is_err());
    }
}
