//! The seam between batchwise and the remote service.
//!
//! A [`Transport`] performs one request and either returns the parsed JSON
//! body or a [`TransportFailure`] describing what went wrong. Everything
//! above this trait (retry, pagination, batching) is transport-agnostic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::classify::FailureDetails;

/// Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Read.
    Get,
    /// Create.
    Post,
    /// Replace.
    Put,
    /// Partial update.
    Patch,
    /// Remove.
    Delete,
}

impl Method {
    /// Upper-case verb.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct TransportFailure {
    /// Status returned by the service, absent for connection-level failures.
    pub status: Option<u16>,
    /// Description from the service or the network layer.
    pub message: String,
    /// Server-directed wait before retrying.
    pub retry_after: Option<Duration>,
    /// The request never produced a response.
    pub connection: bool,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "status {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl TransportFailure {
    /// Failure with a service status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            retry_after: None,
            connection: false,
        }
    }

    /// Failure below the protocol level.
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            retry_after: None,
            connection: true,
        }
    }

    /// Attach a server-directed wait.
    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl FailureDetails for TransportFailure {
    fn status(&self) -> Option<u16> {
        self.status
    }

    fn message(&self) -> Option<&str> {
        (!self.message.is_empty()).then_some(self.message.as_str())
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    fn is_connection_failure(&self) -> bool {
        self.connection
    }
}

/// One request/response exchange with the remote service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` to `path` with `method`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<Value, TransportFailure>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<Value, TransportFailure> {
        (**self).request(method, path, payload).await
    }
}
