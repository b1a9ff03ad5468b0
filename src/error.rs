//! Error types surfaced by the dispatch core.
//!
//! Callers receive exactly one of these per failed request. Retries happen inside the bucket
//! handler and are only visible as latency.

use crate::api_error::ApiError;
use crate::request::Method;
use crate::telemetry::RateLimitInfo;
use std::fmt;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, RestError>;

/// Unified error type for every public request operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RestError {
    /// The request needs an auth token and none is set. Never reaches the network.
    #[error("expected an auth token to be set for this request, but none was present")]
    MissingCredential,
    /// 5xx after exhausting retries, a local timeout after exhausting retries, or a network
    /// failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// 4xx (other than 429) with the server's structured error body.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The reject-on-rate-limit policy chose to fail instead of waiting.
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    /// The caller's cancellation token fired while queued or in flight.
    #[error("request aborted by caller")]
    Aborted,
    /// The request could not be turned into a transport call (bad URL, header, or body).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A successful response body did not match the requested type.
    #[error("failed to decode response body: {0}")]
    Decode(String),
}

impl RestError {
    pub fn is_missing_credential(&self) -> bool {
        matches!(self, Self::MissingCredential)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_api(&self) -> bool {
        matches!(self, Self::Api(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// HTTP status carried by the error, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api(e) => Some(e.status),
            Self::Transport(e) => match e.failure {
                TransportFailure::Status(status) => Some(status),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_rate_limit(&self) -> Option<&RateLimitError> {
        match self {
            Self::RateLimited(e) => Some(e),
            _ => None,
        }
    }
}

/// What went wrong at the transport level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The server kept answering with this 5xx status.
    Status(u16),
    /// Every attempt hit the local timeout.
    Timeout(Duration),
    /// Connection-level failure; not retried.
    Network(String),
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::Status(status) => write!(f, "status {}", status),
            TransportFailure::Timeout(limit) => write!(f, "timeout after {:?}", limit),
            TransportFailure::Network(message) => write!(f, "network error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{method} {url} failed with {failure} after {retries} retries")]
pub struct TransportError {
    pub method: Method,
    pub url: String,
    pub failure: TransportFailure,
    /// Retries consumed before giving up.
    pub retries: u32,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self.failure, TransportFailure::Timeout(_))
    }
}

/// Raised only when the reject-on-rate-limit policy declines to wait.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limited: {info}")]
pub struct RateLimitError {
    pub info: RateLimitInfo,
}

impl RateLimitError {
    pub fn new(info: RateLimitInfo) -> Self {
        Self { info }
    }

    /// Error name including the route, e.g. `RateLimitError[/project/:id]`.
    pub fn name(&self) -> String {
        format!("RateLimitError[{}]", self.info.route)
    }

    pub fn time_to_reset(&self) -> Duration {
        self.info.time_to_reset
    }

    pub fn is_global(&self) -> bool {
        self.info.global
    }
}
