//! Client configuration.
//!
//! [`RestOptions`] can be built in code through [`RestOptions::builder`] or deserialized from
//! any serde format. Durations are expressed in milliseconds when deserialized.
//!
//! ```rust
//! use labrinth_rest::RestOptions;
//! use std::time::Duration;
//!
//! let options = RestOptions::builder()
//!     .timeout(Duration::from_secs(30))
//!     .retries(5)
//!     .reject_routes(["/search"])
//!     .build()
//!     .unwrap();
//! assert_eq!(options.retries, 5);
//! ```

use crate::telemetry::RateLimitInfo;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.modrinth.com";
pub const DEFAULT_API_VERSION: &str = "2";
pub const DEFAULT_USER_AGENT: &str = concat!("labrinth-rest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid base url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("global requests per second must be greater than zero")]
    ZeroGlobalRate,
    #[error("failed to build http client: {0}")]
    Client(String),
}

type RejectFn = dyn Fn(RateLimitInfo) -> BoxFuture<'static, bool> + Send + Sync;

/// Decides whether a rate-limited request fails instead of waiting.
#[derive(Clone, Default)]
pub enum RejectOnRateLimit {
    /// Always wait.
    #[default]
    Never,
    /// Fail when the bucket route starts with any of these prefixes (compared lowercased).
    Routes(Vec<String>),
    /// Fail when the predicate returns `true`.
    Predicate(Arc<RejectFn>),
}

impl RejectOnRateLimit {
    pub fn routes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Routes(prefixes.into_iter().map(Into::into).collect())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&RateLimitInfo) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(move |info: RateLimitInfo| {
            let reject = f(&info);
            async move { reject }.boxed()
        }))
    }

    pub fn async_predicate<F, Fut>(f: F) -> Self
    where
        F: Fn(RateLimitInfo) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        Self::Predicate(Arc::new(move |info: RateLimitInfo| f(info).boxed()))
    }

    pub async fn should_reject(&self, info: &RateLimitInfo) -> bool {
        match self {
            Self::Never => false,
            Self::Routes(prefixes) => {
                prefixes.iter().any(|prefix| info.route.starts_with(&prefix.to_lowercase()))
            }
            Self::Predicate(f) => f(info.clone()).await,
        }
    }
}

impl fmt::Debug for RejectOnRateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Routes(routes) => f.debug_tuple("Routes").field(routes).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl<'de> Deserialize<'de> for RejectOnRateLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<Vec<String>>::deserialize(deserializer)? {
            Some(routes) => Self::Routes(routes),
            None => Self::Never,
        })
    }
}

/// Options recognized by the client.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RestOptions {
    /// API origin without the version prefix.
    pub base_url: String,
    pub api_version: String,
    pub user_agent: String,
    pub auth_token: Option<String>,
    /// Sent with every request; overrides per-request headers of the same name.
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "timeout_ms", deserialize_with = "millis")]
    pub timeout: Duration,
    /// Re-sends allowed for 5xx responses and timeouts.
    pub retries: u32,
    /// Local quota of a new bucket for its first second, until a response reports the real
    /// limit. Only matters when the first attempts get no response (timeouts).
    pub requests_per_second: u64,
    pub global_requests_per_second: u64,
    /// Extra margin added to every rate-limit wait.
    #[serde(rename = "offset_ms", deserialize_with = "clamped_millis")]
    pub offset: Duration,
    /// Emit a warning every N invalid responses; 0 disables.
    pub invalid_request_warning_interval: u64,
    #[serde(rename = "reject_on_rate_limit_routes")]
    pub reject_on_rate_limit: RejectOnRateLimit,
    /// Evict idle buckets on this interval; `None` keeps them for the client's lifetime.
    #[serde(rename = "bucket_sweep_interval_ms", deserialize_with = "optional_millis")]
    pub bucket_sweep_interval: Option<Duration>,
}

impl Default for RestOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            auth_token: None,
            headers: BTreeMap::new(),
            timeout: Duration::from_millis(15_000),
            retries: 3,
            requests_per_second: 50,
            global_requests_per_second: 50,
            offset: Duration::from_millis(50),
            invalid_request_warning_interval: 0,
            reject_on_rate_limit: RejectOnRateLimit::Never,
            bucket_sweep_interval: None,
        }
    }
}

impl fmt::Debug for RestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestOptions")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("user_agent", &self.user_agent)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("requests_per_second", &self.requests_per_second)
            .field("global_requests_per_second", &self.global_requests_per_second)
            .field("offset", &self.offset)
            .field("invalid_request_warning_interval", &self.invalid_request_warning_interval)
            .field("reject_on_rate_limit", &self.reject_on_rate_limit)
            .field("bucket_sweep_interval", &self.bucket_sweep_interval)
            .finish()
    }
}

impl RestOptions {
    pub fn builder() -> RestOptionsBuilder {
        RestOptionsBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: "empty".into(),
            });
        }
        url::Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.global_requests_per_second == 0 {
            return Err(ConfigError::ZeroGlobalRate);
        }
        Ok(())
    }

    pub(crate) fn offset_millis(&self) -> u64 {
        u64::try_from(self.offset.as_millis()).unwrap_or(u64::MAX)
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn clamped_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    i64::deserialize(deserializer).map(|ms| Duration::from_millis(ms.max(0) as u64))
}

fn optional_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
}

#[derive(Debug, Default)]
pub struct RestOptionsBuilder {
    options: RestOptions,
}

impl RestOptionsBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.options.base_url = url.into();
        self
    }

    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.options.api_version = version.into();
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.options.user_agent = agent.into();
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.options.auth_token = Some(token.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.options.retries = retries;
        self
    }

    pub fn requests_per_second(mut self, rate: u64) -> Self {
        self.options.requests_per_second = rate;
        self
    }

    pub fn global_requests_per_second(mut self, rate: u64) -> Self {
        self.options.global_requests_per_second = rate;
        self
    }

    pub fn offset(mut self, offset: Duration) -> Self {
        self.options.offset = offset;
        self
    }

    /// Offset in signed milliseconds; negative values are clamped to zero.
    pub fn offset_ms(mut self, offset: i64) -> Self {
        self.options.offset = Duration::from_millis(offset.max(0) as u64);
        self
    }

    pub fn invalid_request_warning_interval(mut self, every: u64) -> Self {
        self.options.invalid_request_warning_interval = every;
        self
    }

    pub fn reject_on_rate_limit(mut self, policy: RejectOnRateLimit) -> Self {
        self.options.reject_on_rate_limit = policy;
        self
    }

    pub fn reject_routes<I, S>(self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reject_on_rate_limit(RejectOnRateLimit::routes(prefixes))
    }

    /// Sweep idle buckets on this interval. The sweeper task is spawned when the client is
    /// built, so the client must be built inside a tokio runtime; otherwise a warning is logged
    /// and buckets are only swept through `Rest::sweep_idle_buckets`.
    pub fn bucket_sweep_interval(mut self, interval: Duration) -> Self {
        self.options.bucket_sweep_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<RestOptions, ConfigError> {
        self.options.validate()?;
        Ok(self.options)
    }
}
