//! Public entry point.

use crate::bucket::BucketSnapshot;
use crate::clock::{Clock, MonotonicClock};
use crate::codec::{self, ResponseBody};
use crate::config::{ConfigError, RestOptions};
use crate::error::{RestError, Result};
use crate::invalid::InvalidRequestTracker;
use crate::manager::{ManagerParts, RequestManager};
use crate::request::{Method, Request, RequestData};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{EventSink, SinkHandle};
use crate::transport::{RawResponse, ReqwestTransport, Transport};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// A parsed response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl RestResponse {
    fn from_raw(raw: RawResponse) -> Self {
        let body = codec::parse_response(&raw.headers, raw.body);
        Self { status: raw.status, headers: raw.headers, body }
    }

    /// Deserialize the body; binary bodies are parsed as JSON too.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let parsed = match &self.body {
            ResponseBody::Json(value) => T::deserialize(value),
            ResponseBody::Binary(bytes) => serde_json::from_slice(bytes),
        };
        parsed.map_err(|e| RestError::Decode(e.to_string()))
    }
}

/// Rate-limit aware client. Cheap to clone; clones share buckets, quota, and token.
///
/// ```rust,no_run
/// use labrinth_rest::{RequestData, Rest, RestOptions};
///
/// # async fn run() -> labrinth_rest::Result<()> {
/// let rest = Rest::new(RestOptions::default()).expect("valid options");
/// let hits = rest.get("/search", RequestData::new().auth(false).query("query", "sodium")).await?;
/// println!("{:?}", hits.body);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Rest {
    manager: Arc<RequestManager>,
}

impl Rest {
    /// Build a client over the default `reqwest` transport.
    ///
    /// Must be called inside a tokio runtime when `bucket_sweep_interval` is set, or the
    /// background sweeper is not started.
    pub fn new(options: RestOptions) -> std::result::Result<Self, ConfigError> {
        Self::builder().options(options).build()
    }

    /// Start a builder for injecting a transport, clock, sleeper, or event sink.
    pub fn builder() -> RestBuilder {
        RestBuilder::default()
    }

    /// The validated options this client was built with.
    pub fn options(&self) -> &RestOptions {
        self.manager.options()
    }

    /// Replace the auth token. Requests enqueued from now on use it; requests already in
    /// flight keep the token they were sent with.
    pub fn set_token(&self, token: impl Into<String>) -> &Self {
        self.manager.set_token(token);
        self
    }

    /// Remove the auth token; authenticated requests then fail with
    /// [`RestError::MissingCredential`] until a new one is set.
    pub fn clear_token(&self) -> &Self {
        self.manager.clear_token();
        self
    }

    /// Whether a token is set. A 401 for the current token clears it.
    pub fn has_token(&self) -> bool {
        self.manager.has_token()
    }

    /// `GET route`, queued on the route's bucket.
    pub async fn get(&self, route: &str, data: RequestData) -> Result<RestResponse> {
        self.request(Request::new(Method::Get, route, data)).await
    }

    /// `POST route`; attach a JSON body, raw body, or files through `data`.
    pub async fn post(&self, route: &str, data: RequestData) -> Result<RestResponse> {
        self.request(Request::new(Method::Post, route, data)).await
    }

    /// `PATCH route`.
    pub async fn patch(&self, route: &str, data: RequestData) -> Result<RestResponse> {
        self.request(Request::new(Method::Patch, route, data)).await
    }

    /// `DELETE route`.
    pub async fn delete(&self, route: &str, data: RequestData) -> Result<RestResponse> {
        self.request(Request::new(Method::Delete, route, data)).await
    }

    /// Run a request and parse its body.
    pub async fn request(&self, request: Request) -> Result<RestResponse> {
        self.raw(request).await.map(RestResponse::from_raw)
    }

    /// Run a request and return the response untouched.
    pub async fn raw(&self, request: Request) -> Result<RawResponse> {
        self.manager.queue_request(request).await
    }

    /// Evict idle bucket handlers; returns how many were removed.
    pub fn sweep_idle_buckets(&self) -> usize {
        self.manager.sweep_idle_buckets()
    }

    /// Snapshot of every live bucket, ordered by key.
    pub fn buckets(&self) -> Vec<BucketSnapshot> {
        self.manager.bucket_snapshots()
    }

    /// Invalid responses seen in the current ten-minute window.
    pub fn invalid_request_count(&self) -> u64 {
        self.manager.invalid_request_count()
    }
}

/// Builder for [`Rest`]; every collaborator defaults to its production implementation.
#[derive(Default)]
pub struct RestBuilder {
    options: RestOptions,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    sink: Option<SinkHandle>,
    invalid: Option<InvalidRequestTracker>,
}

impl RestBuilder {
    /// Options to validate and use; [`RestOptions::default`] when not set.
    pub fn options(mut self, options: RestOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the HTTP transport, e.g. with a [`crate::ScriptedTransport`] in tests.
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use a preconfigured `reqwest` client.
    pub fn client(self, client: reqwest::Client) -> Self {
        self.transport(ReqwestTransport::from_client(client))
    }

    /// Time source for rate-limit bookkeeping.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Delay provider for rate-limit waits.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    /// Receiver of [`crate::RestEvent`]s; discarded when not set.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: EventSink,
        S::Future: Send + 'static,
    {
        self.sink = Some(SinkHandle::new(sink));
        self
    }

    /// Share one invalid-request window between several clients.
    pub fn invalid_request_tracker(mut self, tracker: InvalidRequestTracker) -> Self {
        self.invalid = Some(tracker);
        self
    }

    /// Validate the options and assemble the client.
    pub fn build(self) -> std::result::Result<Rest, ConfigError> {
        self.options.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let parts = ManagerParts {
            transport,
            clock: self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default())),
            sleeper: self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
            sink: self.sink.unwrap_or_default(),
            invalid: self.invalid.unwrap_or_default(),
        };
        Ok(Rest { manager: Arc::new(RequestManager::new(self.options, parts)) })
    }
}
