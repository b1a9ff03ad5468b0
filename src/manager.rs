//! Request resolution and bucket routing.
//!
//! The [`RequestManager`] turns a logical [`Request`] into a [`TransportRequest`], finds (or
//! creates) the bucket handler for its route, and hands it over. Everything shared between
//! buckets lives in one `ManagerState`: the global quota, the single shared global delay, the
//! auth token, and the injected transport/clock/sleeper/sink.

use crate::bucket::{BucketHandler, BucketSnapshot};
use crate::clock::Clock;
use crate::codec;
use crate::config::RestOptions;
use crate::error::{RestError, Result};
use crate::invalid::InvalidRequestTracker;
use crate::request::{Request, RequestBody};
use crate::route::RouteDescriptor;
use crate::sleeper::Sleeper;
use crate::telemetry::SinkHandle;
use crate::timeout::TimeoutPolicy;
use crate::transport::{RawResponse, Transport, TransportRequest};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Length of the global quota window.
const GLOBAL_WINDOW_MS: u64 = 1_000;

#[derive(Debug, Default)]
struct GlobalQuota {
    remaining: i64,
    reset_at: Option<u64>,
}

type GlobalDelay = Shared<BoxFuture<'static, ()>>;

/// State shared by the manager and every bucket handler it creates.
pub(crate) struct ManagerState {
    pub(crate) options: RestOptions,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) sink: SinkHandle,
    pub(crate) invalid: InvalidRequestTracker,
    pub(crate) timeout: TimeoutPolicy,
    token: RwLock<Option<String>>,
    global: Mutex<GlobalQuota>,
    global_delay: Mutex<Option<GlobalDelay>>,
}

impl fmt::Debug for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerState")
            .field("options", &self.options)
            .field("transport", &self.transport)
            .field("has_token", &self.token().is_some())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ManagerState {
    pub(crate) fn token(&self) -> Option<String> {
        match self.token.read() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_token(&self, token: Option<String>) {
        match self.token.write() {
            Ok(mut slot) => *slot = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    pub(crate) fn clear_token(&self) {
        self.set_token(None);
    }

    /// Clear the token only if it is still `sent`. Returns whether it was cleared.
    pub(crate) fn clear_token_if(&self, sent: &str) -> bool {
        let mut slot = match self.token.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_deref() == Some(sent) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn global_limited(&self, now: u64) -> bool {
        let global = lock(&self.global);
        global.remaining <= 0 && global.reset_at.is_some_and(|reset_at| now < reset_at)
    }

    pub(crate) fn global_reset_at(&self) -> Option<u64> {
        lock(&self.global).reset_at
    }

    /// Pessimistically spend one global slot, opening a new window if the last one expired.
    pub(crate) fn take_global_slot(&self, now: u64) {
        let mut global = lock(&self.global);
        if !global.reset_at.is_some_and(|reset_at| reset_at > now) {
            global.reset_at = Some(now + GLOBAL_WINDOW_MS);
            global.remaining =
                i64::try_from(self.options.global_requests_per_second).unwrap_or(i64::MAX);
        }
        global.remaining -= 1;
    }

    /// The one in-flight global wait; later callers share it instead of starting their own.
    pub(crate) fn global_delay(state: &Arc<Self>, duration: Duration) -> GlobalDelay {
        let mut slot = lock(&state.global_delay);
        if let Some(delay) = slot.as_ref() {
            return delay.clone();
        }

        let weak: Weak<Self> = Arc::downgrade(state);
        let sleep = state.sleeper.sleep(duration);
        let delay = async move {
            sleep.await;
            if let Some(state) = weak.upgrade() {
                *lock(&state.global_delay) = None;
            }
        }
        .boxed()
        .shared();
        *slot = Some(delay.clone());
        delay
    }
}

/// A request ready for its bucket handler.
#[derive(Debug)]
pub(crate) struct PreparedRequest {
    pub(crate) route: RouteDescriptor,
    pub(crate) transport: TransportRequest,
    /// The token this request was authorized with, if it needed one.
    pub(crate) sent_token: Option<String>,
    pub(crate) signal: Option<CancellationToken>,
    pub(crate) request_json: Option<Value>,
    pub(crate) request_files: Vec<String>,
}

impl PreparedRequest {
    pub(crate) fn url(&self) -> &str {
        &self.transport.url
    }
}

/// Collaborators injected into a manager.
pub(crate) struct ManagerParts {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) sink: SinkHandle,
    pub(crate) invalid: InvalidRequestTracker,
}

type HandlerMap = Mutex<HashMap<String, Arc<BucketHandler>>>;

/// Owns the bucket handlers of one [`crate::Rest`] client and the state they share.
pub(crate) struct RequestManager {
    state: Arc<ManagerState>,
    handlers: Arc<HandlerMap>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestManager")
            .field("state", &self.state)
            .field("buckets", &lock(&self.handlers).len())
            .finish()
    }
}

impl Drop for RequestManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl RequestManager {
    pub(crate) fn new(options: RestOptions, parts: ManagerParts) -> Self {
        let token = options.auth_token.clone();
        let timeout = TimeoutPolicy::new(options.timeout);
        let sweep_interval = options.bucket_sweep_interval.filter(|interval| !interval.is_zero());
        let state = Arc::new(ManagerState {
            options,
            transport: parts.transport,
            clock: parts.clock,
            sleeper: parts.sleeper,
            sink: parts.sink,
            invalid: parts.invalid,
            timeout,
            token: RwLock::new(token),
            global: Mutex::new(GlobalQuota::default()),
            global_delay: Mutex::new(None),
        });
        let handlers: Arc<HandlerMap> = Arc::new(Mutex::new(HashMap::new()));

        let sweeper = sweep_interval.and_then(|interval| {
            spawn_sweeper(Arc::downgrade(&handlers), Arc::clone(&state.clock), interval)
        });

        Self { state, handlers, sweeper }
    }

    pub(crate) fn options(&self) -> &RestOptions {
        &self.state.options
    }

    /// Affects requests resolved after this call only.
    pub(crate) fn set_token(&self, token: impl Into<String>) {
        self.state.set_token(Some(token.into()));
    }

    pub(crate) fn clear_token(&self) {
        self.state.clear_token();
    }

    pub(crate) fn has_token(&self) -> bool {
        self.state.token().is_some()
    }

    pub(crate) fn invalid_request_count(&self) -> u64 {
        self.state.invalid.count()
    }

    /// Resolve `request`, route it to its bucket, and wait for the response.
    pub(crate) async fn queue_request(&self, request: Request) -> Result<RawResponse> {
        let prepared = self.resolve(request)?;
        let ticket = {
            let mut handlers = lock(&self.handlers);
            let key = prepared.route.bucket_key();
            let handler = handlers.entry(key.clone()).or_insert_with(|| {
                tracing::debug!(bucket = %key, "creating bucket handler");
                Arc::new(BucketHandler::new(
                    key,
                    prepared.route.major_parameter.clone(),
                    Arc::clone(&self.state),
                ))
            });
            handler.reserve()
        };
        ticket.run(prepared).await
    }

    /// Drop handlers with nothing queued and no active rate limit. Returns how many went.
    pub(crate) fn sweep_idle_buckets(&self) -> usize {
        sweep(&self.handlers, self.state.clock.now_millis())
    }

    pub(crate) fn bucket_snapshots(&self) -> Vec<BucketSnapshot> {
        let mut snapshots: Vec<_> =
            lock(&self.handlers).values().map(|handler| handler.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    fn resolve(&self, request: Request) -> Result<PreparedRequest> {
        let Request { method, route, data } = request;
        if !route.starts_with('/') {
            return Err(RestError::InvalidRequest(format!("route must start with '/': {}", route)));
        }

        let token = if data.auth {
            Some(self.state.token().ok_or(RestError::MissingCredential)?)
        } else {
            None
        };

        let descriptor = RouteDescriptor::derive(method, &route);
        let options = &self.state.options;

        let mut headers = HeaderMap::new();
        for (name, value) in &data.headers {
            insert_header(&mut headers, name, value)?;
        }
        for (name, value) in &options.headers {
            insert_header(&mut headers, name, value)?;
        }
        let agent = options.user_agent.trim();
        if !agent.is_empty() {
            insert_header(&mut headers, USER_AGENT.as_str(), agent)?;
        }
        if let Some(token) = &token {
            insert_header(&mut headers, AUTHORIZATION.as_str(), token)?;
        }

        let body = codec::resolve_body(data.body.as_ref(), &data.files)
            .map_err(|e| RestError::InvalidRequest(format!("failed to encode body: {}", e)))?;
        if let Some(content_type) = body.as_ref().and_then(|body| body.content_type.as_deref()) {
            insert_header(&mut headers, CONTENT_TYPE.as_str(), content_type)?;
        }

        let mut url = options.base_url.trim_end_matches('/').to_string();
        if data.versioned {
            url.push_str("/v");
            url.push_str(&options.api_version);
        }
        url.push_str(&route);
        if !data.query.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(data.query.iter())
                .finish();
            url.push('?');
            url.push_str(&query);
        }
        url::Url::parse(&url)
            .map_err(|e| RestError::InvalidRequest(format!("invalid url {}: {}", url, e)))?;

        let request_json = match &data.body {
            Some(RequestBody::Json(value)) => Some(value.clone()),
            _ => None,
        };
        let request_files = data.files.iter().map(|file| file.name.clone()).collect();

        Ok(PreparedRequest {
            route: descriptor,
            transport: TransportRequest {
                method: method.into(),
                url,
                headers,
                body: body.map(|body| body.data),
            },
            sent_token: token,
            signal: data.signal,
            request_json,
            request_files,
        })
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| RestError::InvalidRequest(format!("invalid header name {}: {}", name, e)))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|e| RestError::InvalidRequest(format!("invalid value for header {}: {}", name, e)))?;
    headers.insert(header_name, header_value);
    Ok(())
}

fn sweep(handlers: &HandlerMap, now: u64) -> usize {
    let mut handlers = lock(handlers);
    let before = handlers.len();
    handlers.retain(|_, handler| !handler.is_inactive(now));
    let removed = before - handlers.len();
    if removed > 0 {
        tracing::debug!(removed, remaining = handlers.len(), "swept idle bucket handlers");
    }
    removed
}

fn spawn_sweeper(
    handlers: Weak<HandlerMap>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) -> Option<tokio::task::JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(
            interval = ?interval,
            "no tokio runtime at construction; idle buckets are only swept on demand"
        );
        return None;
    };
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(handlers) = handlers.upgrade() else {
                break;
            };
            sweep(&handlers, clock.now_millis());
        }
    }))
}
