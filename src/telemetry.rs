//! Observable notifications emitted by the dispatch core.
//!
//! Events never influence request outcomes. They flow through sinks, which are
//! `tower::Service<RestEvent>` implementations, so sinks compose with ordinary tower
//! combinators.
//!
//! # Event Types
//!
//! - `RateLimited`: a request is about to wait (or be rejected) because a bucket or the global
//!   quota is exhausted.
//! - `InvalidRequestWarning`: every N-th 401/403/429 inside the ten-minute window.
//! - `Debug`: human-readable trace lines from bucket handlers.
//! - `Response`: every response received, before its status is classified.
//!
//! ```rust
//! use labrinth_rest::telemetry::{MemorySink, RestEvent};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(RestEvent::Debug("hello".into())).await.unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

use crate::request::Method;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};

/// Details of a rate-limit hit; also carried by [`crate::RateLimitError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// How long until the limiting window resets, offset included.
    pub time_to_reset: Duration,
    /// Requests allowed per window; `None` when the server reported no limit.
    pub limit: Option<u64>,
    pub method: Method,
    pub url: String,
    /// The generalized bucket route, e.g. `/project/:id`.
    pub route: String,
    pub major_parameter: String,
    /// Whether the process-wide quota, rather than the bucket's own, is the limiting factor.
    pub global: bool,
}

impl fmt::Display for RateLimitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limit = match self.limit {
            Some(limit) => limit.to_string(),
            None => "unbounded".to_string(),
        };
        write!(
            f,
            "{} {} ({}, {} limit {}) resets in {:?}",
            self.method,
            self.route,
            self.major_parameter,
            if self.global { "global" } else { "local" },
            limit,
            self.time_to_reset
        )
    }
}

/// Emitted every `invalid_request_warning_interval` invalid responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRequestWarning {
    /// Invalid responses seen in the current window.
    pub count: u64,
    /// Time left before the window resets.
    pub remaining_time: Duration,
}

/// Emitted for every response the transport returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub method: Method,
    /// The concrete path requested.
    pub path: String,
    pub route: String,
    /// Retries consumed before this response arrived.
    pub retries: u32,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestEvent {
    RateLimited(RateLimitInfo),
    InvalidRequestWarning(InvalidRequestWarning),
    Debug(String),
    Response(ResponseInfo),
}

impl fmt::Display for RestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestEvent::RateLimited(info) => write!(f, "RateLimited({})", info),
            RestEvent::InvalidRequestWarning(w) => {
                write!(f, "InvalidRequestWarning(count={}, resets in {:?})", w.count, w.remaining_time)
            }
            RestEvent::Debug(message) => write!(f, "Debug({})", message),
            RestEvent::Response(r) => {
                write!(f, "Response({} {} -> {}, retries={})", r.method, r.path, r.status, r.retries)
            }
        }
    }
}

/// A sink that consumes [`RestEvent`]s.
pub trait EventSink:
    Service<RestEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: RestEvent)
where
    S: Service<RestEvent, Response = ()> + Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Type-erased sink shared by every bucket handler of a client.
#[derive(Clone)]
pub struct SinkHandle {
    inner: Arc<Mutex<BoxCloneService<RestEvent, (), BoxError>>>,
}

impl SinkHandle {
    pub fn new<S>(sink: S) -> Self
    where
        S: EventSink,
        S::Future: Send + 'static,
    {
        let boxed = BoxCloneService::new(sink.map_err(|e| Box::new(e) as BoxError));
        Self { inner: Arc::new(Mutex::new(boxed)) }
    }

    pub async fn emit(&self, event: RestEvent) {
        // never hold the lock across the sink call
        let sink = match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        emit_best_effort(sink, event).await;
    }
}

impl Default for SinkHandle {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkHandle").finish_non_exhaustive()
    }
}

type ReadyFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<RestEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: RestEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing`: rate limits and invalid-request warnings at WARN, responses
/// and debug lines at DEBUG.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<RestEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RestEvent) -> Self::Future {
        match &event {
            RestEvent::RateLimited(_) | RestEvent::InvalidRequestWarning(_) => {
                tracing::warn!(event = %event, "rest_event")
            }
            RestEvent::Debug(_) | RestEvent::Response(_) => {
                tracing::debug!(event = %event, "rest_event")
            }
        }
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for LogSink {
    type SinkError = Infallible;
}

/// Stores events in memory; oldest events are evicted past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RestEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<RestEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Snapshot of the rate-limit notifications only.
    pub fn rate_limits(&self) -> Vec<RateLimitInfo> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RestEvent::RateLimited(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RestEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RestEvent) -> Self::Future {
        if let Ok(mut guard) = self.events.lock() {
            if guard.len() >= self.capacity {
                guard.remove(0);
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            guard.push(event);
        }
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for MemorySink {
    type SinkError = Infallible;
}

/// Broadcasts events to any number of subscribers.
///
/// Slow receivers miss events once the bounded channel wraps.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: tokio::sync::broadcast::Sender<RestEvent>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RestEvent> {
        self.sender.subscribe()
    }

    /// Events sent while nobody was subscribed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<RestEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RestEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for StreamingSink {
    type SinkError = Infallible;
}

/// Calls a closure for every event.
pub struct FnSink<F> {
    f: Arc<F>,
}

impl<F> FnSink<F>
where
    F: Fn(&RestEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl<F> Clone for FnSink<F> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<F> Service<RestEvent> for FnSink<F>
where
    F: Fn(&RestEvent) + Send + Sync + 'static,
{
    type Response = ();
    type Error = Infallible;
    type Future = ReadyFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RestEvent) -> Self::Future {
        (self.f)(&event);
        Box::pin(async { Ok(()) })
    }
}

impl<F> EventSink for FnSink<F>
where
    F: Fn(&RestEvent) + Send + Sync + 'static,
{
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn rate_limit_event() -> RestEvent {
        RestEvent::RateLimited(RateLimitInfo {
            time_to_reset: Duration::from_millis(1_050),
            limit: Some(300),
            method: Method::Get,
            url: "https://api.modrinth.com/v2/project/abc".into(),
            route: "/project/:id".into(),
            major_parameter: "abc".into(),
            global: false,
        })
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        sink.call(RestEvent::Debug("one".into())).await.unwrap();
        sink.call(RestEvent::Debug("two".into())).await.unwrap();
        sink.call(rate_limit_event()).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events()[0], RestEvent::Debug("two".into()));
        assert_eq!(sink.rate_limits().len(), 1);
    }

    #[tokio::test]
    async fn streaming_sink_delivers_to_subscribers() {
        let sink = StreamingSink::new(8);
        let mut rx = sink.subscribe();

        let mut sending = sink.clone();
        sending.call(rate_limit_event()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), rate_limit_event());
        assert_eq!(sink.dropped_count(), 0);
    }

    #[tokio::test]
    async fn streaming_sink_counts_unobserved_events() {
        let mut sink = StreamingSink::new(8);
        sink.call(RestEvent::Debug("nobody listening".into())).await.unwrap();
        assert_eq!(sink.dropped_count(), 1);
    }

    #[tokio::test]
    async fn handle_forwards_to_boxed_sink() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let handle = SinkHandle::new(FnSink::new(move |_event| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        handle.emit(RestEvent::Debug("a".into())).await;
        handle.clone().emit(RestEvent::Debug("b".into())).await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn display_is_compact() {
        let shown = rate_limit_event().to_string();
        assert!(shown.starts_with("RateLimited(GET /project/:id"));
        assert!(shown.contains("local limit 300"));
    }
}
