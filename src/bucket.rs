//! Per-bucket sequential queue.
//!
//! A [`BucketHandler`] lets exactly one request of its bucket run at a time, in the order the
//! requests arrived. While it holds the turn it:
//!
//! 1. waits (or rejects) while the bucket or the global quota is exhausted,
//! 2. takes a global slot and a local slot,
//! 3. sends the request under the configured timeout,
//! 4. resynchronizes the local quota from the `x-ratelimit-*` headers,
//! 5. classifies the status: success, retry, wait-and-resend, or error.

use crate::api_error::{ApiError, ErrorBody};
use crate::error::{RateLimitError, RestError, Result, TransportError, TransportFailure};
use crate::invalid::InvalidRequestTracker;
use crate::manager::{ManagerState, PreparedRequest};
use crate::retry::{RetryBudget, StatusClass};
use crate::telemetry::{RateLimitInfo, ResponseInfo, RestEvent};
use crate::transport::{RawResponse, SendError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Window opened for the seed quota when a bucket sends its first request.
const LOCAL_SEED_WINDOW_MS: u64 = 1_000;

/// Pause after a 429 that carried no usable `retry-after`.
const DEFAULT_RETRY_AFTER_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy)]
struct LocalQuota {
    /// `None` when the server reported no limit.
    limit: Option<u64>,
    remaining: i64,
    /// Clock millis at which the window resets; `None` until the first response.
    reset_at: Option<u64>,
}

impl LocalQuota {
    fn limited(&self, now: u64) -> bool {
        self.remaining <= 0 && self.reset_at.is_some_and(|reset_at| now < reset_at)
    }
}

/// Point-in-time view of a bucket, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub key: String,
    pub major_parameter: String,
    pub limit: Option<u64>,
    pub remaining: i64,
    /// Clock millis of the next reset, if known.
    pub reset_at: Option<u64>,
    /// Requests waiting for or holding the bucket.
    pub queue_depth: usize,
}

enum DispatchFailure {
    Aborted,
    Timeout,
    Network(String),
}

#[derive(Debug)]
pub(crate) struct BucketHandler {
    id: String,
    major_parameter: String,
    queue: tokio::sync::Mutex<()>,
    queued: AtomicUsize,
    quota: Mutex<LocalQuota>,
    state: Arc<ManagerState>,
}

/// A reserved place in a bucket's queue; keeps the bucket from being swept.
pub(crate) struct Ticket {
    handler: Arc<BucketHandler>,
}

impl Ticket {
    pub(crate) async fn run(self, request: PreparedRequest) -> Result<RawResponse> {
        self.handler.enqueue(request).await
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.handler.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BucketHandler {
    pub(crate) fn new(id: String, major_parameter: String, state: Arc<ManagerState>) -> Self {
        let seed = i64::try_from(state.options.requests_per_second).unwrap_or(i64::MAX);
        Self {
            id,
            major_parameter,
            queue: tokio::sync::Mutex::new(()),
            queued: AtomicUsize::new(0),
            quota: Mutex::new(LocalQuota { limit: None, remaining: seed, reset_at: None }),
            state,
        }
    }

    /// Count a request against the queue before it starts waiting.
    pub(crate) fn reserve(self: &Arc<Self>) -> Ticket {
        self.queued.fetch_add(1, Ordering::SeqCst);
        Ticket { handler: Arc::clone(self) }
    }

    /// Idle: nothing queued and not rate-limited.
    pub(crate) fn is_inactive(&self, now: u64) -> bool {
        self.queued.load(Ordering::SeqCst) == 0 && !self.limited(now)
    }

    pub(crate) fn snapshot(&self) -> BucketSnapshot {
        let quota = *self.quota();
        BucketSnapshot {
            key: self.id.clone(),
            major_parameter: self.major_parameter.clone(),
            limit: quota.limit,
            remaining: quota.remaining,
            reset_at: quota.reset_at,
            queue_depth: self.queued.load(Ordering::SeqCst),
        }
    }

    fn quota(&self) -> MutexGuard<'_, LocalQuota> {
        match self.quota.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn local_limited(&self, now: u64) -> bool {
        self.quota().limited(now)
    }

    fn limited(&self, now: u64) -> bool {
        self.state.global_limited(now) || self.local_limited(now)
    }

    async fn debug(&self, message: String) {
        tracing::debug!(bucket = %self.id, "{}", message);
        self.state.sink.emit(RestEvent::Debug(format!("[REST {}] {}", self.id, message))).await;
    }

    /// Wait for this request's turn, then run it.
    async fn enqueue(&self, request: PreparedRequest) -> Result<RawResponse> {
        let _turn = match &request.signal {
            Some(signal) => tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    let route = &request.route;
                    self.debug(format!("{} {} aborted while queued", route.method, route.original))
                        .await;
                    return Err(RestError::Aborted);
                }
                turn = self.queue.lock() => turn,
            },
            None => self.queue.lock().await,
        };
        self.run_request(&request).await
    }

    async fn run_request(&self, request: &PreparedRequest) -> Result<RawResponse> {
        let mut budget = RetryBudget::new(self.state.options.retries);
        loop {
            self.wait_for_quota(request).await?;

            let now = self.state.clock.now_millis();
            self.state.take_global_slot(now);
            self.take_local_slot(now);

            let response = match self.dispatch(request).await {
                Ok(response) => response,
                Err(DispatchFailure::Aborted) => {
                    self.debug(format!("{} {} aborted in flight", request.route.method, request.url()))
                        .await;
                    return Err(RestError::Aborted);
                }
                Err(DispatchFailure::Timeout) => {
                    if budget.try_consume() {
                        tracing::debug!(
                            bucket = %self.id,
                            url = %request.url(),
                            retry = budget.used(),
                            "request timed out, retrying"
                        );
                        continue;
                    }
                    let failure = TransportFailure::Timeout(self.state.timeout.duration());
                    return Err(self.transport_error(request, failure, &budget).into());
                }
                Err(DispatchFailure::Network(message)) => {
                    return Err(self
                        .transport_error(request, TransportFailure::Network(message), &budget)
                        .into());
                }
            };

            let now = self.state.clock.now_millis();
            self.state
                .sink
                .emit(RestEvent::Response(ResponseInfo {
                    method: request.route.method,
                    path: request.route.original.clone(),
                    route: request.route.bucket_route.clone(),
                    retries: budget.used(),
                    status: response.status,
                }))
                .await;

            let retry_after = self.update_from_headers(&response, now);
            self.track_invalid(response.status, now).await;

            match StatusClass::of(response.status) {
                StatusClass::Success | StatusClass::Other => return Ok(response),
                StatusClass::RateLimited => {
                    // the wait loop paces the resend and applies the reject policy
                    self.on_unexpected_rate_limit(request, retry_after, now).await;
                }
                StatusClass::ServerError => {
                    if budget.try_consume() {
                        tracing::debug!(
                            bucket = %self.id,
                            status = response.status,
                            retry = budget.used(),
                            "server error, retrying"
                        );
                        continue;
                    }
                    return Err(self
                        .transport_error(request, TransportFailure::Status(response.status), &budget)
                        .into());
                }
                StatusClass::ClientError => {
                    if response.status == 401 {
                        self.on_unauthorized(request);
                    }
                    let error = ApiError::new(
                        ErrorBody::parse(&response.body),
                        response.status,
                        request.route.method,
                        request.url(),
                    )
                    .with_request_body(request.request_json.clone(), request.request_files.clone());
                    return Err(error.into());
                }
            }
        }
    }

    /// Block while the bucket or the global quota is exhausted.
    async fn wait_for_quota(&self, request: &PreparedRequest) -> Result<()> {
        loop {
            let now = self.state.clock.now_millis();
            let global = self.state.global_limited(now);
            if !global && !self.local_limited(now) {
                return Ok(());
            }

            let offset = self.state.options.offset_millis();
            let (limit, reset_at) = if global {
                (Some(self.state.options.global_requests_per_second), self.state.global_reset_at())
            } else {
                let quota = *self.quota();
                (quota.limit, quota.reset_at)
            };
            let wait = reset_at.unwrap_or(now).saturating_add(offset).saturating_sub(now);
            let info = self.rate_limit_info(request, limit, Duration::from_millis(wait), global);

            self.state.sink.emit(RestEvent::RateLimited(info.clone())).await;
            if self.state.options.reject_on_rate_limit.should_reject(&info).await {
                tracing::debug!(
                    bucket = %self.id,
                    route = %info.route,
                    global,
                    "rejecting rate-limited request"
                );
                return Err(RateLimitError::new(info).into());
            }

            if global {
                self.debug(format!("Global rate limit hit, blocking all requests for {}ms", wait))
                    .await;
                ManagerState::global_delay(&self.state, Duration::from_millis(wait)).await;
            } else {
                self.debug(format!("Waiting {}ms for rate limit to pass", wait)).await;
                self.state.sleeper.sleep(Duration::from_millis(wait)).await;
            }
        }
    }

    async fn dispatch(
        &self,
        request: &PreparedRequest,
    ) -> std::result::Result<RawResponse, DispatchFailure> {
        let call = self.state.timeout.run(self.state.transport.send(request.transport.clone()));
        let result = match &request.signal {
            Some(signal) => tokio::select! {
                biased;
                _ = signal.cancelled() => return Err(DispatchFailure::Aborted),
                result = call => result,
            },
            None => call.await,
        };

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(SendError::Timeout)) | Err(_) => Err(DispatchFailure::Timeout),
            Ok(Err(SendError::Network(message))) => Err(DispatchFailure::Network(message)),
        }
    }

    /// Spend one local slot. Before the first response the seed quota gets a one-second window.
    fn take_local_slot(&self, now: u64) {
        let mut quota = self.quota();
        if quota.reset_at.is_none() {
            quota.reset_at = Some(now.saturating_add(LOCAL_SEED_WINDOW_MS));
        }
        quota.remaining -= 1;
    }

    /// Drop the token this request was sent with, unless the caller has replaced it since.
    fn on_unauthorized(&self, request: &PreparedRequest) {
        let Some(sent) = request.sent_token.as_deref() else {
            return;
        };
        if self.state.clear_token_if(sent) {
            tracing::warn!(
                bucket = %self.id,
                url = %request.url(),
                "401 on authenticated request, clearing token"
            );
        } else {
            tracing::debug!(bucket = %self.id, "401 for a token that was already replaced");
        }
    }

    /// Resynchronize the local quota; returns `retry-after` in millis when present.
    fn update_from_headers(&self, response: &RawResponse, now: u64) -> Option<u64> {
        let limit =
            response.header("x-ratelimit-limit").and_then(|v| v.trim().parse::<u64>().ok());
        let remaining =
            response.header("x-ratelimit-remaining").and_then(|v| v.trim().parse::<i64>().ok());
        let reset = response.header("x-ratelimit-reset").and_then(|v| seconds_to_millis(&v));
        let retry_after = response.header("retry-after").and_then(|v| seconds_to_millis(&v));

        let mut quota = self.quota();
        quota.limit = limit;
        quota.remaining = remaining.unwrap_or(1);
        quota.reset_at = Some(now.saturating_add(reset.unwrap_or(0)));
        retry_after
    }

    async fn track_invalid(&self, status: u16, now: u64) {
        if !InvalidRequestTracker::is_invalid_status(status) {
            return;
        }
        let interval = self.state.options.invalid_request_warning_interval;
        if let Some(warning) = self.state.invalid.record(now, interval) {
            tracing::warn!(
                count = warning.count,
                remaining = ?warning.remaining_time,
                "invalid requests"
            );
            self.state.sink.emit(RestEvent::InvalidRequestWarning(warning)).await;
        }
    }

    /// A 429 means local bookkeeping was stale: mark the bucket exhausted so the wait loop
    /// paces the resend.
    async fn on_unexpected_rate_limit(
        &self,
        request: &PreparedRequest,
        retry_after: Option<u64>,
        now: u64,
    ) {
        let global = self.state.global_limited(now);
        let limit = if global {
            Some(self.state.options.global_requests_per_second)
        } else {
            let mut quota = self.quota();
            if !quota.limited(now) {
                let pause = retry_after.filter(|ms| *ms > 0).unwrap_or(DEFAULT_RETRY_AFTER_MS);
                quota.remaining = 0;
                quota.reset_at = Some(now.saturating_add(pause));
            }
            quota.limit
        };

        let limit = limit.map_or_else(|| "unbounded".to_string(), |limit| limit.to_string());
        let retry_after = retry_after.map_or_else(|| "none".to_string(), |ms| format!("{}ms", ms));
        self.debug(
            [
                "Encountered unexpected 429 rate limit".to_string(),
                format!("  Global         : {}", global),
                format!("  Method         : {}", request.route.method),
                format!("  URL            : {}", request.url()),
                format!("  Bucket         : {}", request.route.bucket_route),
                format!("  Major parameter: {}", request.route.major_parameter),
                format!("  Limit          : {}", limit),
                format!("  Retry after    : {}", retry_after),
            ]
            .join("\n"),
        )
        .await;
    }

    fn rate_limit_info(
        &self,
        request: &PreparedRequest,
        limit: Option<u64>,
        time_to_reset: Duration,
        global: bool,
    ) -> RateLimitInfo {
        RateLimitInfo {
            time_to_reset,
            limit,
            method: request.route.method,
            url: request.url().to_string(),
            route: request.route.bucket_route.clone(),
            major_parameter: self.major_parameter.clone(),
            global,
        }
    }

    fn transport_error(
        &self,
        request: &PreparedRequest,
        failure: TransportFailure,
        budget: &RetryBudget,
    ) -> TransportError {
        TransportError {
            method: request.route.method,
            url: request.url().to_string(),
            failure,
            retries: budget.used(),
        }
    }
}

fn seconds_to_millis(value: &str) -> Option<u64> {
    let seconds = value.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((seconds * 1_000.0).ceil() as u64)
}
