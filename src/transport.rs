//! The HTTP seam.
//!
//! Bucket handlers talk to a [`Transport`] rather than to `reqwest` directly. The production
//! implementation is [`ReqwestTransport`]; [`ScriptedTransport`] replays canned replies for tests
//! and offline use.

use crate::config::ConfigError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// A fully resolved call: absolute URL, final headers, encoded body.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Status, headers, and body of an HTTP response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: u16) -> Self {
        Self { status, headers: HeaderMap::new(), body: Bytes::new() }
    }

    /// Adds a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
        {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(mut self, value: serde_json::Value) -> Self {
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Bytes::from(value.to_string());
        self
    }

    /// Sets the three `x-ratelimit-*` headers.
    pub fn with_rate_limit(self, limit: u64, remaining: u64, reset_secs: f64) -> Self {
        self.with_header("x-ratelimit-limit", &limit.to_string())
            .with_header("x-ratelimit-remaining", &remaining.to_string())
            .with_header("x-ratelimit-reset", &reset_secs.to_string())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        crate::codec::header_str(&self.headers, name)
    }
}

/// Failure before any status code arrived.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("transport timed out")]
    Timeout,
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, request: TransportRequest) -> Result<RawResponse, SendError>;
}

/// Transport backed by a shared `reqwest::Client`.
///
/// The client carries no timeout of its own; the bucket handler applies the configured limit to
/// every call.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ConfigError> {
        let client =
            reqwest::Client::builder().build().map_err(|e| ConfigError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<RawResponse, SendError> {
        tracing::trace!(method = %request.method, url = %request.url, "sending request");
        let mut builder =
            self.client.request(request.method, request.url.as_str()).headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;
        Ok(RawResponse { status, headers, body })
    }
}

fn classify(error: reqwest::Error) -> SendError {
    if error.is_timeout() {
        SendError::Timeout
    } else {
        SendError::Network(error.to_string())
    }
}

/// One canned reply of a [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Response(RawResponse),
    Error(SendError),
    /// Wait, then produce the inner reply.
    Delayed(Duration, Box<ScriptedReply>),
    /// Never completes.
    Hang,
}

impl From<RawResponse> for ScriptedReply {
    fn from(response: RawResponse) -> Self {
        ScriptedReply::Response(response)
    }
}

/// A call observed by a [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub request: TransportRequest,
    /// When the call was made, on the tokio clock.
    pub at: Instant,
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<ScriptedReply>,
    fallback: Option<ScriptedReply>,
    calls: Vec<RecordedCall>,
}

/// Replays queued replies in order, then the fallback (a 200 with no body unless set).
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: impl Into<ScriptedReply>) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.replies.push_back(reply.into());
        }
        self
    }

    /// Reply used once the queue is empty.
    pub fn set_fallback(&self, reply: impl Into<ScriptedReply>) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.fallback = Some(reply.into());
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script.lock().map(|script| script.calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.script.lock().map(|script| script.calls.len()).unwrap_or(0)
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|script| script.replies.len()).unwrap_or(0)
    }

    fn next_reply(&self, request: TransportRequest) -> ScriptedReply {
        let Ok(mut script) = self.script.lock() else {
            return ScriptedReply::Error(SendError::Network("script poisoned".into()));
        };
        script.calls.push(RecordedCall { request, at: Instant::now() });
        match script.replies.pop_front() {
            Some(reply) => reply,
            None => script
                .fallback
                .clone()
                .unwrap_or_else(|| ScriptedReply::Response(RawResponse::new(200))),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<RawResponse, SendError> {
        let mut reply = self.next_reply(request);
        loop {
            match reply {
                ScriptedReply::Response(response) => return Ok(response),
                ScriptedReply::Error(error) => return Err(error),
                ScriptedReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                ScriptedReply::Hang => return std::future::pending().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(path: &str) -> TransportRequest {
        TransportRequest {
            method: reqwest::Method::GET,
            url: format!("https://api.modrinth.com/v2{}", path),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_falls_back() {
        let transport = ScriptedTransport::new();
        transport.push(RawResponse::new(503)).push(RawResponse::new(200).with_json(json!([])));

        assert_eq!(transport.send(request("/a")).await.unwrap().status, 503);
        assert_eq!(transport.send(request("/b")).await.unwrap().status, 200);
        assert_eq!(transport.send(request("/c")).await.unwrap().status, 200);

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].request.url.ends_with("/b"));
        assert_eq!(transport.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_and_error_replies() {
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::Delayed(
            Duration::from_secs(2),
            Box::new(ScriptedReply::Error(SendError::Network("reset".into()))),
        ));

        let start = Instant::now();
        let err = transport.send(request("/x")).await.unwrap_err();
        assert_eq!(err, SendError::Network("reset".into()));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn response_helpers_set_headers() {
        let response = RawResponse::new(200).with_rate_limit(300, 0, 1.5);
        assert_eq!(response.header("x-ratelimit-limit").as_deref(), Some("300"));
        assert_eq!(response.header("x-ratelimit-remaining").as_deref(), Some("0"));
        assert_eq!(response.header("x-ratelimit-reset").as_deref(), Some("1.5"));
    }

    #[test]
    fn reqwest_transport_builds() {
        assert!(ReqwestTransport::new().is_ok());
    }
}
