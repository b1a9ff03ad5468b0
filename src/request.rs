//! Logical requests as built by callers before the manager resolves them.

use bytes::Bytes;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// HTTP methods the API accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Body attached to a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Serialized to UTF-8 JSON and sent as `application/json`.
    Json(serde_json::Value),
    /// Sent verbatim.
    Raw { data: Bytes, content_type: Option<String> },
}

/// A file attached to a multipart request.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFile {
    pub name: String,
    pub data: Bytes,
    /// Guessed from the file extension when absent.
    pub content_type: Option<String>,
    /// Form field name; `files[<index>]` when absent.
    pub key: Option<String>,
}

impl RawFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self { name: name.into(), data: data.into(), content_type: None, key: None }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Per-call options: auth flag, body, files, headers, query, cancellation, versioning.
///
/// Requests are authenticated and versioned unless told otherwise.
#[derive(Debug, Clone)]
pub struct RequestData {
    pub(crate) auth: bool,
    pub(crate) body: Option<RequestBody>,
    pub(crate) files: Vec<RawFile>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) signal: Option<CancellationToken>,
    pub(crate) versioned: bool,
}

impl Default for RequestData {
    fn default() -> Self {
        Self {
            auth: true,
            body: None,
            files: Vec::new(),
            headers: Vec::new(),
            query: Vec::new(),
            signal: None,
            versioned: true,
        }
    }
}

impl RequestData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `Authorization` header is required.
    pub fn auth(mut self, required: bool) -> Self {
        self.auth = required;
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(value));
        self
    }

    /// Send `data` as-is. Ignored when files are attached.
    pub fn raw(mut self, data: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        self.body =
            Some(RequestBody::Raw { data: data.into(), content_type: content_type.map(Into::into) });
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn file(mut self, file: RawFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn queries<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query.extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Abort the request while it waits in its bucket queue or while the transport call is
    /// outstanding.
    pub fn signal(mut self, token: CancellationToken) -> Self {
        self.signal = Some(token);
        self
    }

    /// Whether to prefix the path with `/v{version}`.
    pub fn versioned(mut self, versioned: bool) -> Self {
        self.versioned = versioned;
        self
    }

    pub fn requires_auth(&self) -> bool {
        self.auth
    }

    pub fn is_versioned(&self) -> bool {
        self.versioned
    }

    pub fn files(&self) -> &[RawFile] {
        &self.files
    }

    pub fn request_body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }
}

/// A complete logical request: method, route, and per-call data.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Path relative to the (versioned) base URL, starting with `/`.
    pub route: String,
    pub data: RequestData,
}

impl Request {
    pub fn new(method: Method, route: impl Into<String>, data: RequestData) -> Self {
        Self { method, route: route.into(), data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_require_auth_and_versioning() {
        let data = RequestData::default();
        assert!(data.requires_auth());
        assert!(data.is_versioned());
        assert!(data.request_body().is_none());
    }

    #[test]
    fn builder_accumulates_query_and_headers() {
        let data = RequestData::new()
            .auth(false)
            .query("query", "sodium")
            .queries([("limit", "5"), ("offset", "10")])
            .header("X-Trace", "abc")
            .json(json!({ "title": "x" }));

        assert!(!data.auth);
        assert_eq!(data.query.len(), 3);
        assert_eq!(data.query[2], ("offset".to_string(), "10".to_string()));
        assert_eq!(data.headers, vec![("X-Trace".to_string(), "abc".to_string())]);
        assert_eq!(data.request_body(), Some(&RequestBody::Json(json!({ "title": "x" }))));
    }

    #[test]
    fn method_strings() {
        assert_eq!(Method::Patch.to_string(), "PATCH");
        assert_eq!(reqwest::Method::from(Method::Delete), reqwest::Method::DELETE);
    }
}
