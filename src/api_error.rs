//! Structured API errors returned for 4xx responses.
//!
//! The service reports validation problems as a tree of nested objects. The tree is parsed into
//! [`ErrorNode`] once, then flattened into `path: message` lines for display:
//!
//! ```rust
//! use labrinth_rest::api_error::ErrorBody;
//!
//! let body = br#"{"code":400,"errors":{"fields":{"title":{"code":"required","message":"Title is required"}}}}"#;
//! let parsed = ErrorBody::parse(body);
//! assert_eq!(parsed.message(), "fields.title[required]: Title is required");
//! ```

use crate::request::Method;
use serde_json::{Map, Value};
use std::fmt;

/// Error code reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorCode {
    Number(i64),
    Text(String),
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiErrorCode::Number(n) => write!(f, "{}", n),
            ApiErrorCode::Text(s) => f.write_str(s),
        }
    }
}

/// One node of a nested validation error tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorNode {
    /// `{ "code": ..., "message": ... }`
    Field { code: String, message: String },
    /// `{ "_errors": [...] }` or a bare list; children share the parent path.
    Group(Vec<ErrorNode>),
    /// A bare string.
    Message(String),
    /// Any other object; keys extend the path.
    Map(Vec<(String, ErrorNode)>),
}

impl ErrorNode {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => ErrorNode::Message(s.clone()),
            Value::Array(items) => ErrorNode::Group(items.iter().map(Self::from_value).collect()),
            Value::Object(obj) => Self::from_object(obj),
            other => ErrorNode::Message(other.to_string()),
        }
    }

    fn from_object(obj: &Map<String, Value>) -> Self {
        if let Some(Value::String(message)) = obj.get("message") {
            let code = match obj.get("code") {
                Some(Value::String(code)) => code.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            return ErrorNode::Field { code, message: message.clone() };
        }
        if let Some(Value::Array(items)) = obj.get("_errors") {
            return ErrorNode::Group(items.iter().map(Self::from_value).collect());
        }
        ErrorNode::Map(obj.iter().map(|(k, v)| (k.clone(), Self::from_value(v))).collect())
    }

    /// Flatten the tree into display lines, in document order.
    pub fn flatten(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into(&self, key: &str, out: &mut Vec<String>) {
        match self {
            ErrorNode::Field { code, message } => {
                let line = match (key.is_empty(), code.is_empty()) {
                    (true, true) => message.clone(),
                    (true, false) => format!("{}: {}", code, message),
                    (false, true) => format!("{}: {}", key, message),
                    (false, false) => format!("{}[{}]: {}", key, code, message),
                };
                out.push(line.trim().to_string());
            }
            ErrorNode::Message(message) => {
                if key.is_empty() {
                    out.push(message.clone());
                } else {
                    out.push(format!("{}: {}", key, message));
                }
            }
            ErrorNode::Group(children) => {
                for child in children {
                    child.flatten_into(key, out);
                }
            }
            ErrorNode::Map(entries) => {
                for (name, child) in entries {
                    child.flatten_into(&child_key(key, name), out);
                }
            }
        }
    }
}

fn child_key(parent: &str, name: &str) -> String {
    if name.starts_with('_') {
        parent.to_string()
    } else if parent.is_empty() {
        name.to_string()
    } else if name.parse::<u64>().is_ok() {
        format!("{}[{}]", parent, name)
    } else {
        format!("{}.{}", parent, name)
    }
}

/// Parsed body of an error response.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorBody {
    /// `{ "code", "message"?, "errors"? }`
    Structured { code: ApiErrorCode, message: Option<String>, errors: Option<ErrorNode> },
    /// `{ "error", "error_description" | "description" }`
    Described { error: String, description: Option<String> },
    /// Any other payload.
    Other(Value),
    /// No body, or one that is not JSON.
    Empty,
}

impl ErrorBody {
    pub fn parse(body: &[u8]) -> Self {
        if body.iter().all(u8::is_ascii_whitespace) {
            return ErrorBody::Empty;
        }
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => Self::from_value(value),
            Err(e) => {
                tracing::debug!(error = %e, "error body is not JSON");
                ErrorBody::Empty
            }
        }
    }

    pub fn from_value(value: Value) -> Self {
        let Value::Object(obj) = value else {
            return ErrorBody::Other(value);
        };

        let code = match obj.get("code") {
            Some(Value::Number(n)) => n.as_i64().map(ApiErrorCode::Number),
            Some(Value::String(s)) => Some(ApiErrorCode::Text(s.clone())),
            _ => None,
        };
        if let Some(code) = code {
            return ErrorBody::Structured {
                code,
                message: obj.get("message").and_then(Value::as_str).map(str::to_string),
                errors: obj.get("errors").map(ErrorNode::from_value),
            };
        }

        if let Some(Value::String(error)) = obj.get("error") {
            let description = obj
                .get("error_description")
                .or_else(|| obj.get("description"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return ErrorBody::Described { error: error.clone(), description };
        }

        ErrorBody::Other(Value::Object(obj))
    }

    /// The server-reported code, if the body carried one.
    pub fn code(&self) -> Option<ApiErrorCode> {
        match self {
            ErrorBody::Structured { code, .. } => Some(code.clone()),
            ErrorBody::Described { error, .. } => Some(ApiErrorCode::Text(error.clone())),
            _ => None,
        }
    }

    /// Flattened field errors, empty when the body has none.
    pub fn flattened(&self) -> Vec<String> {
        match self {
            ErrorBody::Structured { errors: Some(errors), .. } => errors.flatten(),
            _ => Vec::new(),
        }
    }

    /// Human-readable message: the top-level message followed by one line per field error.
    pub fn message(&self) -> String {
        match self {
            ErrorBody::Structured { message, .. } => {
                let flattened = self.flattened().join("\n");
                match message.as_deref().filter(|m| !m.is_empty()) {
                    Some(m) if !flattened.is_empty() => format!("{}\n{}", m, flattened),
                    Some(m) => m.to_string(),
                    None if !flattened.is_empty() => flattened,
                    None => "Unknown Error".to_string(),
                }
            }
            ErrorBody::Described { description, .. } => {
                description.clone().unwrap_or_else(|| "No Description".to_string())
            }
            ErrorBody::Other(_) | ErrorBody::Empty => "Unknown Error".to_string(),
        }
    }
}

/// A 4xx response turned into an error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{} {} {} {}: {}", self.name(), status, method, url, message)]
pub struct ApiError {
    pub raw_error: ErrorBody,
    /// Server code, or the HTTP status when the body had none.
    pub code: ApiErrorCode,
    pub status: u16,
    pub method: Method,
    pub url: String,
    pub message: String,
    /// JSON body of the failed request, if any.
    pub request_json: Option<Value>,
    /// Names of files attached to the failed request.
    pub request_files: Vec<String>,
}

impl ApiError {
    pub fn new(raw_error: ErrorBody, status: u16, method: Method, url: impl Into<String>) -> Self {
        let code = raw_error.code().unwrap_or(ApiErrorCode::Number(i64::from(status)));
        let message = raw_error.message();
        Self {
            raw_error,
            code,
            status,
            method,
            url: url.into(),
            message,
            request_json: None,
            request_files: Vec::new(),
        }
    }

    pub fn with_request_body(mut self, json: Option<Value>, files: Vec<String>) -> Self {
        self.request_json = json;
        self.request_files = files;
        self
    }

    /// Error name including the code, e.g. `ApiError[invalid_input]`.
    pub fn name(&self) -> String {
        format!("ApiError[{}]", self.code)
    }

    /// Field errors as `path: message` lines.
    pub fn field_errors(&self) -> Vec<String> {
        self.raw_error.flattened()
    }
}
