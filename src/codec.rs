//! Request body encoding and response body decoding.

use crate::request::{RawFile, RequestBody};
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde_json::Value;

/// A body ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBody {
    pub data: Bytes,
    pub content_type: Option<String>,
}

/// Encode the request body.
///
/// With files attached the body becomes `multipart/form-data`: each file under `files[<index>]`
/// (or its own key) and a JSON body, if any, under `payload_json`. Without files a JSON body is
/// serialized as `application/json` and a raw body is passed through.
pub fn resolve_body(
    body: Option<&RequestBody>,
    files: &[RawFile],
) -> Result<Option<PreparedBody>, serde_json::Error> {
    if !files.is_empty() {
        return encode_multipart(body, files).map(Some);
    }

    match body {
        None => Ok(None),
        Some(RequestBody::Json(value)) => Ok(Some(PreparedBody {
            data: Bytes::from(serde_json::to_vec(value)?),
            content_type: Some("application/json".to_string()),
        })),
        Some(RequestBody::Raw { data, content_type }) => {
            Ok(Some(PreparedBody { data: data.clone(), content_type: content_type.clone() }))
        }
    }
}

fn encode_multipart(
    body: Option<&RequestBody>,
    files: &[RawFile],
) -> Result<PreparedBody, serde_json::Error> {
    let boundary = format!("----labrinth-rest-{:016x}", rand::random::<u64>());
    let mut out = BytesMut::new();

    for (index, file) in files.iter().enumerate() {
        let key = file.key.clone().unwrap_or_else(|| format!("files[{}]", index));
        let content_type =
            file.content_type.clone().unwrap_or_else(|| guess_content_type(&file.name).to_string());
        out.put_slice(format!("--{}\r\n", boundary).as_bytes());
        out.put_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                escape_disposition(&key),
                escape_disposition(&file.name)
            )
            .as_bytes(),
        );
        out.put_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        out.put_slice(&file.data);
        out.put_slice(b"\r\n");
    }

    let payload = match body {
        Some(RequestBody::Json(value)) => Some(Bytes::from(serde_json::to_vec(value)?)),
        Some(RequestBody::Raw { data, .. }) => Some(data.clone()),
        None => None,
    };
    if let Some(payload) = payload {
        out.put_slice(format!("--{}\r\n", boundary).as_bytes());
        out.put_slice(b"Content-Disposition: form-data; name=\"payload_json\"\r\n");
        out.put_slice(b"Content-Type: application/json\r\n\r\n");
        out.put_slice(&payload);
        out.put_slice(b"\r\n");
    }

    out.put_slice(format!("--{}--\r\n", boundary).as_bytes());

    Ok(PreparedBody {
        data: out.freeze(),
        content_type: Some(format!("multipart/form-data; boundary={}", boundary)),
    })
}

/// Percent-encode the characters that would end a quoted parameter or the header line.
fn escape_disposition(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("%22"),
            '\r' => out.push_str("%0D"),
            '\n' => out.push_str("%0A"),
            c => out.push(c),
        }
    }
    out
}

/// Content type for an attached file, from its extension.
pub fn guess_content_type(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        Some("jar") => "application/java-archive",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Decoded body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Binary(Bytes),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ResponseBody::Binary(bytes) => Some(bytes),
            ResponseBody::Json(_) => None,
        }
    }
}

/// JSON when the response says so, raw bytes otherwise.
pub fn parse_response(headers: &HeaderMap, body: Bytes) -> ResponseBody {
    let is_json = header_str(headers, CONTENT_TYPE.as_str())
        .is_some_and(|ct| ct.trim_start().starts_with("application/json"));
    if !is_json {
        return ResponseBody::Binary(body);
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return ResponseBody::Json(Value::Null);
    }
    match serde_json::from_slice(&body) {
        Ok(value) => ResponseBody::Json(value),
        Err(e) => {
            tracing::warn!(error = %e, "response declared JSON but failed to parse");
            ResponseBody::Binary(body)
        }
    }
}

/// Header value as a string; repeated headers are joined with `;`.
pub fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    let values: Vec<&str> =
        headers.get_all(name).iter().filter_map(|value| value.to_str().ok()).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(";"))
    }
}
