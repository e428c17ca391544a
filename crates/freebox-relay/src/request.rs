//! Request options and body encoding.
//!
//! [`RelayRequest`] mirrors the option object guest scripts hand to
//! `http(url, options)`: `{method, postType, body, data, headers, redirect,
//! timeout, buffer}`. Every field is optional.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use reqwest::Method;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::RelayError;

// ─── Buffering ──────────────────────────────────────────────────────────

/// How response bytes are exposed to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// `0`: decode as text with the resolved charset.
    Text,
    /// `1`: opaque binary value.
    Binary,
    /// `2`: base64 text.
    Base64,
    /// `3`: raw bytes.
    Raw,
    /// Any other code: the body is dropped.
    Discard,
}

impl From<i64> for BufferMode {
    fn from(code: i64) -> Self {
        match code {
            0 => Self::Text,
            1 => Self::Binary,
            2 => Self::Base64,
            3 => Self::Raw,
            _ => Self::Discard,
        }
    }
}

// ─── Body encoding ──────────────────────────────────────────────────────

/// Encoding applied to the structured `data` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostType {
    Json,
    Form,
    Multipart,
    Other(String),
}

impl PostType {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => Self::Json,
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            Some(v) if v.eq_ignore_ascii_case("form") => Self::Form,
            Some(v) if v.eq_ignore_ascii_case("form-data") || v.eq_ignore_ascii_case("multipart") => {
                Self::Multipart
            }
            Some(v) => Self::Other(v.to_string()),
        }
    }
}

/// Encoded request body, ready to attach to a request builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    Json(Vec<u8>),
    Form(Vec<(String, String)>),
    Multipart { boundary: String, bytes: Vec<u8> },
    Raw { content_type: String, bytes: Vec<u8> },
}

impl RequestBody {
    /// `Content-Type` the body must be sent with, if it dictates one.
    pub fn content_type(&self) -> Option<String> {
        match self {
            Self::Empty | Self::Raw { .. } => None,
            Self::Json(_) => Some("application/json; charset=utf-8".to_string()),
            Self::Form(_) => Some("application/x-www-form-urlencoded".to_string()),
            Self::Multipart { boundary, .. } => {
                Some(format!("multipart/form-data; boundary={boundary}"))
            }
        }
    }
}

// ─── Request ────────────────────────────────────────────────────────────

/// Options for one relay call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub post_type: Option<String>,
    /// Raw body, sent with the caller's declared `Content-Type`.
    #[serde(default)]
    pub body: Option<String>,
    /// Structured payload, encoded per `post_type`.
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, deserialize_with = "string_map")]
    pub headers: HashMap<String, String>,
    /// Follow redirects unless this is `0`, negative or `false`.
    #[serde(default)]
    pub redirect: Option<Value>,
    /// Timeout in milliseconds.
    #[serde(default, deserialize_with = "lenient_number")]
    pub timeout: Option<u64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub buffer: Option<i64>,
}

/// Header values may arrive as numbers or booleans from guest code.
fn string_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<HashMap<String, Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| match v {
            Value::Null => None,
            Value::String(s) => Some((k, s)),
            other => Some((k, other.to_string())),
        })
        .collect())
}

/// Numbers may arrive as numeric strings; anything unparseable is unset.
fn lenient_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    let text = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) => v.to_string(),
            None => (n.as_f64().unwrap_or_default().trunc() as i64).to_string(),
        },
        Some(Value::String(s)) => s.trim().to_string(),
        _ => return Ok(None),
    };
    Ok(text.parse().ok())
}

/// Render a JSON scalar the way a form field expects it.
fn form_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Random multipart boundary in the `--dio-boundary-<n><m>` shape.
fn multipart_boundary() -> String {
    let mut rng = rand::rng();
    format!(
        "--dio-boundary-{}{}",
        rng.random_range(0..42_949),
        rng.random_range(0..67_296)
    )
}

impl RelayRequest {
    /// Parse the JSON text of a guest option object. Blank text and `{}`
    /// both yield the defaults.
    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Shorthand for a GET with the given buffering mode.
    pub fn with_buffer(buffer: i64) -> Self {
        Self {
            buffer: Some(buffer),
            ..Self::default()
        }
    }

    pub fn method(&self) -> Result<Method, RelayError> {
        match self.method.as_deref().map(str::trim) {
            None | Some("") => Ok(Method::GET),
            // Some script plugins spell HEAD as "header".
            Some(m) if m.eq_ignore_ascii_case("header") => Ok(Method::HEAD),
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| RelayError::InvalidMethod(m.to_string())),
        }
    }

    pub fn buffer_mode(&self) -> BufferMode {
        BufferMode::from(self.buffer.unwrap_or(0))
    }

    pub fn post_type(&self) -> PostType {
        PostType::parse(self.post_type.as_deref())
    }

    pub fn follows_redirects(&self) -> bool {
        match &self.redirect {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|n| n > 0.0).unwrap_or(true),
            Some(Value::String(s)) => s.trim().parse::<i64>().map(|n| n > 0).unwrap_or(true),
            Some(_) => true,
        }
    }

    /// Per-call timeout, falling back to the client default.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Case-insensitive request header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Select the body encoding.
    ///
    /// A structured payload is encoded as JSON, form or multipart per the
    /// post type. Otherwise a raw body is sent when both the body and a
    /// declared `Content-Type` exist. Anything else sends no body.
    pub fn encode_body(&self) -> Result<RequestBody, RelayError> {
        if let Some(data) = self.data.as_ref().filter(|d| !d.is_null()) {
            match self.post_type() {
                PostType::Json => return Ok(RequestBody::Json(serde_json::to_vec(data)?)),
                PostType::Form => return Ok(RequestBody::Form(fields(data))),
                PostType::Multipart => {
                    let boundary = multipart_boundary();
                    let bytes = multipart_bytes(&boundary, &fields(data));
                    return Ok(RequestBody::Multipart { boundary, bytes });
                }
                PostType::Other(kind) => {
                    tracing::debug!(post_type = %kind, "unknown post type, falling back to raw body");
                }
            }
        }

        match (&self.body, self.header("Content-Type")) {
            (Some(body), Some(content_type)) => Ok(RequestBody::Raw {
                content_type: content_type.to_string(),
                bytes: body.as_bytes().to_vec(),
            }),
            _ => Ok(RequestBody::Empty),
        }
    }
}

/// Flatten a structured payload into name/value pairs.
fn fields(data: &Value) -> Vec<(String, String)> {
    match data {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), form_value(v))).collect(),
        _ => Vec::new(),
    }
}

fn multipart_bytes(boundary: &str, fields: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in fields {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    out
}

// ─── Tests ──────────────────────────────────────────────────────────────
