//! Relay responses and body decoding.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};

use crate::request::BufferMode;

/// Response body as exposed to the caller, per [`BufferMode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Binary(Bytes),
    Base64(String),
    Raw(Bytes),
    Empty,
}

impl Content {
    /// Shape a response body according to the buffering mode.
    pub fn from_body(mode: BufferMode, body: &Bytes, charset: Option<&str>) -> Self {
        match mode {
            BufferMode::Text => Self::Text(decode_text(body, charset)),
            BufferMode::Binary => Self::Binary(body.clone()),
            BufferMode::Base64 => Self::Base64(STANDARD.encode(body)),
            BufferMode::Raw => Self::Raw(body.clone()),
            BufferMode::Discard => Self::Empty,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Base64(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) | Self::Raw(b) => Some(b),
            _ => None,
        }
    }
}

/// Outcome of one relay call.
///
/// `code` is `None` only for the empty response produced on failure, which
/// guest scripts see as `{headers: {}, content: "", code: ""}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub code: Option<u16>,
    /// Header name to every value received for it, in arrival order.
    pub headers: BTreeMap<String, Vec<String>>,
    pub content: Content,
}

impl RelayResponse {
    pub fn empty() -> Self {
        Self {
            code: None,
            headers: BTreeMap::new(),
            content: Content::Text(String::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_none()
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }
}

/// Extract the `charset=` parameter from a `Content-Type` value.
pub fn charset_of(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
            .filter(|v| !v.is_empty())
    })
}

/// Decode bytes with the named charset, UTF-8 when absent or unknown.
pub fn decode_text(bytes: &[u8], charset: Option<&str>) -> String {
    let encoding = match charset {
        Some(label) => Encoding::for_label(label.as_bytes()).unwrap_or_else(|| {
            tracing::warn!(charset = %label, "unknown charset, decoding as UTF-8");
            UTF_8
        }),
        None => UTF_8,
    };
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

// ─── Tests ──────────────────────────────────────────────────────────────
