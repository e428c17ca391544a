//! The capability contract every plugin implements.
//!
//! Plugins come in three closed variants, [`SpiderInstance::Native`],
//! [`SpiderInstance::Script`] and [`SpiderInstance::Empty`], each with a
//! direct implementation of [`Spider`]. Capability calls never fail: a
//! broken plugin degrades to empty strings, `false` and
//! [`ProxyResponse::Empty`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;

use crate::error::SpiderError;
use crate::native::NativeSpider;
use crate::script::ScriptSpider;

/// Content type assumed when a proxy reply does not state one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// ─── Proxy result ───────────────────────────────────────────────────────

/// A populated `[status, contentType, stream, headers?]` tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyReply {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
    pub headers: Option<BTreeMap<String, String>>,
}

/// Normalized result of a proxy call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProxyResponse {
    #[default]
    Empty,
    Reply(ProxyReply),
}

impl ProxyResponse {
    pub fn reply(status: u16, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::Reply(ProxyReply {
            status,
            content_type: content_type.into(),
            body: body.into(),
            headers: None,
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Number of tuple elements: 0, 3, or 4 when headers are present.
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Reply(reply) if reply.headers.is_some() => 4,
            Self::Reply(_) => 3,
        }
    }

    pub fn as_reply(&self) -> Option<&ProxyReply> {
        match self {
            Self::Reply(reply) => Some(reply),
            Self::Empty => None,
        }
    }

    /// Parse the JSON tuple a native plugin returns from its proxy entry
    /// point: `[status, contentType, base64Body, headers?]`.
    pub fn from_native_json(text: &str) -> Result<Self, SpiderError> {
        let items: Vec<serde_json::Value> = serde_json::from_str(text)?;
        if items.len() < 3 {
            return Ok(Self::Empty);
        }
        let status = items[0]
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| SpiderError::InvocationFailure(format!("bad proxy status: {}", items[0])))?;
        let content_type = items[1]
            .as_str()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let body = decode_stream_text(items[2].as_str().unwrap_or_default(), true)?;
        let headers = items.get(3).and_then(header_map);
        Ok(Self::Reply(ProxyReply {
            status,
            content_type,
            body,
            headers,
        }))
    }
}

/// Body text from a plugin, optionally base64 (after a `base64,` marker
/// if one is present).
pub fn decode_stream_text(text: &str, base64: bool) -> Result<Bytes, SpiderError> {
    if !base64 {
        return Ok(Bytes::copy_from_slice(text.as_bytes()));
    }
    let payload = match text.split_once("base64,") {
        Some((_, rest)) => rest,
        None => text,
    };
    STANDARD
        .decode(payload.trim())
        .map(Bytes::from)
        .map_err(|e| SpiderError::InvocationFailure(format!("bad base64 proxy body: {e}")))
}

/// Flatten a JSON object into string headers.
pub fn header_map(value: &serde_json::Value) -> Option<BTreeMap<String, String>> {
    let object = value.as_object()?;
    Some(
        object
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect(),
    )
}

// ─── Contract ───────────────────────────────────────────────────────────

#[async_trait]
pub trait Spider: Send + Sync {
    /// Called once after the instance is created. The only fallible call.
    async fn init(&self, extend: &str) -> Result<(), SpiderError>;

    async fn home_content(&self, filter: bool) -> String;

    async fn home_video_content(&self) -> String;

    async fn category_content(
        &self,
        tid: &str,
        page: &str,
        filter: bool,
        extend: &HashMap<String, String>,
    ) -> String;

    async fn detail_content(&self, ids: &[String]) -> String;

    async fn search_content(&self, key: &str, quick: bool, page: Option<&str>) -> String;

    async fn player_content(&self, flag: &str, id: &str, vip_flags: &[String]) -> String;

    async fn manual_video_check(&self) -> bool;

    async fn is_video_format(&self, url: &str) -> bool;

    async fn proxy(&self, params: &HashMap<String, String>) -> ProxyResponse;

    async fn destroy(&self);
}

/// The inert plugin handed out when resolution fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySpider;

#[async_trait]
impl Spider for EmptySpider {
    async fn init(&self, _extend: &str) -> Result<(), SpiderError> {
        Ok(())
    }

    async fn home_content(&self, _filter: bool) -> String {
        String::new()
    }

    async fn home_video_content(&self) -> String {
        String::new()
    }

    async fn category_content(
        &self,
        _tid: &str,
        _page: &str,
        _filter: bool,
        _extend: &HashMap<String, String>,
    ) -> String {
        String::new()
    }

    async fn detail_content(&self, _ids: &[String]) -> String {
        String::new()
    }

    async fn search_content(&self, _key: &str, _quick: bool, _page: Option<&str>) -> String {
        String::new()
    }

    async fn player_content(&self, _flag: &str, _id: &str, _vip_flags: &[String]) -> String {
        String::new()
    }

    async fn manual_video_check(&self) -> bool {
        false
    }

    async fn is_video_format(&self, _url: &str) -> bool {
        false
    }

    async fn proxy(&self, _params: &HashMap<String, String>) -> ProxyResponse {
        ProxyResponse::Empty
    }

    async fn destroy(&self) {}
}

// ─── Instance ───────────────────────────────────────────────────────────

/// A loaded plugin of any kind.
pub enum SpiderInstance {
    Native(NativeSpider),
    Script(ScriptSpider),
    Empty(EmptySpider),
}

impl std::fmt::Debug for SpiderInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SpiderInstance").field(&self.kind()).finish()
    }
}

impl SpiderInstance {
    pub fn empty() -> Self {
        Self::Empty(EmptySpider)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Native(_) => "native",
            Self::Script(_) => "script",
            Self::Empty(_) => "empty",
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty(_))
    }

    fn inner(&self) -> &dyn Spider {
        match self {
            Self::Native(s) => s,
            Self::Script(s) => s,
            Self::Empty(s) => s,
        }
    }
}

#[async_trait]
impl Spider for SpiderInstance {
    async fn init(&self, extend: &str) -> Result<(), SpiderError> {
        self.inner().init(extend).await
    }

    async fn home_content(&self, filter: bool) -> String {
        self.inner().home_content(filter).await
    }

    async fn home_video_content(&self) -> String {
        self.inner().home_video_content().await
    }

    async fn category_content(
        &self,
        tid: &str,
        page: &str,
        filter: bool,
        extend: &HashMap<String, String>,
    ) -> String {
        self.inner().category_content(tid, page, filter, extend).await
    }

    async fn detail_content(&self, ids: &[String]) -> String {
        self.inner().detail_content(ids).await
    }

    async fn search_content(&self, key: &str, quick: bool, page: Option<&str>) -> String {
        self.inner().search_content(key, quick, page).await
    }

    async fn player_content(&self, flag: &str, id: &str, vip_flags: &[String]) -> String {
        self.inner().player_content(flag, id, vip_flags).await
    }

    async fn manual_video_check(&self) -> bool {
        self.inner().manual_video_check().await
    }

    async fn is_video_format(&self, url: &str) -> bool {
        self.inner().is_video_format(url).await
    }

    async fn proxy(&self, params: &HashMap<String, String>) -> ProxyResponse {
        self.inner().proxy(params).await
    }

    async fn destroy(&self) {
        self.inner().destroy().await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
