//! [`Spider`] implementation backed by a script context.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boa_engine::object::builtins::JsArray;
use boa_engine::object::ObjectInitializer;
use boa_engine::{Context, JsError, JsResult, JsString, JsValue};
use bytes::Bytes;
use freebox_relay::Relay;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;

use super::bridge::{bytes_from_js, js_str, parse_json, stringify, to_text};
use super::engine::{Arg, ScriptEngine};
use super::host_api::HostEnv;
use super::promise::{self, Continuation, Settlement};
use super::worker::ScriptWorker;
use super::ScriptSource;
use crate::cache::KeyValueCache;
use crate::config::SpiderConfig;
use crate::error::SpiderError;
use crate::spider::{decode_stream_text, header_map, ProxyReply, ProxyResponse, Spider, DEFAULT_CONTENT_TYPE};

/// `from` value selecting the structured proxy form.
const CATVOD_PROXY: &str = "catvod";

/// Settled result of a guest call, converted on the worker thread.
#[derive(Debug)]
enum Outcome {
    Resolved { text: String, truthy: bool },
    Rejected(String),
}

/// Response envelope returned by structured-form `proxy`.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    code: Option<u16>,
    buffer: Option<i64>,
    content: Option<String>,
    headers: Option<Value>,
}

impl Envelope {
    fn content_type(&self) -> String {
        let headers = self.headers.as_ref().and_then(header_map).unwrap_or_default();
        headers
            .get("Content-Type")
            .or_else(|| headers.get("content-type"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
    }

    fn into_response(self) -> Result<ProxyResponse, SpiderError> {
        let content_type = self.content_type();
        let content = self.content.unwrap_or_default();
        let body = decode_stream_text(&content, self.buffer == Some(2))?;
        Ok(ProxyResponse::Reply(ProxyReply {
            status: self.code.unwrap_or(200),
            content_type,
            body,
            headers: None,
        }))
    }
}

/// A guest spider running on its own worker thread.
///
/// Every call is a job on the worker; the host waits at most the
/// configured call timeout for the guest to settle.
pub struct ScriptSpider {
    site_key: String,
    worker: ScriptWorker,
    call_timeout: Duration,
}

impl std::fmt::Debug for ScriptSpider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptSpider")
            .field("site_key", &self.site_key)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl ScriptSpider {
    /// Spawn a worker and evaluate `source` in a fresh context on it.
    pub(crate) async fn start(
        site_key: &str,
        source: Arc<ScriptSource>,
        config: Arc<SpiderConfig>,
        relay: Relay,
        cache: Arc<dyn KeyValueCache>,
    ) -> Result<Self, SpiderError> {
        let worker = ScriptWorker::spawn(site_key)?;
        let env = HostEnv::new(
            site_key.to_string(),
            Arc::clone(&config),
            relay,
            cache,
            worker.sender(),
        );
        let js_dir = config.js_dir.clone();
        worker
            .run(config.call_timeout, move |slot| {
                *slot = Some(ScriptEngine::create(&source, env, &js_dir)?);
                Ok::<(), SpiderError>(())
            })
            .await??;

        Ok(Self {
            site_key: site_key.to_string(),
            worker,
            call_timeout: config.call_timeout,
        })
    }

    /// Start a guest call on the worker and wait for it to settle.
    async fn settle<F>(&self, function: &str, start: F) -> Result<Outcome, SpiderError>
    where
        F: FnOnce(&mut ScriptEngine, Continuation) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let submitted = self.worker.sender().submit(move |engine| {
            let continuation: Continuation = Box::new(move |settlement, context| {
                let outcome = match settlement {
                    Settlement::Resolved(value) => Outcome::Resolved {
                        truthy: value.to_boolean(),
                        text: to_text(&value, context),
                    },
                    Settlement::Rejected(reason) => {
                        Outcome::Rejected(JsError::from_opaque(reason).to_string())
                    }
                };
                let _ = tx.send(outcome);
            });
            start(engine, continuation);
        });
        if !submitted {
            return Err(SpiderError::InvocationFailure(format!(
                "{}.{function}: script context closed",
                self.site_key
            )));
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(SpiderError::InvocationFailure(format!(
                "{}.{function}: call dropped before settling",
                self.site_key
            ))),
            Err(_) => Err(SpiderError::InvocationTimeout(format!(
                "{}.{function}: no result after {:?}",
                self.site_key, self.call_timeout
            ))),
        }
    }

    /// Call a guest function; the settled value as text, `""` on failure.
    async fn call_text(&self, function: &'static str, args: Vec<Arg>) -> String {
        match self.call_outcome(function, args).await {
            Some((text, _)) => text,
            None => String::new(),
        }
    }

    /// Call a guest function; the truthiness of its settled value.
    async fn call_flag(&self, function: &'static str, args: Vec<Arg>) -> bool {
        self.call_outcome(function, args)
            .await
            .is_some_and(|(_, truthy)| truthy)
    }

    async fn call_outcome(&self, function: &'static str, args: Vec<Arg>) -> Option<(String, bool)> {
        let outcome = self
            .settle(function, move |engine, continuation| {
                engine.call(function, args, continuation)
            })
            .await;
        match outcome {
            Ok(Outcome::Resolved { text, truthy }) => Some((text, truthy)),
            Ok(Outcome::Rejected(reason)) => {
                tracing::error!(site = %self.site_key, function = %function, "guest call rejected: {reason}");
                None
            }
            Err(e) => {
                tracing::warn!(site = %self.site_key, function = %function, "guest call failed: {e}");
                None
            }
        }
    }

    // ── Proxy ────────────────────────────────────────────────────────

    /// Structured form: `proxy(urlSegments, headers)` answering with a JSON
    /// envelope.
    async fn proxy_catvod(&self, params: &HashMap<String, String>) -> Result<ProxyResponse, SpiderError> {
        let url = params.get("url").map(String::as_str).unwrap_or_default();
        let segments = url.split('/').map(str::to_string).collect();
        let header: Value = serde_json::from_str(params.get("header").map(String::as_str).unwrap_or("{}"))?;

        let outcome = self
            .settle("proxy", move |engine, continuation| {
                engine.call("proxy", vec![Arg::List(segments), Arg::Json(header)], continuation)
            })
            .await?;
        let text = match outcome {
            Outcome::Resolved { text, .. } => text,
            Outcome::Rejected(reason) => {
                return Err(SpiderError::InvocationFailure(format!("proxy rejected: {reason}")))
            }
        };
        let envelope: Envelope = serde_json::from_str(&text)?;
        envelope.into_response()
    }

    /// Binary form: `proxy(params)` answering with
    /// `[code, contentType, body, headers?, base64?]`, directly or as JSON
    /// text, optionally wrapped in a promise.
    async fn proxy_binary(&self, params: &HashMap<String, String>) -> Result<ProxyResponse, SpiderError> {
        let params = params.clone();
        let (tx, rx) = oneshot::channel();
        let submitted = self.worker.sender().submit(move |engine| {
            let args = match params_object(&params, engine.context()) {
                Ok(args) => args,
                Err(e) => {
                    let _ = tx.send(Err(SpiderError::from(e)));
                    return;
                }
            };
            let value = match engine.invoke("proxy", &[args]) {
                Ok(value) => value,
                Err(e) => {
                    let _ = tx.send(Err(SpiderError::from(e)));
                    return;
                }
            };
            let context = engine.context();
            if !promise::is_thenable(&value, context) {
                let _ = tx.send(binary_reply(&value, context));
                return;
            }
            promise::settle(
                value,
                context,
                Box::new(move |settlement, context| {
                    let reply = match settlement {
                        Settlement::Resolved(value) => binary_reply(&value, context),
                        Settlement::Rejected(reason) => Err(SpiderError::InvocationFailure(format!(
                            "proxy rejected: {}",
                            JsError::from_opaque(reason)
                        ))),
                    };
                    let _ = tx.send(reply);
                }),
            );
        });
        if !submitted {
            return Err(SpiderError::InvocationFailure("script context closed".to_string()));
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SpiderError::InvocationFailure("proxy dropped before settling".to_string())),
            Err(_) => Err(SpiderError::InvocationTimeout(format!(
                "proxy: no result after {:?}",
                self.call_timeout
            ))),
        }
    }
}

fn params_object(params: &HashMap<String, String>, context: &mut Context) -> JsResult<JsValue> {
    let object = ObjectInitializer::new(context).build();
    for (key, value) in params {
        object.set(JsString::from(key.as_str()), js_str(value), false, context)?;
    }
    Ok(object.into())
}

/// Normalize a binary-form proxy result.
fn binary_reply(value: &JsValue, context: &mut Context) -> Result<ProxyResponse, SpiderError> {
    let value = match value.as_string() {
        Some(text) => parse_json(&text.to_std_string_escaped(), context)?,
        None => value.clone(),
    };
    let Some(array) = value.as_object().and_then(|o| JsArray::from_object(o.clone()).ok()) else {
        return Ok(ProxyResponse::Empty);
    };
    let len = array.length(context)?;
    if len < 3 {
        return Ok(ProxyResponse::Empty);
    }

    let status = array.at(0, context)?.to_u32(context)?;
    let status = u16::try_from(status)
        .map_err(|_| SpiderError::InvocationFailure(format!("bad proxy status: {status}")))?;
    let content_type = to_text(&array.at(1, context)?, context);
    let base64 = len > 4 && array.at(4, context)?.to_i32(context)? == 1;
    let body = array.at(2, context)?;
    let body = match bytes_from_js(&body, context)? {
        Some(bytes) => Bytes::from(bytes),
        None => decode_stream_text(&to_text(&body, context), base64)?,
    };
    let headers = if len > 3 {
        let headers = array.at(3, context)?;
        let text = match headers.as_string() {
            Some(text) => text.to_std_string_escaped(),
            None => stringify(&headers, context),
        };
        serde_json::from_str::<Value>(&text).ok().as_ref().and_then(header_map)
    } else {
        None
    };

    Ok(ProxyResponse::Reply(ProxyReply {
        status,
        content_type: if content_type.is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            content_type
        },
        body,
        headers,
    }))
}

#[async_trait]
impl Spider for ScriptSpider {
    async fn init(&self, extend: &str) -> Result<(), SpiderError> {
        let extend = extend.to_string();
        let outcome = self
            .settle("init", move |engine, continuation| engine.init(&extend, continuation))
            .await?;
        if let Outcome::Rejected(reason) = outcome {
            tracing::error!(site = %self.site_key, function = "init", "guest call rejected: {reason}");
        }
        Ok(())
    }

    async fn home_content(&self, filter: bool) -> String {
        self.call_text("home", vec![Arg::Flag(filter)]).await
    }

    async fn home_video_content(&self) -> String {
        self.call_text("homeVod", Vec::new()).await
    }

    async fn category_content(
        &self,
        tid: &str,
        page: &str,
        filter: bool,
        extend: &HashMap<String, String>,
    ) -> String {
        let extend = serde_json::to_value(extend).unwrap_or_else(|_| Value::Object(Default::default()));
        self.call_text(
            "category",
            vec![
                Arg::Text(tid.to_string()),
                Arg::Text(page.to_string()),
                Arg::Flag(filter),
                Arg::Json(extend),
            ],
        )
        .await
    }

    async fn detail_content(&self, ids: &[String]) -> String {
        let id = ids.first().cloned().unwrap_or_default();
        self.call_text("detail", vec![Arg::Text(id)]).await
    }

    async fn search_content(&self, key: &str, quick: bool, page: Option<&str>) -> String {
        let mut args = vec![Arg::Text(key.to_string()), Arg::Flag(quick)];
        if let Some(page) = page {
            args.push(Arg::Text(page.to_string()));
        }
        self.call_text("search", args).await
    }

    async fn player_content(&self, flag: &str, id: &str, vip_flags: &[String]) -> String {
        self.call_text(
            "play",
            vec![
                Arg::Text(flag.to_string()),
                Arg::Text(id.to_string()),
                Arg::List(vip_flags.to_vec()),
            ],
        )
        .await
    }

    async fn manual_video_check(&self) -> bool {
        self.call_flag("sniffer", Vec::new()).await
    }

    async fn is_video_format(&self, url: &str) -> bool {
        self.call_flag("isVideo", vec![Arg::Text(url.to_string())]).await
    }

    async fn proxy(&self, params: &HashMap<String, String>) -> ProxyResponse {
        let result = if params.get("from").map(String::as_str) == Some(CATVOD_PROXY) {
            self.proxy_catvod(params).await
        } else {
            self.proxy_binary(params).await
        };
        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(site = %self.site_key, function = "proxy", "proxy failed: {e}");
                ProxyResponse::Empty
            }
        }
    }

    async fn destroy(&self) {
        let closed = self
            .worker
            .run(self.call_timeout, |slot| drop(slot.take()))
            .await;
        if let Err(e) = closed {
            tracing::warn!(site = %self.site_key, "closing script context failed: {e}");
        }
        self.worker.stop();
        tracing::info!(site = %self.site_key, "script spider destroyed");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
