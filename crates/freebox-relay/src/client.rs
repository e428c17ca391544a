//! Relay client: executes [`RelayRequest`]s against a shared base client.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{redirect, Client, Method};
use tokio::runtime::Handle;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::pool::CallbackPool;
use crate::request::{RelayRequest, RequestBody};
use crate::response::{charset_of, Content, RelayResponse};

/// Maximum redirects followed when a request allows redirects.
const MAX_REDIRECTS: usize = 10;

struct RelayInner {
    /// Base client that follows redirects.
    follow: Client,
    /// Base client with redirects disabled.
    manual: Client,
    config: RelayConfig,
    pool: CallbackPool,
    runtime: Handle,
}

/// HTTP relay shared by host code and guest scripts.
///
/// Cloning is cheap; all clones share connection pools and the callback
/// pool.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Build a relay bound to the current tokio runtime.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let runtime = Handle::try_current().map_err(|e| RelayError::Runtime(e.to_string()))?;
        let follow = Self::base_client(&config, redirect::Policy::limited(MAX_REDIRECTS))?;
        let manual = Self::base_client(&config, redirect::Policy::none())?;
        Ok(Self {
            inner: Arc::new(RelayInner {
                follow,
                manual,
                pool: CallbackPool::new(runtime.clone()),
                runtime,
                config,
            }),
        })
    }

    fn base_client(config: &RelayConfig, policy: redirect::Policy) -> Result<Client, RelayError> {
        Ok(Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .redirect(policy)
            .build()?)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Runtime the relay spawns asynchronous calls on.
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn pool(&self) -> &CallbackPool {
        &self.inner.pool
    }

    /// Execute a request, propagating every failure.
    pub async fn send(&self, url: &str, request: &RelayRequest) -> Result<RelayResponse, RelayError> {
        let target =
            url::Url::parse(url).map_err(|e| RelayError::InvalidUrl(format!("{url}: {e}")))?;
        let method = request.method()?;
        let client = if request.follows_redirects() {
            &self.inner.follow
        } else {
            &self.inner.manual
        };

        let mut builder = client
            .request(method.clone(), target)
            .timeout(request.timeout_or(self.inner.config.timeout));
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if method != Method::GET && method != Method::HEAD {
            let body = request.encode_body()?;
            if let Some(content_type) = body.content_type() {
                builder = builder.header(CONTENT_TYPE, content_type);
            }
            builder = match body {
                RequestBody::Empty => builder,
                RequestBody::Json(bytes) | RequestBody::Raw { bytes, .. } => builder.body(bytes),
                RequestBody::Multipart { bytes, .. } => builder.body(bytes),
                RequestBody::Form(fields) => builder.form(&fields),
            };
        }

        let response = builder.send().await?;
        let code = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let charset = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(charset_of)
            .or_else(|| request.header("Content-Type").and_then(charset_of))
            .map(str::to_string);
        let body = response.bytes().await?;

        Ok(RelayResponse {
            code: Some(code),
            headers,
            content: Content::from_body(request.buffer_mode(), &body, charset.as_deref()),
        })
    }

    /// Execute a request; any failure yields [`RelayResponse::empty`].
    pub async fn fetch(&self, url: &str, request: &RelayRequest) -> RelayResponse {
        match self.send(url, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(url = %url, "relay request failed: {e}");
                RelayResponse::empty()
            }
        }
    }

    /// Execute a request in the background.
    ///
    /// `on_complete` runs on the shared callback pool, never inline, and is
    /// dropped without running if the pool has been shut down by then.
    pub fn fetch_async<F>(&self, url: String, request: RelayRequest, on_complete: F)
    where
        F: FnOnce(RelayResponse) + Send + 'static,
    {
        let relay = self.clone();
        self.inner.runtime.spawn(async move {
            let response = relay.fetch(&url, &request).await;
            relay.inner.pool.submit(move || on_complete(response));
        });
    }

    /// Fetch a whole resource as bytes, failing on non-success status.
    pub async fn download(&self, url: &str) -> Result<Bytes, RelayError> {
        let response = self.inner.follow.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?)
    }
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        out.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay() -> Relay {
        Relay::new(RelayConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_base64_mode_round_trips_body() {
        let server = MockServer::start().await;
        let payload: Vec<u8> = vec![0x00, 0x9F, 0x92, 0x96, 0xFF];
        Mock::given(method("GET"))
            .and(path("/bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .mount(&server)
            .await;

        let res = relay()
            .fetch(&format!("{}/bin", server.uri()), &RelayRequest::with_buffer(2))
            .await;
        let Content::Base64(encoded) = &res.content else {
            panic!("expected base64 content, got {:?}", res.content);
        };
        assert_eq!(STANDARD.decode(encoded).unwrap(), payload);
        assert_eq!(res.code, Some(200));
    }

    #[tokio::test]
    async fn test_text_defaults_to_utf8() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/text"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("你好".as_bytes(), "text/plain"))
            .mount(&server)
            .await;

        let res = relay()
            .fetch(&format!("{}/text", server.uri()), &RelayRequest::default())
            .await;
        assert_eq!(res.content, Content::Text("你好".into()));
    }

    #[tokio::test]
    async fn test_text_uses_response_charset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gbk"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(vec![0xD6, 0xD0, 0xCE, 0xC4], "text/html; Charset=GBK"),
            )
            .mount(&server)
            .await;

        let res = relay()
            .fetch(&format!("{}/gbk", server.uri()), &RelayRequest::default())
            .await;
        assert_eq!(res.content, Content::Text("中文".into()));
    }

    #[tokio::test]
    async fn test_json_post() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/post"))
            .and(header("content-type", "application/json; charset=utf-8"))
            .and(body_json(json!({"q": "term"})))
            .respond_with(ResponseTemplate::new(201).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let request = RelayRequest {
            method: Some("post".into()),
            data: Some(json!({"q": "term"})),
            ..Default::default()
        };
        let res = relay()
            .fetch(&format!("{}/post", server.uri()), &request)
            .await;
        assert_eq!(res.code, Some(201));
        assert_eq!(res.content.as_text(), Some("ok"));
    }

    #[tokio::test]
    async fn test_form_post() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/form"))
            .and(body_string("a=1&b=two"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let request = RelayRequest {
            method: Some("POST".into()),
            post_type: Some("form".into()),
            data: Some(json!({"a": 1, "b": "two"})),
            ..Default::default()
        };
        let res = relay()
            .fetch(&format!("{}/form", server.uri()), &request)
            .await;
        assert_eq!(res.code, Some(200));
    }

    #[tokio::test]
    async fn test_redirect_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "/elsewhere"),
            )
            .mount(&server)
            .await;

        let request = RelayRequest {
            redirect: Some(json!(0)),
            ..Default::default()
        };
        let res = relay()
            .fetch(&format!("{}/moved", server.uri()), &request)
            .await;
        assert_eq!(res.code, Some(302));
        assert_eq!(res.header("Location"), Some("/elsewhere"));
    }

    #[tokio::test]
    async fn test_multi_value_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cookies"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("x-multi", "a")
                    .append_header("x-multi", "b"),
            )
            .mount(&server)
            .await;

        let res = relay()
            .fetch(&format!("{}/cookies", server.uri()), &RelayRequest::default())
            .await;
        assert_eq!(
            res.headers.get("x-multi"),
            Some(&vec!["a".to_string(), "b".to_string()])
        );
    }

    #[tokio::test]
    async fn test_failure_yields_empty_response() {
        let res = relay()
            .fetch("http://127.0.0.1:1/unreachable", &RelayRequest::default())
            .await;
        assert!(res.is_empty());

        let res = relay().fetch("not a url", &RelayRequest::default()).await;
        assert_eq!(res, RelayResponse::empty());
    }

    #[tokio::test]
    async fn test_fetch_async_delivers_on_pool() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/async"))
            .respond_with(ResponseTemplate::new(200).set_body_string("later"))
            .mount(&server)
            .await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        relay().fetch_async(
            format!("{}/async", server.uri()),
            RelayRequest::default(),
            move |res| {
                let _ = tx.send(res);
            },
        );
        let res = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("callback never ran")
            .unwrap();
        assert_eq!(res.content.as_text(), Some("later"));
    }

    #[tokio::test]
    async fn test_fetch_async_after_shutdown_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let relay = relay();
        relay.pool().shutdown();
        let (tx, rx) = tokio::sync::oneshot::channel::<RelayResponse>();
        relay.fetch_async(server.uri(), RelayRequest::default(), move |res| {
            let _ = tx.send(res);
        });
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_download_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.jar"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = relay()
            .download(&format!("{}/missing.jar", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Status(404)));
    }
}
