//! Host functions installed into every script context.
//!
//! Bindings are listed in fixed tables and installed as plain globals
//! (plus the `local` and `console` objects). A binding that fails logs the
//! error and hands the guest `null`, so host faults never surface as guest
//! exceptions.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use boa_engine::object::builtins::JsFunction;
use boa_engine::object::{FunctionObjectBuilder, ObjectInitializer};
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsNativeError, JsObject, JsResult, JsString, JsValue, NativeFunction};
use freebox_relay::{Relay, RelayRequest, RelayResponse};

use super::bridge::{
    arg_bool, arg_bool_or, arg_i32, arg_opt_string, arg_string, js_str, response_to_js, stringify,
    to_text,
};
use super::crypto::{self, AesRequest, RsaRequest};
use super::worker::JobSender;
use super::zh;
use crate::cache::{local_key, KeyValueCache};
use crate::config::SpiderConfig;
use crate::descriptor::{md5_hex, resolve_reference};

/// Maximum log message length from scripts.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Global table holding completion callbacks of in-flight async requests.
const PENDING_HTTP: &str = "__pending_http__";

/// Sanitize a log message from a script.
///
/// Strips control characters (except newline/tab), truncates to max length.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

// ─── Host context ─────────────────────────────────────────────────────

/// Everything a script context's host functions need.
///
/// Built on the caller's side and moved onto the worker thread, where it
/// lives for as long as the context.
pub(crate) struct HostEnv {
    site_key: String,
    config: Arc<SpiderConfig>,
    relay: Relay,
    cache: Arc<dyn KeyValueCache>,
    jobs: JobSender,
    next_request: Cell<u64>,
}

impl HostEnv {
    pub(crate) fn new(
        site_key: String,
        config: Arc<SpiderConfig>,
        relay: Relay,
        cache: Arc<dyn KeyValueCache>,
        jobs: JobSender,
    ) -> Self {
        Self {
            site_key,
            config,
            relay,
            cache,
            jobs,
            next_request: Cell::new(0),
        }
    }

    pub(crate) fn site_key(&self) -> &str {
        &self.site_key
    }

    /// `getProxy(useLocal)`.
    pub(crate) fn proxy_url(&self, local: bool) -> String {
        self.config.proxy_url(local)
    }

    /// `js2Proxy(dynamic, siteType, siteKey, url, headers)`, with the
    /// headers already JSON-encoded.
    pub(crate) fn js2_proxy_url(
        &self,
        dynamic: bool,
        site_type: i32,
        site_key: &str,
        url: &str,
        headers_json: &str,
    ) -> String {
        format!(
            "{}&from=catvod&siteType={site_type}&siteKey={site_key}&header={}&url={}",
            self.proxy_url(!dynamic),
            urlencoding::encode(headers_json),
            urlencoding::encode(url),
        )
    }

    // ── Script-local cache ───────────────────────────────────────────

    pub(crate) fn local_get(&self, rule: &str, key: &str) -> String {
        self.cache.get(&local_key(rule, key)).unwrap_or_default()
    }

    pub(crate) fn local_set(&self, rule: &str, key: &str, value: &str) {
        self.cache.set(&local_key(rule, key), value);
    }

    pub(crate) fn local_delete(&self, rule: &str, key: &str) {
        self.cache.delete(&local_key(rule, key));
    }

    // ── HTTP ─────────────────────────────────────────────────────────

    /// Blocking request on the worker thread; never fails.
    fn fetch_blocking(&self, url: &str, request: &RelayRequest) -> RelayResponse {
        self.relay.runtime().block_on(self.relay.fetch(url, request))
    }

    fn next_request_id(&self) -> u64 {
        let id = self.next_request.get() + 1;
        self.next_request.set(id);
        id
    }

    // ── Logging ──────────────────────────────────────────────────────

    pub(crate) fn log_info(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::info!(site = %self.site_key, "{msg}");
    }

    pub(crate) fn log_debug(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::debug!(site = %self.site_key, "{msg}");
    }

    pub(crate) fn log_warn(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::warn!(site = %self.site_key, "{msg}");
    }

    pub(crate) fn log_error(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::error!(site = %self.site_key, "{msg}");
    }
}

// ─── Binding tables ───────────────────────────────────────────────────

type HostFn = fn(&HostEnv, &[JsValue], &mut Context) -> JsResult<JsValue>;

struct Binding {
    name: &'static str,
    length: usize,
    call: HostFn,
}

const GLOBALS: &[Binding] = &[
    Binding { name: "s2t", length: 1, call: s2t },
    Binding { name: "t2s", length: 1, call: t2s },
    Binding { name: "getPort", length: 0, call: get_port },
    Binding { name: "getProxy", length: 1, call: get_proxy },
    Binding { name: "js2Proxy", length: 5, call: js2_proxy },
    Binding { name: "http", length: 2, call: http },
    Binding { name: "_http", length: 2, call: http },
    Binding { name: "req", length: 2, call: req },
    Binding { name: "httpAsync", length: 3, call: http_async },
    Binding { name: "joinUrl", length: 2, call: join_url },
    Binding { name: "md5", length: 1, call: md5 },
    Binding { name: "md5X", length: 1, call: md5 },
    Binding { name: "aes", length: 7, call: aes },
    Binding { name: "aesX", length: 7, call: aes },
    Binding { name: "rsa", length: 7, call: rsa },
    Binding { name: "rsaX", length: 7, call: rsa },
];

const LOCAL: &[Binding] = &[
    Binding { name: "get", length: 2, call: local_get },
    Binding { name: "set", length: 3, call: local_set },
    Binding { name: "delete", length: 2, call: local_delete },
];

const CONSOLE: &[Binding] = &[
    Binding { name: "log", length: 0, call: console_info },
    Binding { name: "info", length: 0, call: console_info },
    Binding { name: "debug", length: 0, call: console_debug },
    Binding { name: "warn", length: 0, call: console_warn },
    Binding { name: "error", length: 0, call: console_error },
];

/// Install every host binding into `context`'s global scope.
pub(crate) fn install(context: &mut Context, env: Rc<HostEnv>) -> JsResult<()> {
    for binding in GLOBALS {
        let function = host_function(context, &env, binding);
        context.register_global_property(JsString::from(binding.name), function, Attribute::all())?;
    }

    let local = host_object(context, &env, LOCAL);
    context.register_global_property(js_string!("local"), local, Attribute::all())?;
    let console = host_object(context, &env, CONSOLE);
    context.register_global_property(js_string!("console"), console, Attribute::all())?;

    let pending = ObjectInitializer::new(context).build();
    context.register_global_property(JsString::from(PENDING_HTTP), pending, Attribute::all())?;
    Ok(())
}

fn host_function(context: &mut Context, env: &Rc<HostEnv>, binding: &Binding) -> JsFunction {
    let env = Rc::clone(env);
    let call = binding.call;
    let name = binding.name;
    // SAFETY: the closure captures an `Rc<HostEnv>`, a fn pointer and a
    // static str; none of them hold GC-managed values.
    let function = unsafe {
        NativeFunction::from_closure(move |_this, args, context| match call(&env, args, context) {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::error!(site = %env.site_key, function = name, "host call failed: {e}");
                Ok(JsValue::null())
            }
        })
    };
    FunctionObjectBuilder::new(context.realm(), function)
        .name(JsString::from(binding.name))
        .length(binding.length)
        .build()
}

fn host_object(context: &mut Context, env: &Rc<HostEnv>, bindings: &[Binding]) -> JsObject {
    let functions: Vec<(&'static str, JsFunction)> = bindings
        .iter()
        .map(|binding| (binding.name, host_function(context, env, binding)))
        .collect();
    let mut object = ObjectInitializer::new(context);
    for (name, function) in functions {
        object.property(JsString::from(name), function, Attribute::all());
    }
    object.build()
}

// ─── Text, URLs and crypto ────────────────────────────────────────────

fn s2t(_env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    Ok(js_str(&zh::to_traditional(&arg_string(args, 0, context)?)))
}

fn t2s(_env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    Ok(js_str(&zh::to_simplified(&arg_string(args, 0, context)?)))
}

fn get_port(env: &HostEnv, _args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::from(i32::from(env.config.http_port)))
}

fn get_proxy(env: &HostEnv, args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    Ok(js_str(&env.proxy_url(arg_bool_or(args, 0, true))))
}

fn js2_proxy(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let dynamic = arg_bool(args, 0);
    let site_type = arg_i32(args, 1, context)?;
    let site_key = arg_string(args, 2, context)?;
    let url = arg_string(args, 3, context)?;
    let headers = stringify(args.get(4).unwrap_or(&JsValue::undefined()), context);
    Ok(js_str(&env.js2_proxy_url(dynamic, site_type, &site_key, &url, &headers)))
}

fn join_url(_env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let parent = arg_string(args, 0, context)?;
    let child = arg_string(args, 1, context)?;
    match resolve_reference(&parent, &child) {
        Ok(joined) => Ok(js_str(&joined)),
        Err(e) => {
            tracing::debug!("joinUrl fell back to child: {e}");
            Ok(js_str(&child))
        }
    }
}

fn md5(_env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    Ok(js_str(&md5_hex(&arg_string(args, 0, context)?)))
}

fn aes(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let mode = arg_string(args, 0, context)?;
    let input = arg_string(args, 2, context)?;
    let key = arg_string(args, 4, context)?;
    let iv = arg_opt_string(args, 5, context)?;
    let request = AesRequest {
        mode: &mode,
        encrypt: arg_bool(args, 1),
        input: &input,
        in_base64: arg_bool(args, 3),
        key: &key,
        iv: iv.as_deref(),
        out_base64: arg_bool(args, 6),
    };
    match crypto::aes(&request) {
        Ok(out) => Ok(js_str(&out)),
        Err(e) => {
            tracing::warn!(site = %env.site_key, mode = %mode, "aes failed: {e}");
            Ok(js_str(""))
        }
    }
}

fn rsa(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let mode = arg_string(args, 0, context)?;
    let input = arg_string(args, 3, context)?;
    let key = arg_string(args, 5, context)?;
    let request = RsaRequest {
        mode: &mode,
        public: arg_bool(args, 1),
        encrypt: arg_bool(args, 2),
        input: &input,
        in_base64: arg_bool(args, 4),
        key: &key,
        out_base64: arg_bool(args, 6),
    };
    match crypto::rsa(&request) {
        Ok(out) => Ok(js_str(&out)),
        Err(e) => {
            tracing::warn!(site = %env.site_key, mode = %mode, "rsa failed: {e}");
            Ok(js_str(""))
        }
    }
}

// ─── HTTP ─────────────────────────────────────────────────────────────

fn relay_request(options: &JsValue, context: &mut Context) -> Option<RelayRequest> {
    match RelayRequest::from_json(&stringify(options, context)) {
        Ok(request) => Some(request),
        Err(e) => {
            tracing::error!("bad http options: {e}");
            None
        }
    }
}

/// `http(url, options)`: blocking, unless `options.complete` is a function.
fn http(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let options = args.get(1).cloned().unwrap_or_default();
    let complete = match options.as_object() {
        Some(object) => object.get(js_string!("complete"), context)?,
        None => JsValue::undefined(),
    };
    if complete.is_callable() {
        let url = arg_string(args, 0, context)?;
        start_async(env, url, &options, complete, context)?;
        return Ok(JsValue::undefined());
    }
    req(env, args, context)
}

/// `req(url, options)`: always blocking.
fn req(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let url = arg_string(args, 0, context)?;
    let options = args.get(1).cloned().unwrap_or_default();
    let response = match relay_request(&options, context) {
        Some(request) => env.fetch_blocking(&url, &request),
        None => RelayResponse::empty(),
    };
    response_to_js(&response, context)
}

/// `httpAsync(url, options, onComplete)`.
fn http_async(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let url = arg_string(args, 0, context)?;
    let options = args.get(1).cloned().unwrap_or_default();
    let complete = args.get(2).cloned().unwrap_or_default();
    if !complete.is_callable() {
        return Err(JsNativeError::typ()
            .with_message("httpAsync needs a completion callback")
            .into());
    }
    start_async(env, url, &options, complete, context)?;
    Ok(JsValue::undefined())
}

fn pending_table(context: &mut Context) -> JsResult<JsObject> {
    let global = context.global_object();
    let table = global.get(JsString::from(PENDING_HTTP), context)?;
    table.as_object().cloned().ok_or_else(|| {
        JsNativeError::typ()
            .with_message("pending request table is missing")
            .into()
    })
}

/// Park the guest callback under a request id and fire the request. The
/// completion hops from the relay's callback pool back onto this
/// context's worker.
fn start_async(
    env: &HostEnv,
    url: String,
    options: &JsValue,
    complete: JsValue,
    context: &mut Context,
) -> JsResult<()> {
    let id = env.next_request_id();
    pending_table(context)?.set(id, complete, false, context)?;

    let request = match relay_request(options, context) {
        Some(request) => request,
        None => {
            // Deliver the empty response through the queue all the same.
            env.jobs
                .submit(move |engine| engine.complete_http(id, RelayResponse::empty()));
            return Ok(());
        }
    };

    let jobs = env.jobs.clone();
    let site = env.site_key.clone();
    env.relay.fetch_async(url, request, move |response| {
        if !jobs.submit(move |engine| engine.complete_http(id, response)) {
            tracing::debug!(site = %site, request = id, "context closed before http completion");
        }
    });
    Ok(())
}

/// Hand a finished async response to the guest callback parked under `id`.
pub(crate) fn deliver_http(context: &mut Context, id: u64, response: &RelayResponse) -> JsResult<()> {
    let table = pending_table(context)?;
    let callback = table.get(id, context)?;
    table.delete_property_or_throw(id, context)?;
    let Some(callback) = callback.as_callable() else {
        return Ok(());
    };
    let value = response_to_js(response, context)?;
    callback.call(&JsValue::undefined(), &[value], context)?;
    Ok(())
}

// ─── local / console ──────────────────────────────────────────────────

fn local_get(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let rule = arg_string(args, 0, context)?;
    let key = arg_string(args, 1, context)?;
    Ok(js_str(&env.local_get(&rule, &key)))
}

fn local_set(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let rule = arg_string(args, 0, context)?;
    let key = arg_string(args, 1, context)?;
    let value = to_text(args.get(2).unwrap_or(&JsValue::undefined()), context);
    env.local_set(&rule, &key, &value);
    Ok(JsValue::undefined())
}

fn local_delete(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let rule = arg_string(args, 0, context)?;
    let key = arg_string(args, 1, context)?;
    env.local_delete(&rule, &key);
    Ok(JsValue::undefined())
}

fn console_message(args: &[JsValue], context: &mut Context) -> String {
    args.iter()
        .map(|arg| to_text(arg, context))
        .collect::<Vec<_>>()
        .join(" ")
}

fn console_info(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    env.log_info(&console_message(args, context));
    Ok(JsValue::undefined())
}

fn console_debug(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    env.log_debug(&console_message(args, context));
    Ok(JsValue::undefined())
}

fn console_warn(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    env.log_warn(&console_message(args, context));
    Ok(JsValue::undefined())
}

fn console_error(env: &HostEnv, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    env.log_error(&console_message(args, context));
    Ok(JsValue::undefined())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::script::worker::ScriptWorker;
    use boa_engine::Source;
    use freebox_relay::RelayConfig;

    #[test]
    fn test_sanitize_log_message() {
        assert_eq!(sanitize_log_message("hello world"), "hello world");
        assert_eq!(sanitize_log_message("line1\nline2"), "line1\nline2");
        assert_eq!(sanitize_log_message("bad\x00\x01\x02chars"), "badchars");
        let long = "x".repeat(MAX_LOG_MESSAGE_LEN + 10);
        let result = sanitize_log_message(&long);
        assert!(result.ends_with("(truncated)"));
    }

    /// A context with host bindings; the worker is only used as a queue.
    fn context_with_env(cache: Arc<dyn KeyValueCache>) -> (Context, ScriptWorker) {
        let worker = ScriptWorker::spawn("host-api-test").unwrap();
        let mut config = SpiderConfig::default();
        config.public_host = "10.1.1.1".into();
        let env = HostEnv::new(
            "site1".into(),
            Arc::new(config),
            Relay::new(RelayConfig::default()).unwrap(),
            cache,
            worker.sender(),
        );
        let mut context = Context::default();
        install(&mut context, Rc::new(env)).unwrap();
        (context, worker)
    }

    fn eval_text(context: &mut Context, code: &str) -> String {
        let value = context.eval(Source::from_bytes(code)).unwrap();
        to_text(&value, context)
    }

    #[tokio::test]
    async fn test_url_helpers() {
        let (mut context, _worker) = context_with_env(Arc::new(MemoryCache::new()));
        assert_eq!(eval_text(&mut context, "getPort()"), "9978");
        assert_eq!(
            eval_text(&mut context, "getProxy(true)"),
            "http://127.0.0.1:9978/proxy?do=js"
        );
        assert_eq!(
            eval_text(&mut context, "getProxy(false)"),
            "http://10.1.1.1:9978/proxy?do=js"
        );
        assert_eq!(
            eval_text(&mut context, "joinUrl('http://a.com/x/y.json', '../z.js')"),
            "http://a.com/z.js"
        );
        assert_eq!(eval_text(&mut context, "joinUrl('bad base', 'z.js')"), "z.js");
    }

    #[tokio::test]
    async fn test_js2_proxy_encodes_headers_and_url() {
        let (mut context, _worker) = context_with_env(Arc::new(MemoryCache::new()));
        let url = eval_text(
            &mut context,
            "js2Proxy(true, 3, 'k', 'http://v.io/a b.m3u8', {Referer: 'x'})",
        );
        assert_eq!(
            url,
            "http://10.1.1.1:9978/proxy?do=js&from=catvod&siteType=3&siteKey=k\
             &header=%7B%22Referer%22%3A%22x%22%7D&url=http%3A%2F%2Fv.io%2Fa%20b.m3u8"
        );
        let url = eval_text(&mut context, "js2Proxy(false, 3, 'k', 'u', null)");
        assert!(url.starts_with("http://127.0.0.1:9978/proxy?do=js&"));
        assert!(url.contains("&header=%7B%7D&"));
    }

    #[tokio::test]
    async fn test_local_cache_uses_site_namespace() {
        let cache = Arc::new(MemoryCache::new());
        let (mut context, _worker) = context_with_env(cache.clone());
        eval_text(&mut context, "local.set('site1', 'token', 'abc')");
        assert_eq!(cache.get("cache_site1_token").as_deref(), Some("abc"));
        assert_eq!(eval_text(&mut context, "local.get('site1', 'token')"), "abc");
        eval_text(&mut context, "local.set('', 'bare', 'v')");
        assert_eq!(cache.get("cache_bare").as_deref(), Some("v"));
        eval_text(&mut context, "local.delete('site1', 'token')");
        assert_eq!(eval_text(&mut context, "local.get('site1', 'token')"), "");
    }

    #[tokio::test]
    async fn test_text_and_crypto_bindings() {
        let (mut context, _worker) = context_with_env(Arc::new(MemoryCache::new()));
        assert_eq!(
            eval_text(&mut context, "md5('hello')"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(eval_text(&mut context, "md5X('hello')"), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(eval_text(&mut context, "s2t('电视剧')"), "電視劇");
        assert_eq!(eval_text(&mut context, "t2s('電視劇')"), "电视剧");
        let round_trip = eval_text(
            &mut context,
            "aes('AES/CBC/PKCS7Padding', false, \
               aes('AES/CBC/PKCS7Padding', true, 'secret', false, 'k', 'iv', true), \
               true, 'k', 'iv', false)",
        );
        assert_eq!(round_trip, "secret");
        assert_eq!(eval_text(&mut context, "rsa('RSA', true, true, 'x', false, 'junk', true)"), "");
    }

    #[tokio::test]
    async fn test_console_does_not_throw() {
        let (mut context, _worker) = context_with_env(Arc::new(MemoryCache::new()));
        assert_eq!(eval_text(&mut context, "console.log('a', {b: 1}); 'ok'"), "ok");
    }
}
