//! One script context: module evaluation, spider resolution and calls.
//!
//! A [`ScriptEngine`] is created on, and never leaves, its worker thread.

use std::path::Path;
use std::rc::Rc;

use boa_engine::builtins::promise::PromiseState;
use boa_engine::module::SimpleModuleLoader;
use boa_engine::object::builtins::JsArray;
use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsError, JsObject, JsResult, JsString, JsValue, Module, Source};
use freebox_relay::RelayResponse;

use super::bridge::{js_str, parse_json};
use super::host_api::{self, HostEnv};
use super::promise::{self, Continuation, Settlement};
use super::ScriptSource;
use crate::error::SpiderError;

/// Global a script may pre-populate with its spider object.
const SPIDER_GLOBAL: &str = "__JS_SPIDER__";

/// Zero-argument factory export of cat-style scripts.
const CAT_FACTORY: &str = "__jsEvalReturn";

/// Site type reported to cat-style scripts.
const CAT_SITE_TYPE: i32 = 3;

/// Host-side argument to a guest call, converted on the worker thread.
#[derive(Debug, Clone)]
pub(crate) enum Arg {
    Text(String),
    Flag(bool),
    Json(serde_json::Value),
    List(Vec<String>),
}

impl Arg {
    fn into_js(self, context: &mut Context) -> JsResult<JsValue> {
        Ok(match self {
            Self::Text(text) => js_str(&text),
            Self::Flag(flag) => JsValue::from(flag),
            Self::Json(value) => JsValue::from_json(&value, context)?,
            Self::List(items) => JsArray::from_iter(items.iter().map(|s| js_str(s)), context).into(),
        })
    }
}

pub(crate) struct ScriptEngine {
    context: Context,
    spider: JsObject,
    cat_style: bool,
    site_key: String,
}

impl ScriptEngine {
    /// Build a context with the host API installed, evaluate `source` as a
    /// module and resolve its spider object.
    pub(crate) fn create(source: &ScriptSource, env: HostEnv, working_dir: &Path) -> Result<Self, SpiderError> {
        std::fs::create_dir_all(working_dir)?;
        let site_key = env.site_key().to_string();
        let loader = SimpleModuleLoader::new(working_dir)?;
        let mut context = Context::builder().module_loader(Rc::new(loader)).build()?;
        host_api::install(&mut context, Rc::new(env))?;

        let module = Module::parse(Source::from_bytes(source.code.as_bytes()), None, &mut context)
            .map_err(|e| SpiderError::ModuleLoad(format!("{}: {e}", source.name)))?;
        let evaluation = module.load_link_evaluate(&mut context);
        context.run_jobs();
        match evaluation.state() {
            PromiseState::Fulfilled(_) => {}
            PromiseState::Rejected(reason) => {
                return Err(SpiderError::ModuleLoad(format!(
                    "{}: {}",
                    source.name,
                    JsError::from_opaque(reason)
                )));
            }
            PromiseState::Pending => {
                return Err(SpiderError::ModuleLoad(format!(
                    "{}: module evaluation did not finish",
                    source.name
                )));
            }
        }

        let namespace = module.namespace(&mut context);
        let (spider, cat_style) = resolve_spider(&namespace, &mut context)?;
        context
            .global_object()
            .set(js_string!(SPIDER_GLOBAL), spider.clone(), false, &mut context)?;

        tracing::info!(
            site = %site_key,
            script = %source.name,
            cat_style,
            "script context ready"
        );
        Ok(Self {
            context,
            spider,
            cat_style,
            site_key,
        })
    }

    pub(crate) fn context(&mut self) -> &mut Context {
        &mut self.context
    }

    pub(crate) fn run_jobs(&mut self) {
        self.context.run_jobs();
    }

    /// Argument for the guest `init`.
    ///
    /// Cat-style scripts get a config object carrying the site identity;
    /// others get the extend string, parsed when it is a JSON object or
    /// array.
    pub(crate) fn init_argument(&mut self, extend: &str) -> JsResult<JsValue> {
        let ext = if looks_like_json(extend) {
            parse_json(extend, &mut self.context)?
        } else {
            js_str(extend)
        };
        if !self.cat_style {
            return Ok(ext);
        }

        let key = js_str(&self.site_key);
        Ok(ObjectInitializer::new(&mut self.context)
            .property(js_string!("stype"), CAT_SITE_TYPE, Attribute::all())
            .property(js_string!("skey"), key.clone(), Attribute::all())
            .property(js_string!("type"), CAT_SITE_TYPE, Attribute::all())
            .property(js_string!("key"), key, Attribute::all())
            .property(js_string!("code"), js_string!(""), Attribute::all())
            .property(js_string!("ext"), ext, Attribute::all())
            .build()
            .into())
    }

    /// Call the guest `init` with the shaped extend argument.
    pub(crate) fn init(&mut self, extend: &str, continuation: Continuation) {
        match self.init_argument(extend) {
            Ok(arg) => self.call_with("init", &[arg], continuation),
            Err(e) => {
                let reason = e.to_opaque(&mut self.context);
                continuation(Settlement::Rejected(reason), &mut self.context);
            }
        }
    }

    /// Invoke a spider method and return its raw result.
    pub(crate) fn invoke(&mut self, function: &str, args: &[JsValue]) -> JsResult<JsValue> {
        let method = self.spider.get(JsString::from(function), &mut self.context)?;
        let Some(callable) = method.as_callable() else {
            return Err(boa_engine::JsNativeError::typ()
                .with_message(format!("spider has no function '{function}'"))
                .into());
        };
        callable.call(&JsValue::from(self.spider.clone()), args, &mut self.context)
    }

    /// Invoke a spider method and hand its settled result to `continuation`.
    pub(crate) fn call(&mut self, function: &str, args: Vec<Arg>, continuation: Continuation) {
        let args = match args
            .into_iter()
            .map(|arg| arg.into_js(&mut self.context))
            .collect::<JsResult<Vec<_>>>()
        {
            Ok(args) => args,
            Err(e) => {
                let reason = e.to_opaque(&mut self.context);
                continuation(Settlement::Rejected(reason), &mut self.context);
                return;
            }
        };
        self.call_with(function, &args, continuation);
    }

    /// Like [`call`](Self::call) with arguments already in guest form.
    pub(crate) fn call_with(&mut self, function: &str, args: &[JsValue], continuation: Continuation) {
        match self.invoke(function, args) {
            Ok(value) => promise::settle(value, &mut self.context, continuation),
            Err(e) => {
                let reason = e.to_opaque(&mut self.context);
                continuation(Settlement::Rejected(reason), &mut self.context);
            }
        }
    }

    /// Deliver an async HTTP response to its parked guest callback.
    pub(crate) fn complete_http(&mut self, id: u64, response: RelayResponse) {
        if let Err(e) = host_api::deliver_http(&mut self.context, id, &response) {
            tracing::error!(site = %self.site_key, request = id, "http callback failed: {e}");
        }
    }
}

/// Locate the spider object of an evaluated module; the flag marks
/// cat-style scripts, i.e. ones built by an exported factory.
fn resolve_spider(namespace: &JsObject, context: &mut Context) -> Result<(JsObject, bool), SpiderError> {
    let existing = context
        .global_object()
        .get(js_string!(SPIDER_GLOBAL), context)?;
    if let Some(spider) = existing.as_object() {
        return Ok((spider.clone(), false));
    }

    let factory = namespace.get(js_string!(CAT_FACTORY), context)?;
    if let Some(factory) = factory.as_callable() {
        let spider = factory.call(&JsValue::undefined(), &[], context)?;
        return Ok((expect_object(spider, CAT_FACTORY)?, true));
    }

    let default = namespace.get(js_string!("default"), context)?;
    if let Some(factory) = default.as_callable() {
        let spider = factory.call(&JsValue::undefined(), &[], context)?;
        return Ok((expect_object(spider, "default")?, true));
    }
    if let Some(spider) = default.as_object() {
        return Ok((spider.clone(), false));
    }

    Ok((namespace.clone(), false))
}

fn expect_object(value: JsValue, export: &str) -> Result<JsObject, SpiderError> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| SpiderError::ModuleLoad(format!("export '{export}' did not produce an object")))
}

/// Whether `text` is a JSON object or array.
fn looks_like_json(text: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(text),
        Ok(serde_json::Value::Object(_) | serde_json::Value::Array(_))
    )
}
