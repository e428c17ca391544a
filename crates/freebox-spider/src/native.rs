//! Native-code plugins loaded from shared libraries.
//!
//! A native artifact exports a small C ABI. Strings cross as NUL-terminated
//! UTF-8; structured arguments and results as JSON text. Every string the
//! library returns is handed back through `spider_free_string`.
//!
//! | symbol               | signature                                             |
//! |----------------------|-------------------------------------------------------|
//! | `spider_init`        | `fn() -> i32` (0 on success)                          |
//! | `spider_proxy`       | `fn(params_json) -> *mut c_char`                      |
//! | `spider_create`      | `fn(name) -> *mut c_void`                             |
//! | `spider_call`        | `fn(handle, method, args_json) -> *mut c_char`        |
//! | `spider_free_string` | `fn(*mut c_char)`                                     |
//! | `spider_destroy`     | `fn(handle)`                                          |

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use libloading::Library;
use serde_json::{json, Value};

use crate::error::SpiderError;
use crate::spider::{ProxyResponse, Spider};

// ─── Artifact validation ────────────────────────────────────────────────

const ELF_MAGIC: &[u8] = b"\x7fELF";
const PE_MAGIC: &[u8] = b"MZ";
const MACHO_MAGICS: &[[u8; 4]] = &[
    [0xfe, 0xed, 0xfa, 0xce],
    [0xfe, 0xed, 0xfa, 0xcf],
    [0xce, 0xfa, 0xed, 0xfe],
    [0xcf, 0xfa, 0xed, 0xfe],
    [0xca, 0xfe, 0xba, 0xbe],
];
const DEX_MAGIC: &[u8] = b"dex\n";
const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";

/// Reject artifacts built for another platform before handing them to the
/// dynamic loader: Android dex bytecode, and archives carrying dex entries.
pub fn validate_native_artifact(bytes: &[u8]) -> Result<(), SpiderError> {
    if bytes.starts_with(DEX_MAGIC) {
        return Err(SpiderError::ArtifactValidation(
            "artifact is dex bytecode".to_string(),
        ));
    }
    if bytes.starts_with(ZIP_LOCAL_HEADER) {
        if let Some(entry) = zip_entry_names(bytes)?
            .into_iter()
            .find(|name| name.ends_with(".dex"))
        {
            return Err(SpiderError::ArtifactValidation(format!(
                "archive embeds dex entry '{entry}'"
            )));
        }
        return Err(SpiderError::ArtifactValidation(
            "archive is not a native library".to_string(),
        ));
    }
    let is_native = bytes.starts_with(ELF_MAGIC)
        || bytes.starts_with(PE_MAGIC)
        || MACHO_MAGICS.iter().any(|m| bytes.starts_with(m));
    if !is_native {
        return Err(SpiderError::ArtifactValidation(
            "unrecognized artifact format".to_string(),
        ));
    }
    Ok(())
}

/// Entry names listed in an archive's central directory.
fn zip_entry_names(bytes: &[u8]) -> Result<Vec<String>, SpiderError> {
    let archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| SpiderError::ArtifactValidation(format!("corrupt archive: {e}")))?;
    Ok(archive.file_names().map(str::to_string).collect())
}

// ─── Module ─────────────────────────────────────────────────────────────

type InitFn = unsafe extern "C" fn() -> i32;
type ProxyFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
type CreateFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type CallFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> *mut c_char;
type FreeStringFn = unsafe extern "C" fn(*mut c_char);
type DestroyFn = unsafe extern "C" fn(*mut c_void);

#[derive(Clone, Copy)]
struct Exports {
    proxy: ProxyFn,
    create: CreateFn,
    call: CallFn,
    free_string: FreeStringFn,
    destroy: DestroyFn,
}

/// One loaded shared library. Its exports stay valid for as long as the
/// module is alive; instances hold an `Arc` to it.
pub struct NativeModule {
    name: String,
    exports: Exports,
    _library: Library,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T, SpiderError> {
    // SAFETY: the caller names the ABI type documented for this symbol.
    let sym = unsafe { library.get::<T>(name) }.map_err(|e| {
        SpiderError::ModuleLoad(format!(
            "missing export {}: {e}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ))
    })?;
    Ok(*sym)
}

fn c_string(text: &str) -> Result<CString, SpiderError> {
    CString::new(text)
        .map_err(|_| SpiderError::InvocationFailure("argument contains a NUL byte".to_string()))
}

impl NativeModule {
    /// Validate, load and initialize a native artifact.
    pub fn open(path: &Path) -> Result<Self, SpiderError> {
        let bytes = std::fs::read(path)?;
        validate_native_artifact(&bytes)?;

        // SAFETY: loading a library runs its initializers; the artifact
        // passed validation and is trusted plugin code.
        let library = unsafe { Library::new(path) }
            .map_err(|e| SpiderError::ModuleLoad(format!("{}: {e}", path.display())))?;

        let init: InitFn = symbol(&library, b"spider_init\0")?;
        let exports = Exports {
            proxy: symbol(&library, b"spider_proxy\0")?,
            create: symbol(&library, b"spider_create\0")?,
            call: symbol(&library, b"spider_call\0")?,
            free_string: symbol(&library, b"spider_free_string\0")?,
            destroy: symbol(&library, b"spider_destroy\0")?,
        };

        // SAFETY: `init` comes from the library loaded above, which is kept
        // alive by the returned module.
        let status = unsafe { init() };
        if status != 0 {
            return Err(SpiderError::ModuleLoad(format!(
                "{}: spider_init returned {status}",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::info!(module = %name, "native module loaded");
        Ok(Self {
            name,
            exports,
            _library: library,
        })
    }

    /// Copy out and release a string returned by the library.
    fn take_string(&self, ptr: *mut c_char) -> String {
        if ptr.is_null() {
            return String::new();
        }
        // SAFETY: non-null results are NUL-terminated strings owned by the
        // library until released through `spider_free_string`.
        let text = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        // SAFETY: `ptr` was returned by this library and is released once.
        unsafe { (self.exports.free_string)(ptr) };
        text
    }

    /// Invoke the module-level proxy entry point.
    pub fn proxy(&self, params: &HashMap<String, String>) -> Result<ProxyResponse, SpiderError> {
        let params = c_string(&serde_json::to_string(params)?)?;
        // SAFETY: export of the live library; `params` outlives the call.
        let raw = unsafe { (self.exports.proxy)(params.as_ptr()) };
        let text = self.take_string(raw);
        if text.is_empty() {
            return Ok(ProxyResponse::Empty);
        }
        ProxyResponse::from_native_json(&text)
    }

    fn destroy(&self, handle: SpiderHandle) {
        // SAFETY: each handle is destroyed once, on registry teardown.
        unsafe { (self.exports.destroy)(handle.0) };
    }

    fn call(&self, handle: SpiderHandle, method: &str, args: &Value) -> Result<String, SpiderError> {
        let method = c_string(method)?;
        let args = c_string(&args.to_string())?;
        // SAFETY: `handle` came from `spider_create` of this library and has
        // not been destroyed; the C strings outlive the call.
        let raw = unsafe { (self.exports.call)(handle.0, method.as_ptr(), args.as_ptr()) };
        Ok(self.take_string(raw))
    }
}

/// Instantiate the spider exported under `name` from a loaded module.
pub fn create_spider(module: &Arc<NativeModule>, name: &str) -> Result<NativeSpider, SpiderError> {
    let c_name = c_string(name)?;
    // SAFETY: export of the live library; `c_name` outlives the call.
    let handle = unsafe { (module.exports.create)(c_name.as_ptr()) };
    if handle.is_null() {
        return Err(SpiderError::ModuleLoad(format!(
            "{}: no spider named '{name}'",
            module.name
        )));
    }
    Ok(NativeSpider {
        module: Arc::clone(module),
        handle: SpiderHandle(handle),
        name: name.to_string(),
        destroyed: AtomicBool::new(false),
    })
}

/// Run a module's proxy entry point off the async workers; any failure
/// yields [`ProxyResponse::Empty`].
pub async fn invoke_proxy(module: &Arc<NativeModule>, params: &HashMap<String, String>) -> ProxyResponse {
    let name = module.name.clone();
    let module = Arc::clone(module);
    let params = params.clone();
    match tokio::task::spawn_blocking(move || module.proxy(&params)).await {
        Ok(Ok(res)) => res,
        Ok(Err(e)) => {
            tracing::warn!(module = %name, "native proxy failed: {e}");
            ProxyResponse::Empty
        }
        Err(e) => {
            tracing::warn!(module = %name, "native proxy panicked: {e}");
            ProxyResponse::Empty
        }
    }
}

// ─── Spider ─────────────────────────────────────────────────────────────

/// Opaque instance pointer owned by the library.
#[derive(Clone, Copy)]
struct SpiderHandle(*mut c_void);

// SAFETY: native plugins are required to be stateless per call or
// internally thread-safe; the handle is only passed back to the library.
unsafe impl Send for SpiderHandle {}
// SAFETY: see above.
unsafe impl Sync for SpiderHandle {}

/// A spider instance living inside a native module. Calls after
/// [`destroy`](Spider::destroy) never reach the library.
pub struct NativeSpider {
    module: Arc<NativeModule>,
    handle: SpiderHandle,
    name: String,
    destroyed: AtomicBool,
}

impl NativeSpider {
    /// Run one ABI call off the async workers. `None` on any failure.
    async fn invoke(&self, method: &'static str, args: Value) -> Option<String> {
        if self.destroyed.load(Ordering::SeqCst) {
            tracing::warn!(spider = %self.name, function = %method, "native spider already destroyed");
            return None;
        }
        let module = Arc::clone(&self.module);
        let handle = self.handle;
        match tokio::task::spawn_blocking(move || module.call(handle, method, &args)).await {
            Ok(Ok(text)) => Some(text),
            Ok(Err(e)) => {
                tracing::warn!(spider = %self.name, function = %method, "native call failed: {e}");
                None
            }
            Err(e) => {
                tracing::warn!(spider = %self.name, function = %method, "native call panicked: {e}");
                None
            }
        }
    }

    async fn text(&self, method: &'static str, args: Value) -> String {
        self.invoke(method, args).await.unwrap_or_default()
    }

    async fn flag(&self, method: &'static str, args: Value) -> bool {
        self.invoke(method, args)
            .await
            .map(|t| t.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Spider for NativeSpider {
    async fn init(&self, extend: &str) -> Result<(), SpiderError> {
        let module = Arc::clone(&self.module);
        let handle = self.handle;
        let args = json!([extend]);
        tokio::task::spawn_blocking(move || module.call(handle, "init", &args))
            .await
            .map_err(|e| SpiderError::ModuleLoad(format!("init panicked: {e}")))??;
        Ok(())
    }

    async fn home_content(&self, filter: bool) -> String {
        self.text("homeContent", json!([filter])).await
    }

    async fn home_video_content(&self) -> String {
        self.text("homeVideoContent", json!([])).await
    }

    async fn category_content(
        &self,
        tid: &str,
        page: &str,
        filter: bool,
        extend: &HashMap<String, String>,
    ) -> String {
        self.text("categoryContent", json!([tid, page, filter, extend]))
            .await
    }

    async fn detail_content(&self, ids: &[String]) -> String {
        self.text("detailContent", json!([ids])).await
    }

    async fn search_content(&self, key: &str, quick: bool, page: Option<&str>) -> String {
        let args = match page {
            Some(page) => json!([key, quick, page]),
            None => json!([key, quick]),
        };
        self.text("searchContent", args).await
    }

    async fn player_content(&self, flag: &str, id: &str, vip_flags: &[String]) -> String {
        self.text("playerContent", json!([flag, id, vip_flags])).await
    }

    async fn manual_video_check(&self) -> bool {
        self.flag("manualVideoCheck", json!([])).await
    }

    async fn is_video_format(&self, url: &str) -> bool {
        self.flag("isVideoFormat", json!([url])).await
    }

    async fn proxy(&self, params: &HashMap<String, String>) -> ProxyResponse {
        invoke_proxy(&self.module, params).await
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let module = Arc::clone(&self.module);
        let handle = self.handle;
        let result = tokio::task::spawn_blocking(move || module.destroy(handle)).await;
        if let Err(e) = result {
            tracing::warn!(spider = %self.name, "native destroy panicked: {e}");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
