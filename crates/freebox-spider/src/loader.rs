//! Spider loader: resolves descriptors into loaded, initialized plugins.
//!
//! Two keyed registries back the loader. Modules (a loaded native library
//! or a script's source) are keyed by artifact key, the md5 of the resolved
//! location. Instances are keyed by artifact key plus site key, so several
//! sites served by one artifact share its module but get their own
//! instance. Both registries hold a [`OnceCell`] per key, which makes
//! concurrent first use of a key load it exactly once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use freebox_relay::Relay;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::cache::KeyValueCache;
use crate::config::SpiderConfig;
use crate::descriptor::{md5_hex, resolve_reference, Descriptor, Location, HASH_SEPARATOR};
use crate::error::SpiderError;
use crate::native::{self, NativeModule};
use crate::notify::Notifier;
use crate::script::{ScriptSource, ScriptSpider};
use crate::spider::{Spider, SpiderInstance};

/// Prefix of native spider names in site configs.
const NATIVE_NAME_PREFIX: &str = "csp_";

// ─── Site ───────────────────────────────────────────────────────────────

/// One content source as listed in a source config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub key: String,
    /// Script descriptor for script sites, spider name for native ones.
    pub api: String,
    #[serde(default)]
    pub ext: String,
    /// Native artifact descriptor.
    #[serde(default)]
    pub jar: String,
}

impl Site {
    /// Script sites name a `.js` artifact in `api`, hash suffix aside.
    pub fn is_script(&self) -> bool {
        let location = match self.api.split_once(HASH_SEPARATOR) {
            Some((location, _)) => location,
            None => &self.api,
        };
        location.trim().ends_with(".js")
    }

    /// Descriptor of the artifact serving this site.
    pub fn descriptor(&self) -> &str {
        if self.is_script() {
            &self.api
        } else {
            &self.jar
        }
    }

    /// Name a native module exports this site's spider under.
    pub fn native_name(&self) -> &str {
        self.api
            .strip_prefix(NATIVE_NAME_PREFIX)
            .unwrap_or(&self.api)
    }
}

// ─── Registry entries ───────────────────────────────────────────────────

/// A descriptor with its location made absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// md5 of `location`.
    pub key: String,
    pub location: String,
    pub declared_hash: Option<String>,
}

impl ResolvedArtifact {
    /// Whether the declared hash names this location, i.e. the artifact
    /// may be taken from the cache without touching the network.
    pub fn hash_matches(&self) -> bool {
        self.declared_hash.as_deref() == Some(self.key.as_str())
    }
}

/// One loading unit.
#[derive(Debug)]
enum LoadedModule {
    Native(Arc<NativeModule>),
    Script(Arc<ScriptSource>),
}

impl LoadedModule {
    fn kind(&self) -> &'static str {
        match self {
            Self::Native(_) => "native",
            Self::Script(_) => "script",
        }
    }
}

/// The most recently resolved plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSelection {
    pub artifact_key: String,
    pub site_key: String,
}

impl ActiveSelection {
    fn instance_key(&self) -> String {
        instance_key(&self.artifact_key, &self.site_key)
    }
}

/// Proxy target behind the active selection.
#[derive(Debug, Clone)]
pub enum ActivePlugin {
    /// Native artifacts proxy through their module-level entry point.
    Native(Arc<NativeModule>),
    Script(Arc<SpiderInstance>),
}

fn instance_key(artifact_key: &str, site_key: &str) -> String {
    format!("{artifact_key}{site_key}")
}

type Cells<T> = Mutex<HashMap<String, Arc<OnceCell<T>>>>;

fn cell<T>(cells: &Cells<T>, key: &str) -> Arc<OnceCell<T>> {
    Arc::clone(cells.lock().entry(key.to_string()).or_default())
}

// ─── Loader ─────────────────────────────────────────────────────────────

/// Owns every loaded module and spider instance until [`destroy`](Self::destroy).
pub struct SpiderLoader {
    config: Arc<SpiderConfig>,
    relay: Relay,
    cache: Arc<dyn KeyValueCache>,
    notifier: Arc<dyn Notifier>,
    /// Base URL relative descriptors resolve against.
    api_url: RwLock<Option<String>>,
    modules: Cells<Arc<LoadedModule>>,
    spiders: Cells<Arc<SpiderInstance>>,
    recent: RwLock<Option<ActiveSelection>>,
}

impl SpiderLoader {
    pub fn new(
        config: SpiderConfig,
        relay: Relay,
        cache: Arc<dyn KeyValueCache>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            relay,
            cache,
            notifier,
            api_url: RwLock::new(None),
            modules: Mutex::new(HashMap::new()),
            spiders: Mutex::new(HashMap::new()),
            recent: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &SpiderConfig {
        &self.config
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn set_api_url(&self, url: impl Into<String>) {
        *self.api_url.write() = Some(url.into());
    }

    pub fn api_url(&self) -> Option<String> {
        self.api_url.read().clone()
    }

    pub fn active_selection(&self) -> Option<ActiveSelection> {
        self.recent.read().clone()
    }

    /// Number of loaded modules.
    pub fn module_count(&self) -> usize {
        self.modules
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Number of live spider instances.
    pub fn spider_count(&self) -> usize {
        self.spiders
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Make a descriptor's location absolute and derive its artifact key.
    pub fn resolve(&self, raw: &str) -> Result<ResolvedArtifact, SpiderError> {
        let descriptor = Descriptor::parse(raw)?;
        let location = match descriptor.kind() {
            Location::Relative(reference) => {
                let base = self.api_url().ok_or_else(|| {
                    SpiderError::DescriptorResolution(format!(
                        "'{reference}' is relative but no base url is set"
                    ))
                })?;
                resolve_reference(&base, &reference)?
            }
            _ => descriptor.location,
        };
        Ok(ResolvedArtifact {
            key: md5_hex(&location),
            location,
            declared_hash: descriptor.declared_hash,
        })
    }

    /// The spider serving `site`, loading and initializing it on first use.
    ///
    /// Never fails: load-time errors go to the notifier, run-time ones only
    /// to the log, and the caller gets an inert empty spider.
    pub async fn get_spider(&self, site: &Site) -> Arc<SpiderInstance> {
        match self.try_get_spider(site).await {
            Ok(spider) => spider,
            Err(e) if e.is_user_visible() => {
                self.notifier.notify(&site.key, &e);
                Arc::new(SpiderInstance::empty())
            }
            Err(e) => {
                tracing::warn!(site = %site.key, "spider unavailable: {e}");
                Arc::new(SpiderInstance::empty())
            }
        }
    }

    /// Like [`get_spider`](Self::get_spider), but surfacing the failure.
    pub async fn try_get_spider(&self, site: &Site) -> Result<Arc<SpiderInstance>, SpiderError> {
        let artifact = self.resolve(site.descriptor())?;
        let slot = cell(&self.spiders, &instance_key(&artifact.key, &site.key));
        let spider = slot
            .get_or_try_init(|| self.create_spider(site, &artifact))
            .await?
            .clone();

        *self.recent.write() = Some(ActiveSelection {
            artifact_key: artifact.key,
            site_key: site.key.clone(),
        });
        Ok(spider)
    }

    async fn create_spider(
        &self,
        site: &Site,
        artifact: &ResolvedArtifact,
    ) -> Result<Arc<SpiderInstance>, SpiderError> {
        let module = self.load_module(artifact, site.is_script()).await?;
        let spider = match module.as_ref() {
            LoadedModule::Script(source) => SpiderInstance::Script(
                ScriptSpider::start(
                    &site.key,
                    Arc::clone(source),
                    Arc::clone(&self.config),
                    self.relay.clone(),
                    Arc::clone(&self.cache),
                )
                .await?,
            ),
            LoadedModule::Native(module) => {
                SpiderInstance::Native(native::create_spider(module, site.native_name())?)
            }
        };
        if let Err(e) = spider.init(&site.ext).await {
            spider.destroy().await;
            return Err(e);
        }

        tracing::info!(
            site = %site.key,
            artifact = %artifact.key,
            kind = spider.kind(),
            "spider ready"
        );
        Ok(Arc::new(spider))
    }

    async fn load_module(
        &self,
        artifact: &ResolvedArtifact,
        script: bool,
    ) -> Result<Arc<LoadedModule>, SpiderError> {
        let slot = cell(&self.modules, &artifact.key);
        let module = slot
            .get_or_try_init(|| async {
                let path = self.fetch_artifact(artifact).await?;
                let module = if script {
                    LoadedModule::Script(Arc::new(ScriptSource::read(&path).await?))
                } else {
                    let open_path = path.clone();
                    let module = tokio::task::spawn_blocking(move || NativeModule::open(&open_path))
                        .await
                        .map_err(|e| SpiderError::ModuleLoad(format!("loader panicked: {e}")))??;
                    LoadedModule::Native(Arc::new(module))
                };
                tracing::info!(
                    artifact = %artifact.key,
                    path = %path.display(),
                    kind = module.kind(),
                    "module loaded"
                );
                Ok::<_, SpiderError>(Arc::new(module))
            })
            .await?;
        Ok(Arc::clone(module))
    }

    /// Local path of an artifact, downloading it if needed.
    async fn fetch_artifact(&self, artifact: &ResolvedArtifact) -> Result<PathBuf, SpiderError> {
        let cached = self.config.cache_dir.join(&artifact.key);
        if artifact.hash_matches() && tokio::fs::try_exists(&cached).await.unwrap_or(false) {
            tracing::debug!(artifact = %artifact.key, "artifact cache hit");
            return Ok(cached);
        }

        match Location::classify(&artifact.location) {
            Location::File(path) => Ok(path),
            Location::Asset(path) => Ok(self.config.assets_dir.join(path)),
            Location::Http(url) => {
                tracing::info!(url = %url, artifact = %artifact.key, "downloading artifact");
                let bytes = self
                    .relay
                    .download(&url)
                    .await
                    .map_err(|e| SpiderError::ArtifactDownload(format!("{url}: {e}")))?;
                tokio::fs::create_dir_all(&self.config.cache_dir).await?;
                tokio::fs::write(&cached, &bytes).await?;
                Ok(cached)
            }
            Location::Relative(reference) => Err(SpiderError::DescriptorResolution(format!(
                "'{reference}' did not resolve to an absolute location"
            ))),
        }
    }

    /// Proxy target for the most recently resolved plugin.
    pub fn active(&self) -> Option<ActivePlugin> {
        let selection = self.active_selection()?;
        let module = self
            .modules
            .lock()
            .get(&selection.artifact_key)
            .and_then(|cell| cell.get().cloned())?;
        match module.as_ref() {
            LoadedModule::Native(module) => Some(ActivePlugin::Native(Arc::clone(module))),
            LoadedModule::Script(_) => self
                .spiders
                .lock()
                .get(&selection.instance_key())
                .and_then(|cell| cell.get().cloned())
                .map(ActivePlugin::Script),
        }
    }

    /// Tear down every instance and module, stop delivering async relay
    /// callbacks, then empty the artifact cache.
    pub async fn destroy(&self) {
        let spiders: Vec<Arc<SpiderInstance>> = self
            .spiders
            .lock()
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect();
        let spider_count = spiders.len();
        for spider in spiders {
            spider.destroy().await;
        }
        let module_count = self.modules.lock().drain().count();
        *self.recent.write() = None;
        self.relay.pool().shutdown();

        let dir = &self.config.cache_dir;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %dir.display(), "clearing artifact cache failed: {e}"),
        }
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            tracing::warn!(path = %dir.display(), "recreating artifact cache failed: {e}");
        }

        tracing::info!(spiders = spider_count, modules = module_count, "spider registry torn down");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
