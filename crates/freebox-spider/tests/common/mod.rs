// Shared helpers for spider host integration tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use freebox_relay::{Relay, RelayConfig};
use freebox_spider::{MemoryCache, Notifier, Site, SpiderConfig, SpiderError, SpiderLoader};
use parking_lot::Mutex;

/// Notifier that remembers what it was told.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub seen: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn last_error(&self) -> Option<String> {
        self.seen.lock().last().map(|(_, e)| e.clone())
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, site: &str, error: &SpiderError) {
        self.seen.lock().push((site.to_string(), error.to_string()));
    }
}

pub struct Harness {
    pub root: PathBuf,
    pub loader: Arc<SpiderLoader>,
    pub notifier: Arc<RecordingNotifier>,
    pub cache: Arc<MemoryCache>,
}

/// Loader rooted at `root`. Must be called inside a tokio runtime.
pub fn harness(root: &Path) -> Harness {
    harness_with_timeout(root, Duration::from_secs(10))
}

pub fn harness_with_timeout(root: &Path, call_timeout: Duration) -> Harness {
    let mut config = SpiderConfig::rooted_at(root);
    config.call_timeout = call_timeout;
    config.public_host = "10.1.1.1".to_string();
    let notifier = Arc::new(RecordingNotifier::default());
    let cache = Arc::new(MemoryCache::new());
    let relay = Relay::new(RelayConfig::default()).expect("relay needs a runtime");
    let loader = SpiderLoader::new(config, relay, cache.clone(), notifier.clone());
    Harness {
        root: root.to_path_buf(),
        loader: Arc::new(loader),
        notifier,
        cache,
    }
}

/// Contents of a script under `tests/fixtures`.
pub fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read_to_string(&path).expect("missing fixture")
}

/// Copy a fixture into `dir` and return its path.
pub fn install_fixture(dir: &Path, name: &str) -> PathBuf {
    std::fs::create_dir_all(dir).expect("failed to create fixture dir");
    let path = dir.join(name);
    std::fs::write(&path, fixture(name)).expect("failed to write fixture");
    path
}

/// Site served by the script at `path`.
pub fn script_site(key: &str, path: &Path, ext: &str) -> Site {
    Site {
        key: key.to_string(),
        api: format!("file://{}", path.display()),
        ext: ext.to_string(),
        jar: String::new(),
    }
}

/// Build the native spider under `tests/native_fixture` once per test
/// binary and return the path of the shared library.
pub fn native_fixture() -> PathBuf {
    static BUILT: OnceLock<PathBuf> = OnceLock::new();
    BUILT
        .get_or_init(|| {
            let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/native_fixture/Cargo.toml");
            let target_dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("native_fixture");
            let output = Command::new(env!("CARGO"))
                .args(["build", "--quiet", "--manifest-path"])
                .arg(&manifest)
                .arg("--target-dir")
                .arg(&target_dir)
                .output()
                .expect("failed to run cargo");
            assert!(
                output.status.success(),
                "native fixture build failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            target_dir.join("debug").join(format!(
                "{}freebox_native_fixture{}",
                std::env::consts::DLL_PREFIX,
                std::env::consts::DLL_SUFFIX
            ))
        })
        .clone()
}

/// Site served by native spider `name` from the library at `path`.
pub fn native_site(key: &str, name: &str, path: &Path, ext: &str) -> Site {
    Site {
        key: key.to_string(),
        api: format!("csp_{name}"),
        ext: ext.to_string(),
        jar: format!("file://{}", path.display()),
    }
}
