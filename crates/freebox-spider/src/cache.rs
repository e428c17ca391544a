//! Key/value cache behind the script `local` object.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::descriptor::md5_hex;

/// Key under which a script stores `key` for `rule` (usually its site key).
pub fn local_key(rule: &str, key: &str) -> String {
    if rule.is_empty() {
        format!("cache_{key}")
    } else {
        format!("cache_{rule}_{key}")
    }
}

/// Synchronous string cache. Calls arrive on script worker threads.
pub trait KeyValueCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn delete(&self, key: &str);
}

/// One file per key under a directory, file-named by md5 of the key.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(md5_hex(key))
    }
}

impl KeyValueCache for DiskCache {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path(key)).ok()
    }

    fn set(&self, key: &str, value: &str) {
        let write = std::fs::create_dir_all(&self.root)
            .and_then(|()| std::fs::write(self.path(key), value));
        if let Err(e) = write {
            tracing::warn!(key = %key, "cache write failed: {e}");
        }
    }

    fn delete(&self, key: &str) {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(key = %key, "cache delete failed: {e}"),
        }
    }
}

/// In-process cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_string(), value.to_string());
    }

    fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}
