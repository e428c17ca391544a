//! Spider host configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Bound on every wait for a script worker (context creation, capability
/// calls, teardown).
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;

/// Default port of the local proxy service plugins point their URLs at.
pub const DEFAULT_HTTP_PORT: u16 = 9978;

/// Configuration shared by the loader and every script context.
#[derive(Debug, Clone)]
pub struct SpiderConfig {
    /// Directory holding downloaded artifacts, one file per artifact key.
    pub cache_dir: PathBuf,
    /// Working directory scripts may import modules from.
    pub js_dir: PathBuf,
    /// Root that `assets://` descriptors resolve against.
    pub assets_dir: PathBuf,
    /// Root of the on-disk key/value cache behind the script `local` object.
    pub kv_dir: PathBuf,
    pub call_timeout: Duration,
    /// Port reported by `getPort()` and embedded in proxy URLs.
    pub http_port: u16,
    /// Host used by `getProxy(false)`, i.e. reachable from other devices.
    pub public_host: String,
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/spider/jar"),
            js_dir: PathBuf::from("data/spider/js"),
            assets_dir: PathBuf::from("assets"),
            kv_dir: PathBuf::from("data/spider/kv"),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            http_port: DEFAULT_HTTP_PORT,
            public_host: "127.0.0.1".to_string(),
        }
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(name).unwrap_or_else(|_| default.to_string()))
}

impl SpiderConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            cache_dir: env_path("SPIDER_CACHE_DIR", "data/spider/jar"),
            js_dir: env_path("SPIDER_JS_DIR", "data/spider/js"),
            assets_dir: env_path("SPIDER_ASSETS_DIR", "assets"),
            kv_dir: env_path("SPIDER_KV_DIR", "data/spider/kv"),
            call_timeout: Duration::from_secs(
                std::env::var("SPIDER_CALL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
            ),
            http_port: std::env::var("SPIDER_HTTP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HTTP_PORT),
            public_host: std::env::var("SPIDER_PUBLIC_HOST")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "127.0.0.1".to_string()),
        }
    }

    /// Config rooted entirely under `root`, used by tests and the CLI.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            cache_dir: root.join("jar"),
            js_dir: root.join("js"),
            assets_dir: root.join("assets"),
            kv_dir: root.join("kv"),
            ..Self::default()
        }
    }

    /// Base URL of the local proxy endpoint.
    pub fn proxy_url(&self, local: bool) -> String {
        let host = if local {
            "127.0.0.1"
        } else {
            self.public_host.as_str()
        };
        format!("http://{host}:{}/proxy?do=js", self.http_port)
    }
}
