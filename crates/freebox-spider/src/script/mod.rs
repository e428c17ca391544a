//! Script plugins: guest JS evaluated in an embedded engine.
//!
//! Each plugin instance owns one context on one dedicated worker thread
//! ([`worker`]). The context is seeded with the host API ([`host_api`]),
//! guest values cross the boundary through [`bridge`], and guest promises
//! are awaited through [`promise`].

mod bridge;
pub mod crypto;
mod engine;
mod host_api;
mod promise;
mod spider;
mod worker;
pub mod zh;

use std::path::{Path, PathBuf};

pub use spider::ScriptSpider;

use crate::error::SpiderError;

/// Script text of one artifact, shared by every instance built from it.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    pub name: String,
    pub path: PathBuf,
    pub code: String,
}

impl ScriptSource {
    pub async fn read(path: &Path) -> Result<Self, SpiderError> {
        let code = tokio::fs::read_to_string(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            path: path.to_path_buf(),
            code,
        })
    }
}
