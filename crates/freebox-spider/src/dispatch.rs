//! Dispatch facade: capability calls routed to the plugin serving a site,
//! and proxy calls routed to the active plugin.
//!
//! Nothing here fails. Missing plugins and plugin faults come back as empty
//! strings, `false` or [`ProxyResponse::Empty`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::loader::{ActivePlugin, Site, SpiderLoader};
use crate::native;
use crate::spider::{ProxyResponse, Spider};

#[derive(Clone)]
pub struct SpiderDispatcher {
    loader: Arc<SpiderLoader>,
}

impl SpiderDispatcher {
    pub fn new(loader: Arc<SpiderLoader>) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &Arc<SpiderLoader> {
        &self.loader
    }

    /// Answer a proxy request through `callback`.
    ///
    /// The callback runs exactly once, with [`ProxyResponse::Empty`] when no
    /// plugin is active.
    pub async fn proxy<F>(&self, callback: F, params: &HashMap<String, String>)
    where
        F: FnOnce(ProxyResponse),
    {
        callback(self.proxy_response(params).await);
    }

    /// Proxy through the active plugin and return the normalized tuple.
    pub async fn proxy_response(&self, params: &HashMap<String, String>) -> ProxyResponse {
        match self.loader.active() {
            None => {
                tracing::warn!("proxy requested with no active spider");
                ProxyResponse::Empty
            }
            Some(ActivePlugin::Script(spider)) => spider.proxy(params).await,
            Some(ActivePlugin::Native(module)) => native::invoke_proxy(&module, params).await,
        }
    }

    pub async fn home(&self, site: &Site, filter: bool) -> String {
        self.loader.get_spider(site).await.home_content(filter).await
    }

    pub async fn home_video(&self, site: &Site) -> String {
        self.loader.get_spider(site).await.home_video_content().await
    }

    pub async fn category(
        &self,
        site: &Site,
        tid: &str,
        page: &str,
        filter: bool,
        extend: &HashMap<String, String>,
    ) -> String {
        self.loader
            .get_spider(site)
            .await
            .category_content(tid, page, filter, extend)
            .await
    }

    pub async fn detail(&self, site: &Site, ids: &[String]) -> String {
        self.loader.get_spider(site).await.detail_content(ids).await
    }

    pub async fn search(&self, site: &Site, key: &str, quick: bool, page: Option<&str>) -> String {
        self.loader
            .get_spider(site)
            .await
            .search_content(key, quick, page)
            .await
    }

    pub async fn play(&self, site: &Site, flag: &str, id: &str, vip_flags: &[String]) -> String {
        self.loader
            .get_spider(site)
            .await
            .player_content(flag, id, vip_flags)
            .await
    }

    pub async fn manual_video_check(&self, site: &Site) -> bool {
        self.loader.get_spider(site).await.manual_video_check().await
    }

    pub async fn is_video_format(&self, site: &Site, url: &str) -> bool {
        self.loader.get_spider(site).await.is_video_format(url).await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::SpiderConfig;
    use crate::notify::LogNotifier;
    use freebox_relay::{Relay, RelayConfig};

    fn dispatcher(root: &std::path::Path) -> SpiderDispatcher {
        let loader = SpiderLoader::new(
            SpiderConfig::rooted_at(root),
            Relay::new(RelayConfig::default()).unwrap(),
            Arc::new(MemoryCache::new()),
            Arc::new(LogNotifier),
        );
        SpiderDispatcher::new(Arc::new(loader))
    }

    #[tokio::test]
    async fn test_proxy_without_active_spider_is_empty() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let dispatcher = dispatcher(dir.path());
        let mut seen = None;
        dispatcher
            .proxy(|res| seen = Some(res), &HashMap::new())
            .await;
        assert_eq!(seen, Some(ProxyResponse::Empty));
        assert_eq!(seen.map(|res| res.len()), Some(0));
    }

    #[tokio::test]
    async fn test_capabilities_degrade_for_unloadable_site() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let dispatcher = dispatcher(dir.path());
        let site = Site {
            key: "missing".into(),
            api: format!("file://{}/nope.js", dir.path().display()),
            ..Site::default()
        };
        assert_eq!(dispatcher.home(&site, false).await, "");
        assert_eq!(dispatcher.detail(&site, &["1".to_string()]).await, "");
        assert!(!dispatcher.is_video_format(&site, "http://a/b.m3u8").await);
        assert!(dispatcher.loader().active().is_none());
    }
}
