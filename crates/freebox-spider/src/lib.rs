//! Freebox spider host
//!
//! Loads content-provider plugins ("spiders"), either native shared
//! libraries or JS scripts run in an embedded engine, and serves them
//! behind one capability contract ([`Spider`]). Plugins are located by
//! descriptor strings, downloaded into a hash-addressed cache, loaded once
//! per artifact and instantiated once per site. Capability and proxy calls
//! never fail past [`SpiderDispatcher`]; broken plugins degrade to empty
//! results.

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod native;
pub mod notify;
pub mod script;
pub mod spider;

pub use cache::{DiskCache, KeyValueCache, MemoryCache};
pub use config::SpiderConfig;
pub use descriptor::{md5_hex, Descriptor, Location};
pub use dispatch::SpiderDispatcher;
pub use error::SpiderError;
pub use loader::{ActivePlugin, ActiveSelection, ResolvedArtifact, Site, SpiderLoader};
pub use notify::{LogNotifier, Notifier};
pub use script::ScriptSpider;
pub use spider::{EmptySpider, ProxyReply, ProxyResponse, Spider, SpiderInstance};
