//! User-facing notification of load-time failures.

use crate::error::SpiderError;

/// Receives failures the end user should hear about: bad descriptors,
/// failed downloads, rejected artifacts and modules that would not load.
/// Run-time capability failures never reach it.
pub trait Notifier: Send + Sync {
    fn notify(&self, site: &str, error: &SpiderError);
}

/// Default notifier: logs at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, site: &str, error: &SpiderError) {
        tracing::error!(site = %site, "spider load failed: {error}");
    }
}
