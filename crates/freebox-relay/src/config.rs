//! Relay configuration.

use std::time::Duration;

/// Default per-request timeout (10 s).
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default `User-Agent` sent when the caller does not supply one.
pub const DEFAULT_USER_AGENT: &str = "okhttp/4.12.0";

/// Shared base-client configuration. Per-call options in
/// [`RelayRequest`](crate::RelayRequest) are layered on top.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Timeout applied when a request does not carry its own.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl RelayConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            timeout: Duration::from_millis(
                std::env::var("RELAY_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_TIMEOUT_MS),
            ),
            user_agent: std::env::var("RELAY_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        }
    }
}
