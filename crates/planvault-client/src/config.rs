use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Client sync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Base URL of the planvault server
    pub server_url: String,
    /// Quiet period after the last local edit before a sync fires
    pub debounce_ms: u64,
    /// Interval of the background workspace sync
    pub auto_sync_interval_ms: u64,
    /// Interval of the background shared-table sync
    pub shared_sync_interval_ms: u64,
    /// Per-request HTTP timeout
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".to_string(),
            debounce_ms: 3_000,
            auto_sync_interval_ms: 60_000,
            shared_sync_interval_ms: 60_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `PLANVAULT_*` environment variables, falling
    /// back to defaults for anything unset or unparsable
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: std::env::var("PLANVAULT_SERVER_URL").unwrap_or(defaults.server_url),
            debounce_ms: env_millis("PLANVAULT_DEBOUNCE_MS", defaults.debounce_ms),
            auto_sync_interval_ms: env_millis(
                "PLANVAULT_AUTO_SYNC_MS",
                defaults.auto_sync_interval_ms,
            ),
            shared_sync_interval_ms: env_millis(
                "PLANVAULT_SHARED_SYNC_MS",
                defaults.shared_sync_interval_ms,
            ),
            request_timeout_ms: env_millis(
                "PLANVAULT_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            ),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_millis(self.auto_sync_interval_ms)
    }

    pub fn shared_sync_interval(&self) -> Duration {
        Duration::from_millis(self.shared_sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn env_millis(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
