use std::time::Duration;

use serde::{Deserialize, Serialize};

const PLACEHOLDER_MARKERS: &[&str] = &["placeholder", "your-", "changeme", "example.com", "<"];

/// Where the remote store lives and how to authenticate to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
        }
    }

    /// False when the URL is missing, has an unsupported scheme, or either
    /// value still looks like a template placeholder.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        let url = self.url.trim();
        if url.is_empty() || looks_like_placeholder(url) {
            return false;
        }
        let scheme_ok = ["http://", "https://", "sqlite://"]
            .iter()
            .any(|scheme| url.len() > scheme.len() && url.starts_with(scheme));
        if !scheme_ok {
            return false;
        }
        match &self.api_key {
            Some(key) => !key.trim().is_empty() && !looks_like_placeholder(key),
            None => true,
        }
    }
}

fn looks_like_placeholder(value: &str) -> bool {
    let lower = value.to_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
}

/// Timeouts and window sizes for the sync layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub lookback_days: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            lookback_days: 7,
        }
    }
}
