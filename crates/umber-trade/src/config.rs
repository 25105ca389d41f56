//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the trade engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeConfig {
    /// Base URL of the coordinating authority's API.
    pub coordinator_url: String,
    /// Transaction polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive poll failures after which the poller gives up.
    pub poll_max_failures: u32,
    /// Timeout for individual coordinator requests in milliseconds.
    pub request_timeout_ms: u64,
    /// Maximum number of concurrent network-bound transmissions.
    pub max_transmissions: usize,
}

fn default_coordinator_url() -> String {
    "https://market.umber.example/api".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_poll_max_failures() -> u32 {
    8
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_transmissions() -> usize {
    4
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            coordinator_url: default_coordinator_url(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_max_failures: default_poll_max_failures(),
            request_timeout_ms: default_request_timeout_ms(),
            max_transmissions: default_max_transmissions(),
        }
    }
}
