use std::time::Duration;

use serde::{Deserialize, Serialize};

use ripc_protocol::{EndpointSelection, Result};

/// Verbosity of the engine's tracing output, per subsystem. `0` disables.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceLevels {
    pub retry: u8,
    pub locator: u8,
    pub network: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Delays in milliseconds between successive retries. A single negative
    /// value disables retries.
    pub retry_intervals: Vec<i64>,
    /// Locator cache TTL in seconds given to new references; `-1` caches forever,
    /// `0` disables the cache.
    pub default_locator_cache_timeout: i64,
    /// Serve stale locator cache rows while refreshing them in the background.
    pub background_locator_cache_updates: bool,
    pub cache_connection: bool,
    pub collocation_optimized: bool,
    pub prefer_secure: bool,
    pub endpoint_selection: EndpointSelection,
    /// Invocation timeout in milliseconds given to new references; `-1` is none.
    pub invocation_timeout_ms: i64,
    pub trace: TraceLevels,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            retry_intervals: vec![0],
            default_locator_cache_timeout: -1,
            background_locator_cache_updates: false,
            cache_connection: true,
            collocation_optimized: true,
            prefer_secure: false,
            endpoint_selection: EndpointSelection::Random,
            invocation_timeout_ms: -1,
            trace: TraceLevels::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        if self.retry_intervals.len() == 1 && self.retry_intervals[0] < 0 {
            return Vec::new();
        }
        self.retry_intervals
            .iter()
            .map(|ms| Duration::from_millis((*ms).max(0) as u64))
            .collect()
    }
}
