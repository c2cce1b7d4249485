//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the transfer engine. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the orchestrator tick and the meter recompute
    pub tick_interval_ms: u64,
    /// Trailing window of the throughput meter
    pub meter_window_ms: u64,
    /// How often a worker re-reads the transfer status
    pub status_poll_ms: u64,
    /// How often a worker persists its progress
    pub progress_persist_ms: u64,
    /// Size of the slices a worker writes and checks between
    pub chunk_size: usize,
    /// Worker pool size. `None` scales to available parallelism (at least 2).
    pub worker_pool_size: Option<usize>,
    pub connect_timeout_ms: u64,
    /// Upper bound on a whole segment request, body included. 0 disables.
    pub request_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            meter_window_ms: 3000,
            status_poll_ms: 500,
            progress_persist_ms: 300,
            chunk_size: 64 * 1024,
            worker_pool_size: None,
            connect_timeout_ms: 15_000,
            request_timeout_ms: 0,
            probe_timeout_ms: 20_000,
            user_agent: concat!("rangedl/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }

    pub fn progress_persist(&self) -> Duration {
        Duration::from_millis(self.progress_persist_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Effective worker pool size
    pub fn pool_size(&self) -> usize {
        self.worker_pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        })
        .max(2)
    }

    /// Shared HTTP client for probes and workers
    pub fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        if self.request_timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(self.request_timeout_ms));
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_never_smaller_than_two() {
        let config = EngineConfig {
            worker_pool_size: Some(1),
            ..EngineConfig::default()
        };
        assert_eq!(config.pool_size(), 2);
        assert!(EngineConfig::default().pool_size() >= 2);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "tick_interval_ms": 250 }"#).unwrap();
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.meter_window_ms, 3000);
        assert_eq!(config.chunk_size, 64 * 1024);
    }
}
