//! Tunables loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or no file) is valid:
//!
//! ```toml
//! [backpressure]
//! soft_ceiling = 3000
//! hard_ceiling = 5000
//!
//! [worker]
//! max_retries = 5
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::db::PoolSizing;
use crate::error::{Error, Result};
use crate::gateway::GatewayConfig;
use crate::producer::BackpressureConfig;
use crate::retry::RetryPolicy;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backpressure: BackpressureSettings,
    pub worker: WorkerSettings,
    pub gateway: GatewaySettings,
    pub logs: LogSettings,
    pub pool: PoolSettings,
}

impl Settings {
    /// Parse settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }

    /// Parse settings from TOML text.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpressureSettings {
    pub soft_ceiling: u64,
    pub hard_ceiling: u64,
    pub shed_delay_ms: u64,
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            soft_ceiling: 3000,
            hard_ceiling: 5000,
            shed_delay_ms: 1000,
        }
    }
}

impl BackpressureSettings {
    pub fn config(&self) -> BackpressureConfig {
        BackpressureConfig {
            soft_ceiling: self.soft_ceiling,
            hard_ceiling: self.hard_ceiling,
            shed_delay: Duration::from_millis(self.shed_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub group: String,
    pub block_ms: u64,
    pub batch_size: usize,
    pub claim_idle_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            group: "workers".to_string(),
            block_ms: 5000,
            batch_size: 1,
            claim_idle_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl WorkerSettings {
    pub fn config(&self) -> WorkerConfig {
        WorkerConfig {
            group: self.group.clone(),
            block: Duration::from_millis(self.block_ms),
            batch_size: self.batch_size.max(1),
            claim_idle_after: Duration::from_millis(self.claim_idle_ms),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                delay: Duration::from_millis(self.retry_delay_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub idle_timeout_secs: u64,
    pub result_timeout_secs: u64,
    pub read_block_ms: u64,
    pub send_timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            result_timeout_secs: 120,
            read_block_ms: 5000,
            send_timeout_ms: 2000,
        }
    }
}

impl GatewaySettings {
    pub fn config(&self) -> GatewayConfig {
        GatewayConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            result_timeout: Duration::from_secs(self.result_timeout_secs),
            read_block: Duration::from_millis(self.read_block_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub jobs: String,
    pub results: String,
    pub dead_letters: String,
    /// Unset: the job queue is never trimmed automatically.
    pub jobs_max_len: Option<u64>,
    pub results_max_len: u64,
    pub dead_letters_max_len: u64,
    pub trim_interval_secs: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            jobs: "jobs".to_string(),
            results: "results".to_string(),
            dead_letters: "dead_letters".to_string(),
            jobs_max_len: None,
            results_max_len: 10_000,
            dead_letters_max_len: 100_000,
            trim_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub workers: u32,
    pub api_instances: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            api_instances: 1,
        }
    }
}

impl PoolSettings {
    pub fn sizing(&self) -> PoolSizing {
        PoolSizing {
            workers: self.workers,
            api_instances: self.api_instances,
            logs: 3,
        }
    }
}
