use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OspreyError, OspreyResult};

/// Replication section of the node configuration (`osprey.toml`,
/// `[replication]` table). Every field has a default so an absent section
/// yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Base jitter in milliseconds before claiming a dead node's queues.
    /// The actual sleep is uniform in `[base, 2*base)` to smear thundering
    /// herds when many nodes race for the same queues.
    #[serde(default = "default_sleep_before_failover_ms")]
    pub sleep_before_failover_ms: u64,

    /// Worker threads in the failover claim pool. One worker means dead
    /// nodes are failed over sequentially, which is the safe default.
    #[serde(default = "default_executor_workers")]
    pub executor_workers: usize,

    /// Base backoff in milliseconds between retries when deleting remote
    /// WAL files for a synchronous-replication peer.
    #[serde(default = "default_sync_sleep_for_retries_ms")]
    pub sync_sleep_for_retries_ms: u64,

    /// Cap on the backoff multiplier for remote WAL deletion retries.
    #[serde(default = "default_sync_max_retries_multiplier")]
    pub sync_max_retries_multiplier: u32,

    /// Whether bulk-loaded file references are replicated alongside WAL
    /// edits.
    #[serde(default)]
    pub bulkload_enabled: bool,

    /// Total bytes of batched edits all sources on this node may hold in
    /// memory while shipping.
    #[serde(default = "default_total_buffer_limit_bytes")]
    pub total_buffer_limit_bytes: u64,
}

fn default_sleep_before_failover_ms() -> u64 {
    30_000
}

fn default_executor_workers() -> usize {
    1
}

fn default_sync_sleep_for_retries_ms() -> u64 {
    1_000
}

fn default_sync_max_retries_multiplier() -> u32 {
    60
}

fn default_total_buffer_limit_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            sleep_before_failover_ms: default_sleep_before_failover_ms(),
            executor_workers: default_executor_workers(),
            sync_sleep_for_retries_ms: default_sync_sleep_for_retries_ms(),
            sync_max_retries_multiplier: default_sync_max_retries_multiplier(),
            bulkload_enabled: false,
            total_buffer_limit_bytes: default_total_buffer_limit_bytes(),
        }
    }
}

impl ReplicationConfig {
    pub fn sleep_before_failover(&self) -> Duration {
        Duration::from_millis(self.sleep_before_failover_ms)
    }

    pub fn sync_sleep_for_retries(&self) -> Duration {
        Duration::from_millis(self.sync_sleep_for_retries_ms)
    }

    /// Ensure the settings are coherent before wiring them into a manager.
    pub fn validate(&self) -> OspreyResult<()> {
        if self.executor_workers == 0 {
            return Err(OspreyError::Config(
                "replication.executor_workers must be at least 1".into(),
            ));
        }
        if self.total_buffer_limit_bytes == 0 {
            return Err(OspreyError::Config(
                "replication.total_buffer_limit_bytes must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> OspreyResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| OspreyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> OspreyResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
