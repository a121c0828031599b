//! Configuration for the partition resource manager
//!
//! All durations are plain millisecond/second integers so the struct
//! deserializes directly from the broker's TOML config sections.

use crate::error::{Result, StmError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default max wait for leader sync on an admission path (ms)
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 10_000;

/// Default grace added to the producer-declared transaction timeout before
/// auto-abort kicks in (ms)
pub const DEFAULT_TX_TIMEOUT_DELAY_MS: u64 = 1_000;

/// Default minimum period of the expiration timer (ms)
pub const DEFAULT_ABORT_INTERVAL_MS: u64 = 60_000;

/// Default number of aborted ranges held in memory before the oldest chunk
/// is offloaded to an abort segment file
pub const DEFAULT_ABORT_INDEX_SEGMENT_SIZE: usize = 50_000;

/// Default cadence of the transaction stats log line (s)
pub const DEFAULT_LOG_STATS_INTERVAL_S: u64 = 30;

/// Configuration for one partition's resource manager state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmConfig {
    /// Max wait for leader sync on admission (ms).
    /// Default: 10000
    pub sync_timeout_ms: u64,
    /// Grace period added to the producer-declared timeout before a
    /// transaction is auto-aborted (ms).
    /// Default: 1000
    pub tx_timeout_delay_ms: u64,
    /// Minimum period of the expiration timer (ms).
    /// Default: 60000
    pub abort_interval_ms: u64,
    /// Rollover threshold for the in-memory aborted-range list.
    /// Default: 50000
    pub abort_index_segment_size: usize,
    /// Cadence of the stats log line (s). 0 disables it.
    /// Default: 30
    pub log_stats_interval_s: u64,
    /// Whether the expiration scheduler aborts timed-out transactions.
    /// Disabled only by tests.
    /// Default: true
    pub is_autoabort_enabled: bool,
    /// Directory holding the local STM snapshot and abort segment files.
    pub data_dir: PathBuf,
}

impl Default for RmConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            tx_timeout_delay_ms: DEFAULT_TX_TIMEOUT_DELAY_MS,
            abort_interval_ms: DEFAULT_ABORT_INTERVAL_MS,
            abort_index_segment_size: DEFAULT_ABORT_INDEX_SEGMENT_SIZE,
            log_stats_interval_s: DEFAULT_LOG_STATS_INTERVAL_S,
            is_autoabort_enabled: true,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl RmConfig {
    /// Validate configuration values, returning the first violation found
    pub fn validate(&self) -> Result<()> {
        if self.sync_timeout_ms == 0 {
            return Err(StmError::InvalidRequest(
                "sync_timeout_ms must be positive".to_string(),
            ));
        }
        if self.abort_interval_ms == 0 {
            return Err(StmError::InvalidRequest(
                "abort_interval_ms must be positive".to_string(),
            ));
        }
        if self.abort_index_segment_size == 0 {
            return Err(StmError::InvalidRequest(
                "abort_index_segment_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn tx_timeout_delay(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_delay_ms)
    }

    pub fn abort_interval(&self) -> Duration {
        Duration::from_millis(self.abort_interval_ms)
    }
}
