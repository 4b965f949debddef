//! Configuration types for the metaserver
//!
//! Defaults match the constants the rest of the core assumes; the binary
//! overrides them from its command line.

use crate::types::LEASE_INTERVAL_SECS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for the metaserver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Directory for operation log files (`log.<seq>`).
    pub log_dir: PathBuf,
    /// Directory for checkpoint files (`<seq>` plus the `latest` pointer).
    pub cp_dir: PathBuf,
    /// Timer and placement knobs.
    pub timers: TimerConfig,
    /// Replication knobs.
    pub replication: ReplicationConfig,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./kfslog"),
            cp_dir: PathBuf::from("./kfscp"),
            timers: TimerConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

/// Periodic-work intervals, all in seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Upper bound between checkpoints when mutations are pending.
    pub cp_max_secs: u64,
    /// Lease-expiry sweep interval.
    pub lease_cleanup_secs: u64,
    /// Replication-checker pass interval.
    pub replication_check_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            cp_max_secs: 600,
            lease_cleanup_secs: LEASE_INTERVAL_SECS,
            replication_check_secs: 30,
        }
    }
}

/// Replication-checker knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Bound on in-flight REPLICATE RPCs per destination server.
    pub max_inflight_per_server: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_inflight_per_server: 4,
        }
    }
}
