//! Configuration for the structural master

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Node ID of the master
    pub node_id: String,

    /// Distinct acknowledgments needed to commit an operation
    #[serde(default = "default_quorum")]
    pub quorum: usize,

    /// Period of the per-operation timeout tick
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Ticks an operation may survive without quorum before it is abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Maximum wait for the configuration lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Lease after which a held lock is force-released
    #[serde(default = "default_lock_lease")]
    pub lock_lease_ms: u64,

    /// Entries read from the log per resend batch
    #[serde(default = "default_resend_batch_size")]
    pub resend_batch_size: usize,

    /// Attempts per entry before a resend is reported as failed
    #[serde(default = "default_resend_max_attempts")]
    pub resend_max_attempts: usize,

    /// Initial backoff between resend attempts (doubles each retry)
    #[serde(default = "default_resend_backoff")]
    pub resend_backoff_ms: u64,

    /// Operation log file (in-memory log when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,

    /// Operation log sync policy
    #[serde(default)]
    pub wal_sync_policy: WalSyncPolicy,

    /// Period of the background fsync under `WalSyncPolicy::Interval`
    #[serde(default = "default_wal_sync_interval")]
    pub wal_sync_interval_ms: u64,
}

fn default_quorum() -> usize {
    2
}
fn default_operation_timeout() -> u64 {
    1_000
}
fn default_max_retries() -> u32 {
    10
}
fn default_lock_timeout() -> u64 {
    30_000
}
fn default_lock_lease() -> u64 {
    60_000
}
fn default_resend_batch_size() -> usize {
    128
}
fn default_resend_max_attempts() -> usize {
    5
}
fn default_resend_backoff() -> u64 {
    50
}
fn default_wal_sync_interval() -> u64 {
    200
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            node_id: "master".to_string(),
            quorum: default_quorum(),
            operation_timeout_ms: default_operation_timeout(),
            max_retries: default_max_retries(),
            lock_timeout_ms: default_lock_timeout(),
            lock_lease_ms: default_lock_lease(),
            resend_batch_size: default_resend_batch_size(),
            resend_max_attempts: default_resend_max_attempts(),
            resend_backoff_ms: default_resend_backoff(),
            log_path: None,
            wal_sync_policy: WalSyncPolicy::default(),
            wal_sync_interval_ms: default_wal_sync_interval(),
        }
    }
}

impl MasterConfig {
    /// Load from an optional TOML file, then `STRUCTURAL_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        let conf: MasterConfig = builder
            .add_source(config::Environment::with_prefix("STRUCTURAL"))
            .build()?
            .try_deserialize()?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.quorum == 0 {
            return Err(Error::InvalidConfig("quorum must be at least 1".into()));
        }
        if self.operation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "operation_timeout_ms must be positive".into(),
            ));
        }
        // the configuration lock is held for the whole life of a proposal
        let proposal_budget = self
            .operation_timeout_ms
            .saturating_mul(u64::from(self.max_retries));
        if self.lock_lease_ms <= proposal_budget {
            return Err(Error::InvalidConfig(format!(
                "lock_lease_ms ({}) must exceed operation_timeout_ms * max_retries ({})",
                self.lock_lease_ms, proposal_budget
            )));
        }
        if self.wal_sync_policy == WalSyncPolicy::Interval && self.wal_sync_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "wal_sync_interval_ms must be positive".into(),
            ));
        }
        if self.resend_batch_size == 0 || self.resend_max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "resend batch size and attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn resend_backoff(&self) -> Duration {
        Duration::from_millis(self.resend_backoff_ms)
    }

    pub fn wal_sync_interval(&self) -> Duration {
        Duration::from_millis(self.wal_sync_interval_ms)
    }
}

/// When appended log records reach stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// fsync after every append
    #[default]
    Always,
    /// fsync periodically, every `wal_sync_interval_ms`
    Interval,
    /// Never fsync; the OS decides when written records hit the disk
    Never,
}
