//! The `Cluster` aggregate, its state machine, and the per-cluster
//! policy overrides.

mod engine;
mod naming;

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

pub use engine::{ClusterEngine, ClusterLocks, LifecycleError};
pub use naming::{generate_name, NameError};

/// CPU/memory/disk/network quotas. Each is positive; network may be
/// zero, meaning unthrottled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quotas {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub network_mbps: u64,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 512,
            disk_gb: 1,
            network_mbps: 0,
        }
    }
}

impl Quotas {
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.cpu_cores <= 0.0 {
            return Err(LifecycleError::InvalidQuota("cpu_cores must be positive"));
        }
        if self.memory_mb == 0 {
            return Err(LifecycleError::InvalidQuota("memory_mb must be positive"));
        }
        if self.disk_gb == 0 {
            return Err(LifecycleError::InvalidQuota("disk_gb must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Restarting,
    Deleting,
    Deleted,
}

impl ClusterState {
    /// Transient states accept no external operation.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ClusterState::Starting
                | ClusterState::Stopping
                | ClusterState::Restarting
                | ClusterState::Deleting
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ClusterState::Deleted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub cooldown: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        let defaults = crate::config::RecoveryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            retry_interval: defaults.retry_interval,
            cooldown: defaults.cooldown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackupPolicy {
    pub auto_backup_enabled: bool,
    pub interval_hours: u32,
    pub retention_days: u32,
    pub max_backups: u32,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        let defaults = crate::config::BackupDefaults::default();
        Self {
            auto_backup_enabled: defaults.enabled,
            interval_hours: defaults.interval_hours,
            retention_days: defaults.retention_days,
            max_backups: defaults.max_backups,
        }
    }
}

/// The root entity. Owned exclusively by [`ClusterEngine`] for lifecycle
/// fields; the health loop mutates only `state` and `restart_attempts`
/// on health-driven transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub template_name: String,
    pub owner_id: String,
    pub created_at_ms: u64,
    pub host_port: u16,
    pub workspace_path: PathBuf,
    pub container_id: Option<String>,
    pub quotas: Quotas,
    pub state: ClusterState,
    pub restart_attempts: u32,
    pub last_transition_ms: u64,
    pub recovery_policy: RecoveryPolicy,
    pub backup_policy: BackupPolicy,
}

impl Cluster {
    pub fn is_running(&self) -> bool {
        self.state == ClusterState::Running
    }
}
