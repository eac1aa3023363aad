//! Runtime driver: a thin wrapper over the container runtime.
//!
//! [`RuntimeDriver`] is a capability set, not a concrete type:
//! any type providing these operations is substitutable, which is how
//! tests run the whole lifecycle/health/metrics stack against an
//! in-memory fake instead of a real Docker daemon.

mod docker;
mod fake;

use std::collections::HashMap;

use async_trait::async_trait;

pub use docker::BollardRuntime;
pub use fake::FakeRuntime;

/// Bound on a single runtime call. Default 10s, `stats` 5s.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_STATS_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime call timed out")]
    RuntimeTimeout,
    #[error("container not found: {0}")]
    RuntimeNotFound(String),
    #[error("container runtime daemon unreachable: {0}")]
    RuntimeUnavailable(String),
    #[error("container runtime error (exit {exit_code:?}): {stderr_tail}")]
    RuntimeError {
        exit_code: Option<i64>,
        stderr_tail: String,
    },
}

impl RuntimeError {
    /// Whether a caller may usefully retry the call without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::RuntimeUnavailable(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvVars(pub HashMap<String, String>);

/// Host resource limits applied at container creation or reapplied live.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub network_mbps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRunState {
    Running,
    Exited,
    Paused,
    Absent,
}

#[derive(Debug, Clone)]
pub struct InspectResult {
    pub state: ContainerRunState,
    pub exit_code: Option<i64>,
    pub started_at: Option<String>,
    pub restart_count: u64,
    pub health_status: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsResult {
    pub cpu_usage_nanos: u64,
    pub cpu_system_nanos: u64,
    pub mem_usage_bytes: u64,
    pub mem_limit_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub blk_read_bytes: u64,
    pub blk_write_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// The driver's operation set, bounded wall-clock per call.
#[async_trait]
pub trait RuntimeDriver: Send + Sync + std::fmt::Debug {
    async fn run(
        &self,
        name: &str,
        image: &str,
        workspace_path: &std::path::Path,
        host_port: u16,
        container_port: u16,
        env_vars: &EnvVars,
        limits: ResourceLimits,
    ) -> Result<String, RuntimeError>;

    /// Restarts a previously-created, currently-stopped container (as
    /// opposed to [`RuntimeDriver::run`], which creates a fresh one).
    async fn start_existing(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, container_id: &str, grace_seconds: u32) -> Result<(), RuntimeError>;

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, container_id: &str) -> Result<InspectResult, RuntimeError>;

    async fn stats(&self, container_id: &str) -> Result<StatsResult, RuntimeError>;

    async fn update_limits(
        &self,
        container_id: &str,
        limits: ResourceLimits,
    ) -> Result<(), RuntimeError>;

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        timeout_seconds: u64,
    ) -> Result<ExecResult, RuntimeError>;

    /// Tail of the container's combined stdout/stderr, most recent last.
    async fn log_tail(&self, container_id: &str, lines: usize) -> Result<Vec<String>, RuntimeError>;
}
