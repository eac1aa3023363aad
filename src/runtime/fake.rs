//! In-memory [`RuntimeDriver`] used by the crate's own tests so the full
//! lifecycle/health/metrics stack is exercisable without a Docker daemon.

use std::{collections::HashMap, path::Path, sync::Mutex};

use async_trait::async_trait;

use super::{
    ContainerRunState, EnvVars, ExecResult, InspectResult, ResourceLimits, RuntimeDriver,
    RuntimeError, StatsResult,
};

#[derive(Debug, Clone)]
struct FakeContainer {
    state: ContainerRunState,
    exit_code: Option<i64>,
    restart_count: u64,
    limits: ResourceLimits,
    stats: StatsResult,
    log_tail: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: Mutex<u64>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: force a container into `Exited` with the given code, as
    /// if it crashed outside the control plane's knowledge.
    pub fn kill(&self, container_id: &str, exit_code: i64) {
        let mut containers = self.containers.lock().unwrap();
        if let Some(c) = containers.get_mut(container_id) {
            c.state = ContainerRunState::Exited;
            c.exit_code = Some(exit_code);
        }
    }

    pub fn set_stats(&self, container_id: &str, stats: StatsResult) {
        let mut containers = self.containers.lock().unwrap();
        if let Some(c) = containers.get_mut(container_id) {
            c.stats = stats;
        }
    }

    pub fn set_log_tail(&self, container_id: &str, lines: Vec<String>) {
        let mut containers = self.containers.lock().unwrap();
        if let Some(c) = containers.get_mut(container_id) {
            c.log_tail = lines;
        }
    }

    pub fn remove_from_behind(&self, container_id: &str) {
        self.containers.lock().unwrap().remove(container_id);
    }
}

#[async_trait]
impl RuntimeDriver for FakeRuntime {
    async fn run(
        &self,
        name: &str,
        _image: &str,
        _workspace_path: &Path,
        _host_port: u16,
        _container_port: u16,
        _env_vars: &EnvVars,
        limits: ResourceLimits,
    ) -> Result<String, RuntimeError> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let id = format!("fake-{name}-{next_id}");
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                state: ContainerRunState::Running,
                exit_code: None,
                restart_count: 0,
                limits,
                stats: StatsResult::default(),
                log_tail: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start_existing(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::RuntimeNotFound(container_id.to_string()))?;
        c.state = ContainerRunState::Running;
        c.exit_code = None;
        c.restart_count += 1;
        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace_seconds: u32) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::RuntimeNotFound(container_id.to_string()))?;
        c.state = ContainerRunState::Exited;
        c.exit_code = Some(0);
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .remove(container_id)
            .ok_or_else(|| RuntimeError::RuntimeNotFound(container_id.to_string()))?;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<InspectResult, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        let c = containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::RuntimeNotFound(container_id.to_string()))?;
        Ok(InspectResult {
            state: c.state,
            exit_code: c.exit_code,
            started_at: Some("1970-01-01T00:00:00Z".to_string()),
            restart_count: c.restart_count,
            health_status: None,
        })
    }

    async fn stats(&self, container_id: &str) -> Result<StatsResult, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        let c = containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::RuntimeNotFound(container_id.to_string()))?;
        Ok(c.stats)
    }

    async fn update_limits(
        &self,
        container_id: &str,
        limits: ResourceLimits,
    ) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::RuntimeNotFound(container_id.to_string()))?;
        c.limits = limits;
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        _timeout_seconds: u64,
    ) -> Result<ExecResult, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::RuntimeNotFound(container_id.to_string()))?;
        Ok(ExecResult {
            exit_code: 0,
            stdout: argv.join(" "),
            stderr: String::new(),
        })
    }

    async fn log_tail(&self, container_id: &str, lines: usize) -> Result<Vec<String>, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        let c = containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::RuntimeNotFound(container_id.to_string()))?;
        Ok(c.log_tail.iter().rev().take(lines).rev().cloned().collect())
    }
}
