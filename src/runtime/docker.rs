use std::{path::Path, time::Duration};

use async_trait::async_trait;
use bollard::{
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, ContainerUpdateBody, HostConfig, PortBinding},
    query_parameters::{
        CreateContainerOptionsBuilder, InspectContainerOptionsBuilder, LogsOptionsBuilder,
        RemoveContainerOptionsBuilder, StartContainerOptions, StatsOptionsBuilder,
        StopContainerOptionsBuilder,
    },
    Docker,
};
use futures::StreamExt;
use tokio::time::timeout;

use super::{
    ContainerRunState, EnvVars, ExecResult, InspectResult, ResourceLimits, RuntimeDriver,
    RuntimeError, StatsResult,
};

/// Wraps a `bollard::Docker` handle, converting its errors into the
/// runtime error taxonomy and bounding every call's wall-clock time — a
/// focused client narrowed to the operations the lifecycle engine needs.
pub struct BollardRuntime {
    docker: Docker,
    call_timeout: Duration,
    stats_timeout: Duration,
}

impl std::fmt::Debug for BollardRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BollardRuntime").finish_non_exhaustive()
    }
}

impl BollardRuntime {
    /// Connects using the same environment-driven resolution Docker's own
    /// CLI uses (`DOCKER_HOST`, TLS env vars), falling back to the local
    /// socket.
    pub fn connect(call_timeout: Duration, stats_timeout: Duration) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| RuntimeError::RuntimeUnavailable(err.to_string()))?;
        Ok(Self {
            docker,
            call_timeout,
            stats_timeout,
        })
    }

    async fn bounded<F, T>(&self, fut: F) -> Result<T, RuntimeError>
    where
        F: std::future::Future<Output = Result<T, BollardError>>,
    {
        match timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(RuntimeError::RuntimeTimeout),
        }
    }
}

fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::RuntimeNotFound(message),
        BollardError::HyperResponseError { .. } | BollardError::IOError { .. } => {
            RuntimeError::RuntimeUnavailable(err.to_string())
        }
        other => RuntimeError::RuntimeError {
            exit_code: None,
            stderr_tail: other.to_string(),
        },
    }
}

#[async_trait]
impl RuntimeDriver for BollardRuntime {
    async fn run(
        &self,
        name: &str,
        image: &str,
        workspace_path: &Path,
        host_port: u16,
        container_port: u16,
        env_vars: &EnvVars,
        limits: ResourceLimits,
    ) -> Result<String, RuntimeError> {
        let envs: Vec<String> = env_vars
            .0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let port_key = format!("{container_port}/tcp");
        let mut exposed_ports: std::collections::HashMap<String, std::collections::HashMap<(), ()>> =
            std::collections::HashMap::new();
        exposed_ports.insert(port_key.clone(), std::collections::HashMap::new());

        let mut port_bindings = std::collections::HashMap::new();
        port_bindings.insert(
            port_key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );

        let binds = vec![format!("{}:/workspace", workspace_path.display())];

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            nano_cpus: Some((limits.cpu_cores * 1_000_000_000.0) as i64),
            memory: Some((limits.memory_mb * 1024 * 1024) as i64),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(image.to_string()),
            env: Some(envs),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::new().name(name).build();

        let created = self
            .bounded(self.docker.create_container(Some(options), config))
            .await?;

        self.bounded(
            self.docker
                .start_container(&created.id, None::<StartContainerOptions>),
        )
        .await?;

        Ok(created.id)
    }

    async fn start_existing(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.bounded(
            self.docker
                .start_container(container_id, None::<StartContainerOptions>),
        )
        .await
    }

    async fn stop(&self, container_id: &str, grace_seconds: u32) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::new()
            .t(grace_seconds as i32)
            .build();
        self.bounded(self.docker.stop_container(container_id, Some(options)))
            .await
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).build();
        self.bounded(self.docker.remove_container(container_id, Some(options)))
            .await
    }

    async fn inspect(&self, container_id: &str) -> Result<InspectResult, RuntimeError> {
        let options = InspectContainerOptionsBuilder::new().size(false).build();
        let inspect = self
            .bounded(self.docker.inspect_container(container_id, Some(options)))
            .await?;

        let state = inspect.state.unwrap_or_default();
        let run_state = if state.running.unwrap_or(false) {
            ContainerRunState::Running
        } else if state.paused.unwrap_or(false) {
            ContainerRunState::Paused
        } else if state.status.is_some() {
            ContainerRunState::Exited
        } else {
            ContainerRunState::Absent
        };

        Ok(InspectResult {
            state: run_state,
            exit_code: state.exit_code,
            started_at: state.started_at,
            restart_count: inspect.restart_count.unwrap_or(0) as u64,
            health_status: state
                .health
                .and_then(|h| h.status)
                .map(|s| format!("{s:?}")),
        })
    }

    async fn stats(&self, container_id: &str) -> Result<StatsResult, RuntimeError> {
        let options = StatsOptionsBuilder::new()
            .stream(false)
            .one_shot(true)
            .build();

        let mut stream = self.docker.stats(container_id, Some(options));
        let first = timeout(self.stats_timeout, stream.next())
            .await
            .map_err(|_| RuntimeError::RuntimeTimeout)?
            .ok_or_else(|| RuntimeError::RuntimeNotFound(container_id.to_string()))?
            .map_err(classify)?;

        let cpu = first.cpu_stats.unwrap_or_default();
        let mem = first.memory_stats.unwrap_or_default();
        let networks = first.networks.unwrap_or_default();
        let (rx, tx) = networks
            .values()
            .fold((0u64, 0u64), |(rx, tx), net| {
                (rx + net.rx_bytes.unwrap_or(0), tx + net.tx_bytes.unwrap_or(0))
            });
        let blkio = first
            .blkio_stats
            .and_then(|b| b.io_service_bytes_recursive)
            .unwrap_or_default();
        let (read, write) = blkio.iter().fold((0u64, 0u64), |(r, w), entry| {
            match entry.op.as_deref() {
                Some("Read") => (r + entry.value.unwrap_or(0), w),
                Some("Write") => (r, w + entry.value.unwrap_or(0)),
                _ => (r, w),
            }
        });

        Ok(StatsResult {
            cpu_usage_nanos: cpu
                .cpu_usage
                .as_ref()
                .and_then(|u| u.total_usage)
                .unwrap_or(0),
            cpu_system_nanos: cpu.system_cpu_usage.unwrap_or(0),
            mem_usage_bytes: mem.usage.unwrap_or(0),
            mem_limit_bytes: mem.limit.unwrap_or(0),
            net_rx_bytes: rx,
            net_tx_bytes: tx,
            blk_read_bytes: read,
            blk_write_bytes: write,
        })
    }

    async fn update_limits(
        &self,
        container_id: &str,
        limits: ResourceLimits,
    ) -> Result<(), RuntimeError> {
        let update = ContainerUpdateBody {
            nano_cpus: Some((limits.cpu_cores * 1_000_000_000.0) as i64),
            memory: Some((limits.memory_mb * 1024 * 1024) as i64),
            ..Default::default()
        };
        self.bounded(self.docker.update_container(container_id, update))
            .await
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        timeout_seconds: u64,
    ) -> Result<ExecResult, RuntimeError> {
        let config = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .bounded(self.docker.create_exec(container_id, config))
            .await?;

        let start = timeout(
            Duration::from_secs(timeout_seconds),
            self.docker.start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    output_capacity: None,
                }),
            ),
        )
        .await
        .map_err(|_| RuntimeError::RuntimeTimeout)?
        .map_err(classify)?;

        let (mut stdout, mut stderr) = (String::new(), String::new());
        if let StartExecResults::Attached { mut output, .. } = start {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(classify)? {
                    bollard::container::LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspected = self.bounded(self.docker.inspect_exec(&exec.id)).await?;

        Ok(ExecResult {
            exit_code: inspected.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn log_tail(&self, container_id: &str, lines: usize) -> Result<Vec<String>, RuntimeError> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&lines.to_string())
            .build();

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut out = Vec::with_capacity(lines);
        while let Some(chunk) = timeout(self.call_timeout, stream.next())
            .await
            .map_err(|_| RuntimeError::RuntimeTimeout)?
        {
            match chunk.map_err(classify)? {
                bollard::container::LogOutput::StdOut { message }
                | bollard::container::LogOutput::StdErr { message } => {
                    out.push(String::from_utf8_lossy(&message).trim_end().to_string());
                }
                _ => {}
            }
        }
        Ok(out)
    }
}
