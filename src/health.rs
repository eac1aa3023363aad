//! Health & recovery loop: probes every non-terminal cluster on a fixed
//! interval and drives `FAILED`/`RESTARTING` transitions with
//! exponential backoff and cooldown.

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use ferroid::{base32::Base32UlidExt, id::ULID};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::RwLock, time::timeout};

use crate::{
    alerts::{AlertBoard, Severity},
    auth::Principal,
    cluster::{Cluster, ClusterEngine, ClusterLocks, ClusterState},
    config::HealthConfig,
    repository::{ClusterRepository, HealthSampleRepository},
    runtime::{ContainerRunState, RuntimeDriver},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub cluster_id: String,
    pub timestamp_ms: u64,
    pub overall: HealthState,
    pub exit_code: Option<i64>,
    pub latency_ms: Option<u64>,
    pub reason: Option<String>,
}

impl HealthSample {
    fn healthy(cluster_id: String, timestamp_ms: u64, exit_code: Option<i64>, latency_ms: u64) -> Self {
        Self {
            cluster_id,
            timestamp_ms,
            overall: HealthState::Healthy,
            exit_code,
            latency_ms: Some(latency_ms),
            reason: None,
        }
    }

    fn unhealthy(cluster_id: String, timestamp_ms: u64, exit_code: Option<i64>, reason: &str) -> Self {
        Self {
            cluster_id,
            timestamp_ms,
            overall: HealthState::Unhealthy,
            exit_code,
            latency_ms: None,
            reason: Some(reason.to_string()),
        }
    }
}

fn new_alert_id() -> String {
    ULID::from_datetime(SystemTime::now()).encode().to_string()
}

/// Caps the exponential backoff between restart attempts: the backoff is
/// `retryInterval * 2^(attempt-1)` seconds, capped at 30s.
const MAX_BACKOFF_SECS: u64 = 30;

fn backoff_ms(retry_interval: std::time::Duration, attempt: u32) -> u64 {
    let scale = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let backoff_secs = retry_interval.as_secs().saturating_mul(scale).min(MAX_BACKOFF_SECS);
    backoff_secs * 1000
}

/// Number of trailing log lines inspected to classify a failure.
const LOG_TAIL_LINES: usize = 20;

/// Cause of a failed health probe, inferred from exit code and the tail of
/// the container's log. OOM kills and port conflicts are usually transient
/// resource contention, so they get the full exponential backoff; a clean
/// exit or an unrecognized failure is retried immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    OutOfMemory,
    AddressInUse,
    Clean,
    Unknown,
}

impl FailureClass {
    fn is_delayed(self) -> bool {
        matches!(self, FailureClass::OutOfMemory | FailureClass::AddressInUse)
    }
}

fn classify_failure(exit_code: Option<i64>, log_tail: &[String]) -> FailureClass {
    let combined = log_tail.join("\n").to_lowercase();
    if exit_code == Some(137) || combined.contains("out of memory") || combined.contains("oom") {
        FailureClass::OutOfMemory
    } else if combined.contains("address already in use") {
        FailureClass::AddressInUse
    } else if exit_code.is_none() || exit_code == Some(0) {
        FailureClass::Clean
    } else {
        FailureClass::Unknown
    }
}

/// Identifies a specific failure so two consecutive identical ones can be
/// told apart from two distinct ones.
fn failure_signature(exit_code: Option<i64>, log_tail: &[String]) -> String {
    format!("{exit_code:?}|{}", log_tail.join("\n"))
}

/// Process-local bookkeeping the persisted `Cluster` record doesn't carry:
/// cooldown expiry, the timestamp of the last restart attempt, and the
/// signature of the last observed failure. None of this needs to survive a
/// process restart — a fresh process simply treats every `FAILED` cluster as
/// eligible to retry immediately, which is safe.
#[derive(Debug, Default)]
struct RecoveryBookkeeping {
    cooldown_until_ms: HashMap<String, u64>,
    last_attempt_ms: HashMap<String, u64>,
    last_error_signature: HashMap<String, String>,
}

#[derive(Debug)]
pub struct HealthLoop {
    cluster_repo: Arc<dyn ClusterRepository>,
    health_repo: Arc<dyn HealthSampleRepository>,
    runtime: Arc<dyn RuntimeDriver>,
    engine: Arc<ClusterEngine>,
    locks: Arc<ClusterLocks>,
    alerts: Arc<AlertBoard>,
    config: HealthConfig,
    http_client: reqwest::Client,
    bookkeeping: RwLock<RecoveryBookkeeping>,
}

impl HealthLoop {
    pub fn new(
        cluster_repo: Arc<dyn ClusterRepository>,
        health_repo: Arc<dyn HealthSampleRepository>,
        runtime: Arc<dyn RuntimeDriver>,
        engine: Arc<ClusterEngine>,
        locks: Arc<ClusterLocks>,
        alerts: Arc<AlertBoard>,
        config: HealthConfig,
    ) -> Self {
        Self {
            cluster_repo,
            health_repo,
            runtime,
            engine,
            locks,
            alerts,
            config,
            http_client: reqwest::Client::new(),
            bookkeeping: RwLock::new(RecoveryBookkeeping::default()),
        }
    }

    /// Runs one sweep over every non-terminal cluster. Recovery takes the
    /// cluster's lock non-blockingly and simply skips clusters under
    /// contention — the next tick retries.
    pub async fn tick(&self, now_ms: u64) {
        for cluster in self.cluster_repo.list_non_deleted().await {
            let Some(_guard) = self.locks.try_lock(&cluster.id) else {
                continue;
            };
            self.probe_and_recover(cluster, now_ms).await;
        }
    }

    async fn probe_and_recover(&self, mut cluster: Cluster, now_ms: u64) {
        let sample = self.probe(&cluster, now_ms).await;
        self.health_repo.append(sample.clone()).await;

        match sample.overall {
            HealthState::Healthy => self.on_healthy(&mut cluster, now_ms).await,
            HealthState::Unhealthy => self.on_unhealthy(&mut cluster, &sample, now_ms).await,
            HealthState::Unknown => {}
        }
    }

    async fn probe(&self, cluster: &Cluster, now_ms: u64) -> HealthSample {
        let Some(container_id) = cluster.container_id.clone() else {
            return HealthSample::unhealthy(cluster.id.clone(), now_ms, None, "container-dead");
        };

        let inspected = match self.runtime.inspect(&container_id).await {
            Ok(inspected) => inspected,
            Err(_) => return HealthSample::unhealthy(cluster.id.clone(), now_ms, None, "container-dead"),
        };

        if inspected.state != ContainerRunState::Running
            || inspected.exit_code.map(|code| code != 0).unwrap_or(false)
        {
            return HealthSample::unhealthy(cluster.id.clone(), now_ms, inspected.exit_code, "container-dead");
        }

        let probe_started = std::time::Instant::now();
        let connect = timeout(
            self.config.tcp_timeout,
            TcpStream::connect(("127.0.0.1", cluster.host_port)),
        )
        .await;
        if !matches!(connect, Ok(Ok(_))) {
            return HealthSample::unhealthy(cluster.id.clone(), now_ms, inspected.exit_code, "port-closed");
        }

        if let Some(path) = &self.config.http_path {
            let url = format!("http://127.0.0.1:{}{}", cluster.host_port, path);
            let response = timeout(self.config.timeout, self.http_client.get(&url).send()).await;
            match response {
                Ok(Ok(resp)) if resp.status().is_success() => {}
                _ => {
                    return HealthSample::unhealthy(
                        cluster.id.clone(),
                        now_ms,
                        inspected.exit_code,
                        "http-probe-failed",
                    )
                }
            }
        }

        let latency_ms = probe_started.elapsed().as_millis() as u64;
        HealthSample::healthy(cluster.id.clone(), now_ms, inspected.exit_code, latency_ms)
    }

    async fn on_healthy(&self, cluster: &mut Cluster, now_ms: u64) {
        if matches!(cluster.state, ClusterState::Failed | ClusterState::Restarting) {
            cluster.state = ClusterState::Running;
            cluster.last_transition_ms = now_ms;
            self.cluster_repo.update(cluster.clone()).await;

            let open_unhealthy_alert = self
                .alerts
                .list_for_cluster(&cluster.id)
                .await
                .into_iter()
                .find(|alert| alert.kind == "unhealthy" && alert.is_open());
            if let Some(alert) = open_unhealthy_alert {
                self.alerts.resolve(&alert.id, "cluster reported healthy again", now_ms).await;
            }

            self.bookkeeping.write().await.last_error_signature.remove(&cluster.id);
        }

        let mut book = self.bookkeeping.write().await;
        if let Some(&until) = book.cooldown_until_ms.get(&cluster.id) {
            if now_ms >= until {
                book.cooldown_until_ms.remove(&cluster.id);
                drop(book);
                if cluster.restart_attempts != 0 {
                    cluster.restart_attempts = 0;
                    self.cluster_repo.update(cluster.clone()).await;
                }
            }
        }
    }

    async fn on_unhealthy(&self, cluster: &mut Cluster, sample: &HealthSample, now_ms: u64) {
        if !matches!(
            cluster.state,
            ClusterState::Running | ClusterState::Failed | ClusterState::Restarting
        ) {
            return;
        }

        if cluster.state == ClusterState::Running {
            cluster.state = ClusterState::Failed;
            cluster.last_transition_ms = now_ms;
            self.cluster_repo.update(cluster.clone()).await;
            self.alerts
                .raise(
                    &cluster.id,
                    "unhealthy",
                    Severity::Medium,
                    format!(
                        "cluster unhealthy: {}",
                        sample.reason.as_deref().unwrap_or("unknown")
                    ),
                    new_alert_id,
                    now_ms,
                )
                .await;
            return;
        }

        let policy = cluster.recovery_policy;

        {
            let book = self.bookkeeping.read().await;
            if let Some(&until) = book.cooldown_until_ms.get(&cluster.id) {
                if now_ms < until {
                    return;
                }
            }
        }

        let log_tail = match &cluster.container_id {
            Some(container_id) => self.runtime.log_tail(container_id, LOG_TAIL_LINES).await.unwrap_or_default(),
            None => Vec::new(),
        };
        let class = classify_failure(sample.exit_code, &log_tail);
        let signature = failure_signature(sample.exit_code, &log_tail);

        let repeated = self.bookkeeping.read().await.last_error_signature.get(&cluster.id) == Some(&signature);
        if repeated {
            let mut book = self.bookkeeping.write().await;
            book.cooldown_until_ms
                .insert(cluster.id.clone(), now_ms + policy.cooldown.as_millis() as u64);
            drop(book);
            self.alerts
                .raise(
                    &cluster.id,
                    "recovery-cooldown",
                    Severity::Critical,
                    "same failure repeated on restart, entering cooldown",
                    new_alert_id,
                    now_ms,
                )
                .await;
            return;
        }

        if cluster.restart_attempts >= policy.max_attempts {
            let mut book = self.bookkeeping.write().await;
            book.cooldown_until_ms
                .insert(cluster.id.clone(), now_ms + policy.cooldown.as_millis() as u64);
            drop(book);
            self.alerts
                .raise(
                    &cluster.id,
                    "recovery-cooldown",
                    Severity::Critical,
                    "max restart attempts exceeded, entering cooldown",
                    new_alert_id,
                    now_ms,
                )
                .await;
            return;
        }

        if class.is_delayed() {
            let book = self.bookkeeping.read().await;
            if let Some(&last) = book.last_attempt_ms.get(&cluster.id) {
                let wait = backoff_ms(policy.retry_interval, cluster.restart_attempts + 1);
                if now_ms.saturating_sub(last) < wait {
                    return;
                }
            }
        }

        cluster.restart_attempts += 1;
        {
            let mut book = self.bookkeeping.write().await;
            book.last_attempt_ms.insert(cluster.id.clone(), now_ms);
            book.last_error_signature.insert(cluster.id.clone(), signature);
        }
        // Persist the bumped attempt counter while the cluster stays
        // FAILED — `ClusterEngine::start` requires that precondition and
        // performs the FAILED/STOPPED -> RUNNING transition itself.
        self.cluster_repo.update(cluster.clone()).await;

        if self.engine.start(&Principal::system(), &cluster.id).await.is_ok() {
            return;
        }
        // Restart attempt failed; the record is already FAILED with the
        // bumped counter, so the next tick simply retries.
    }
}
