//! Metrics engine: periodic resource sampler plus a change-driven push
//! bus. Sampling never takes a cluster's lock — it reads straight from
//! the runtime driver — so a stuck lifecycle operation on one cluster
//! never stalls another cluster's samples.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::{
    auth::Principal,
    cluster::Cluster,
    config::MetricsConfig,
    repository::{ClusterRepository, MetricsSampleRepository},
    runtime::RuntimeDriver,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub cluster_id: String,
    pub timestamp_ms: u64,
    pub cpu_pct: f64,
    pub mem_bytes: u64,
    pub mem_pct: f64,
    pub disk_bytes: u64,
    pub disk_pct: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub uptime_secs: u64,
    pub restart_count: u64,
}

/// Capacity of the broadcast channel handed to every subscriber (mirrors
/// [`crate::alerts::AlertBoard`]'s bounded fan-out).
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct MetricsEngine {
    cluster_repo: Arc<dyn ClusterRepository>,
    metrics_repo: Arc<dyn MetricsSampleRepository>,
    runtime: Arc<dyn RuntimeDriver>,
    config: MetricsConfig,
    current: RwLock<HashMap<String, MetricsSample>>,
    last_pushed: RwLock<HashMap<String, MetricsSample>>,
    last_push_at_ms: RwLock<HashMap<String, u64>>,
    running_since_ms: RwLock<HashMap<String, u64>>,
    events: broadcast::Sender<HashMap<String, MetricsSample>>,
}

impl MetricsEngine {
    pub fn new(
        cluster_repo: Arc<dyn ClusterRepository>,
        metrics_repo: Arc<dyn MetricsSampleRepository>,
        runtime: Arc<dyn RuntimeDriver>,
        config: MetricsConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            cluster_repo,
            metrics_repo,
            runtime,
            config,
            current: RwLock::new(HashMap::new()),
            last_pushed: RwLock::new(HashMap::new()),
            last_push_at_ms: RwLock::new(HashMap::new()),
            running_since_ms: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribes to change-driven pushes, filtered down to the clusters
    /// `principal` may see. A lagging subscriber misses the oldest maps
    /// rather than blocking the sampler; it is expected to resync via
    /// [`Self::snapshot`].
    pub async fn subscribe(&self, principal: &Principal) -> FilteredMetrics {
        FilteredMetrics {
            inner: self.events.subscribe(),
            visible: self.visible_cluster_ids(principal).await,
        }
    }

    pub async fn snapshot(&self, principal: &Principal) -> HashMap<String, MetricsSample> {
        let visible = self.visible_cluster_ids(principal).await;
        self.current
            .read()
            .await
            .iter()
            .filter(|(id, _)| visible.contains(*id))
            .map(|(id, sample)| (id.clone(), sample.clone()))
            .collect()
    }

    async fn visible_cluster_ids(&self, principal: &Principal) -> HashSet<String> {
        let owner_filter = if principal.is_admin {
            None
        } else {
            Some(principal.user_id.as_str())
        };
        self.cluster_repo
            .list(owner_filter)
            .await
            .into_iter()
            .map(|cluster| cluster.id)
            .collect()
    }

    pub async fn tick(&self, now_ms: u64) {
        let mut any_change = false;

        for cluster in self.cluster_repo.list_non_deleted().await {
            if !cluster.is_running() {
                continue;
            }
            let Some(container_id) = cluster.container_id.clone() else {
                continue;
            };

            // A stats failure for one cluster must not stop the others.
            let Ok(stats) = self.runtime.stats(&container_id).await else {
                continue;
            };
            let Ok(inspected) = self.runtime.inspect(&container_id).await else {
                continue;
            };

            let uptime_secs = {
                let mut since = self.running_since_ms.write().await;
                let started = *since.entry(container_id.clone()).or_insert(now_ms);
                now_ms.saturating_sub(started) / 1000
            };

            let sample = build_sample(&cluster, &stats, inspected.restart_count, uptime_secs, now_ms);
            self.metrics_repo.append(sample.clone(), self.config.history_size).await;
            self.current.write().await.insert(cluster.id.clone(), sample.clone());

            if self.should_push(&cluster.id, &sample, now_ms).await {
                any_change = true;
            }
        }

        if any_change {
            let snapshot = self.current.read().await.clone();
            let _ = self.events.send(snapshot);
            let mut last_push = self.last_push_at_ms.write().await;
            for id in self.current.read().await.keys() {
                last_push.insert(id.clone(), now_ms);
            }
        }
    }

    async fn should_push(&self, cluster_id: &str, sample: &MetricsSample, now_ms: u64) -> bool {
        let changed = match self.last_pushed.read().await.get(cluster_id) {
            None => true,
            Some(prev) => {
                (sample.cpu_pct - prev.cpu_pct).abs() > self.config.change_epsilon_pct
                    || (sample.mem_pct - prev.mem_pct).abs() > self.config.change_epsilon_pct
                    || (sample.disk_pct - prev.disk_pct).abs() > self.config.change_epsilon_pct
                    || sample.restart_count != prev.restart_count
            }
        };

        let silent_too_long = match self.last_push_at_ms.read().await.get(cluster_id) {
            Some(&last) => now_ms.saturating_sub(last) >= self.config.max_silence.as_millis() as u64,
            None => true,
        };

        if changed || silent_too_long {
            self.last_pushed.write().await.insert(cluster_id.to_string(), sample.clone());
            true
        } else {
            false
        }
    }
}

/// A per-subscriber view over [`MetricsEngine`]'s broadcast channel, pruned
/// to the cluster ids visible to the principal at subscribe time.
#[derive(Debug)]
pub struct FilteredMetrics {
    inner: broadcast::Receiver<HashMap<String, MetricsSample>>,
    visible: HashSet<String>,
}

impl FilteredMetrics {
    pub async fn recv(&mut self) -> Result<HashMap<String, MetricsSample>, broadcast::error::RecvError> {
        let sample = self.inner.recv().await?;
        Ok(sample
            .into_iter()
            .filter(|(id, _)| self.visible.contains(id))
            .collect())
    }
}

fn build_sample(
    cluster: &Cluster,
    stats: &crate::runtime::StatsResult,
    restart_count: u64,
    uptime_secs: u64,
    now_ms: u64,
) -> MetricsSample {
    let cpu_limit_nanos = (cluster.quotas.cpu_cores * 1_000_000_000.0).max(1.0);
    let cpu_pct = (stats.cpu_usage_nanos as f64 / cpu_limit_nanos) * 100.0;

    let mem_limit_bytes = (cluster.quotas.memory_mb * 1024 * 1024).max(1);
    let mem_pct = (stats.mem_usage_bytes as f64 / mem_limit_bytes as f64) * 100.0;

    // The container runtime's stats call doesn't expose filesystem usage
    // directly; disk accounting is left at zero until the driver grows
    // that verb.
    let disk_bytes = 0;
    let disk_pct = 0.0;

    MetricsSample {
        cluster_id: cluster.id.clone(),
        timestamp_ms: now_ms,
        cpu_pct,
        mem_bytes: stats.mem_usage_bytes,
        mem_pct,
        disk_bytes,
        disk_pct,
        net_rx_bytes: stats.net_rx_bytes,
        net_tx_bytes: stats.net_tx_bytes,
        uptime_secs,
        restart_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{BackupPolicy, ClusterState, Quotas, RecoveryPolicy},
        repository::{InMemoryClusterRepository, InMemoryMetricsSampleRepository},
        runtime::{FakeRuntime, RuntimeDriver, StatsResult},
    };

    async fn running_cluster(repo: &InMemoryClusterRepository, runtime: &FakeRuntime, id: &str) -> Cluster {
        let container_id = runtime
            .run(
                id,
                "nginx",
                std::path::Path::new("/tmp"),
                30000,
                80,
                &Default::default(),
                crate::runtime::ResourceLimits {
                    cpu_cores: 1.0,
                    memory_mb: 512,
                    disk_gb: 1,
                    network_mbps: 0,
                },
            )
            .await
            .unwrap();

        let cluster = Cluster {
            id: id.to_string(),
            name: id.to_string(),
            template_name: "web".to_string(),
            owner_id: "alice".to_string(),
            created_at_ms: 0,
            host_port: 30000,
            workspace_path: "/tmp".into(),
            container_id: Some(container_id),
            quotas: Quotas::default(),
            state: ClusterState::Running,
            restart_attempts: 0,
            last_transition_ms: 0,
            recovery_policy: RecoveryPolicy::default(),
            backup_policy: BackupPolicy::default(),
        };
        repo.insert(cluster.clone()).await;
        cluster
    }

    #[tokio::test]
    async fn first_sample_is_always_pushed() {
        let cluster_repo = Arc::new(InMemoryClusterRepository::default());
        let metrics_repo = Arc::new(InMemoryMetricsSampleRepository::default());
        let runtime = Arc::new(FakeRuntime::new());
        let cluster = running_cluster(&cluster_repo, &runtime, "c1").await;
        runtime.set_stats(
            cluster.container_id.as_deref().unwrap(),
            StatsResult {
                cpu_usage_nanos: 500_000_000,
                mem_usage_bytes: 100 * 1024 * 1024,
                ..Default::default()
            },
        );

        let engine = MetricsEngine::new(cluster_repo, metrics_repo, runtime, MetricsConfig::default());
        let mut rx = engine.subscribe(&Principal::admin("root")).await;
        engine.tick(1_000).await;

        let pushed = rx.recv().await.unwrap();
        assert!(pushed.contains_key("c1"));
        assert!(pushed["c1"].cpu_pct > 0.0);
    }

    #[tokio::test]
    async fn unchanged_sample_within_silence_window_is_not_pushed() {
        let cluster_repo = Arc::new(InMemoryClusterRepository::default());
        let metrics_repo = Arc::new(InMemoryMetricsSampleRepository::default());
        let runtime = Arc::new(FakeRuntime::new());
        let cluster = running_cluster(&cluster_repo, &runtime, "c1").await;
        runtime.set_stats(
            cluster.container_id.as_deref().unwrap(),
            StatsResult {
                cpu_usage_nanos: 500_000_000,
                mem_usage_bytes: 100 * 1024 * 1024,
                ..Default::default()
            },
        );

        let engine = MetricsEngine::new(cluster_repo, metrics_repo, runtime, MetricsConfig::default());
        let mut rx = engine.subscribe(&Principal::admin("root")).await;

        engine.tick(1_000).await;
        rx.recv().await.unwrap();

        engine.tick(2_000).await;
        assert!(rx.inner.try_recv().is_err());
    }
}
