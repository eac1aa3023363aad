//! Persistence: five repositories with CRUD plus the handful of indexed
//! queries the core needs. Operations are synchronous from the caller's
//! perspective (commit-or-throw, no implicit caching, no joins beyond
//! cluster id) — the trait signatures are async only because every other
//! boundary in this crate is, to let a real database-backed
//! implementation await its driver.
//!
//! Each trait ships an in-memory implementation so the crate (and an
//! embedder prototyping against it) can run without a database.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;

use crate::{alerts::Alert, backup::Backup, cluster::Cluster, health::HealthSample, metrics::MetricsSample};

#[async_trait]
pub trait ClusterRepository: Send + Sync + std::fmt::Debug {
    async fn insert(&self, cluster: Cluster);
    async fn update(&self, cluster: Cluster);
    async fn get(&self, id: &str) -> Option<Cluster>;
    async fn get_by_name(&self, name: &str) -> Option<Cluster>;
    async fn list(&self, owner_filter: Option<&str>) -> Vec<Cluster>;
    async fn list_non_deleted(&self) -> Vec<Cluster>;
}

#[async_trait]
pub trait HealthSampleRepository: Send + Sync + std::fmt::Debug {
    async fn append(&self, sample: HealthSample);
    async fn recent(&self, cluster_id: &str, limit: usize) -> Vec<HealthSample>;
}

#[async_trait]
pub trait MetricsSampleRepository: Send + Sync + std::fmt::Debug {
    async fn append(&self, sample: MetricsSample, retain: usize);
    async fn latest(&self, cluster_id: &str) -> Option<MetricsSample>;
    async fn recent(&self, cluster_id: &str, limit: usize) -> Vec<MetricsSample>;
}

#[async_trait]
pub trait AlertRepository: Send + Sync + std::fmt::Debug {
    async fn upsert(&self, alert: Alert) -> Alert;
    async fn find_open(&self, cluster_id: &str, kind: &str) -> Option<Alert>;
    async fn resolve(&self, alert_id: &str, note: String, resolved_at_ms: u64) -> Option<Alert>;
    async fn list_for_cluster(&self, cluster_id: &str) -> Vec<Alert>;
}

#[async_trait]
pub trait BackupRepository: Send + Sync + std::fmt::Debug {
    async fn insert(&self, backup: Backup);
    async fn get(&self, id: &str) -> Option<Backup>;
    async fn list_for_cluster(&self, cluster_id: &str) -> Vec<Backup>;
    async fn remove(&self, id: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryClusterRepository {
    clusters: RwLock<HashMap<String, Cluster>>,
}

#[async_trait]
impl ClusterRepository for InMemoryClusterRepository {
    async fn insert(&self, cluster: Cluster) {
        self.clusters.write().unwrap().insert(cluster.id.clone(), cluster);
    }

    async fn update(&self, cluster: Cluster) {
        self.clusters.write().unwrap().insert(cluster.id.clone(), cluster);
    }

    async fn get(&self, id: &str) -> Option<Cluster> {
        self.clusters.read().unwrap().get(id).cloned()
    }

    async fn get_by_name(&self, name: &str) -> Option<Cluster> {
        self.clusters
            .read()
            .unwrap()
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    async fn list(&self, owner_filter: Option<&str>) -> Vec<Cluster> {
        self.clusters
            .read()
            .unwrap()
            .values()
            .filter(|c| owner_filter.map(|o| o == c.owner_id).unwrap_or(true))
            .cloned()
            .collect()
    }

    async fn list_non_deleted(&self) -> Vec<Cluster> {
        self.clusters
            .read()
            .unwrap()
            .values()
            .filter(|c| !c.state.is_terminal())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryHealthSampleRepository {
    samples: RwLock<HashMap<String, Vec<HealthSample>>>,
}

#[async_trait]
impl HealthSampleRepository for InMemoryHealthSampleRepository {
    async fn append(&self, sample: HealthSample) {
        self.samples
            .write()
            .unwrap()
            .entry(sample.cluster_id.clone())
            .or_default()
            .push(sample);
    }

    async fn recent(&self, cluster_id: &str, limit: usize) -> Vec<HealthSample> {
        self.samples
            .read()
            .unwrap()
            .get(cluster_id)
            .map(|samples| samples.iter().rev().take(limit).rev().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMetricsSampleRepository {
    samples: RwLock<HashMap<String, Vec<MetricsSample>>>,
}

#[async_trait]
impl MetricsSampleRepository for InMemoryMetricsSampleRepository {
    async fn append(&self, sample: MetricsSample, retain: usize) {
        let mut samples = self.samples.write().unwrap();
        let series = samples.entry(sample.cluster_id.clone()).or_default();
        series.push(sample);
        if series.len() > retain {
            let excess = series.len() - retain;
            series.drain(0..excess);
        }
    }

    async fn latest(&self, cluster_id: &str) -> Option<MetricsSample> {
        self.samples
            .read()
            .unwrap()
            .get(cluster_id)
            .and_then(|s| s.last().cloned())
    }

    async fn recent(&self, cluster_id: &str, limit: usize) -> Vec<MetricsSample> {
        self.samples
            .read()
            .unwrap()
            .get(cluster_id)
            .map(|samples| samples.iter().rev().take(limit).rev().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAlertRepository {
    alerts: RwLock<HashMap<String, Alert>>,
}

#[async_trait]
impl AlertRepository for InMemoryAlertRepository {
    async fn upsert(&self, alert: Alert) -> Alert {
        self.alerts.write().unwrap().insert(alert.id.clone(), alert.clone());
        alert
    }

    async fn find_open(&self, cluster_id: &str, kind: &str) -> Option<Alert> {
        self.alerts
            .read()
            .unwrap()
            .values()
            .find(|a| a.cluster_id == cluster_id && a.kind == kind && a.resolved_at_ms.is_none())
            .cloned()
    }

    async fn resolve(&self, alert_id: &str, note: String, resolved_at_ms: u64) -> Option<Alert> {
        let mut alerts = self.alerts.write().unwrap();
        let alert = alerts.get_mut(alert_id)?;
        alert.resolved_at_ms = Some(resolved_at_ms);
        alert.resolution_note = Some(note);
        Some(alert.clone())
    }

    async fn list_for_cluster(&self, cluster_id: &str) -> Vec<Alert> {
        self.alerts
            .read()
            .unwrap()
            .values()
            .filter(|a| a.cluster_id == cluster_id)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBackupRepository {
    backups: RwLock<HashMap<String, Backup>>,
}

#[async_trait]
impl BackupRepository for InMemoryBackupRepository {
    async fn insert(&self, backup: Backup) {
        self.backups.write().unwrap().insert(backup.id.clone(), backup);
    }

    async fn get(&self, id: &str) -> Option<Backup> {
        self.backups.read().unwrap().get(id).cloned()
    }

    async fn list_for_cluster(&self, cluster_id: &str) -> Vec<Backup> {
        self.backups
            .read()
            .unwrap()
            .values()
            .filter(|b| b.cluster_id == cluster_id)
            .cloned()
            .collect()
    }

    async fn remove(&self, id: &str) {
        self.backups.write().unwrap().remove(id);
    }
}
