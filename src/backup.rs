//! Backup/restore engine: scheduled snapshots of a cluster's workspace
//! into checksummed tar archives, with age/count retention and
//! restore-by-id.

use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    alerts::{AlertBoard, Severity},
    auth::Principal,
    cluster::{Cluster, ClusterEngine, ClusterState, LifecycleError},
    repository::{BackupRepository, ClusterRepository},
};

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup not found: {0}")]
    NotFound(String),
    #[error("archive checksum mismatch for backup {id}")]
    IntegrityError { id: String },
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write sidecar manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub cluster_id: String,
    pub template_name: String,
    pub kind: BackupKind,
    pub archive_path: PathBuf,
    pub byte_size: u64,
    pub checksum: String,
    pub created_at_ms: u64,
}

const SIDECAR_SUFFIX: &str = ".manifest.json";

#[derive(Debug, Serialize, Deserialize)]
struct SidecarManifest<'a> {
    id: &'a str,
    cluster_id: &'a str,
    template_name: &'a str,
    checksum: &'a str,
    kind: BackupKind,
    created_at_ms: u64,
}

#[derive(Debug)]
pub struct BackupEngine {
    cluster_repo: Arc<dyn ClusterRepository>,
    backup_repo: Arc<dyn BackupRepository>,
    engine: Arc<ClusterEngine>,
    alerts: Arc<AlertBoard>,
    backups_root: PathBuf,
}

impl BackupEngine {
    pub fn new(
        cluster_repo: Arc<dyn ClusterRepository>,
        backup_repo: Arc<dyn BackupRepository>,
        engine: Arc<ClusterEngine>,
        alerts: Arc<AlertBoard>,
        backups_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cluster_repo,
            backup_repo,
            engine,
            alerts,
            backups_root: backups_root.into(),
        }
    }

    /// Runs one scheduler wake-up. Due clusters get one `FULL` backup
    /// each; a failure on one cluster is recorded as an alert and does
    /// not stop the others.
    pub async fn tick(&self, now_ms: u64, id_factory: impl Fn() -> String) {
        for cluster in self.cluster_repo.list_non_deleted().await {
            if !cluster.backup_policy.auto_backup_enabled {
                continue;
            }

            let due_at = self.last_backup_at(&cluster.id).await
                + cluster.backup_policy.interval_hours as u64 * 3_600_000;
            if now_ms < due_at {
                continue;
            }

            if let Err(err) = self.snapshot(&cluster, BackupKind::Full, id_factory(), now_ms).await {
                self.alerts
                    .raise(
                        &cluster.id,
                        "backup-failed",
                        Severity::Low,
                        format!("scheduled backup failed: {err}"),
                        || id_factory(),
                        now_ms,
                    )
                    .await;
            }
        }
    }

    async fn last_backup_at(&self, cluster_id: &str) -> u64 {
        self.backup_repo
            .list_for_cluster(cluster_id)
            .await
            .into_iter()
            .map(|b| b.created_at_ms)
            .max()
            .unwrap_or(0)
    }

    /// Archives a cluster's workspace directory and records a `Backup`.
    /// Partial artifacts are removed on any failure.
    pub async fn snapshot(
        &self,
        cluster: &Cluster,
        kind: BackupKind,
        id: String,
        now_ms: u64,
    ) -> Result<Backup, BackupError> {
        tokio::fs::create_dir_all(&self.backups_root)
            .await
            .map_err(|source| BackupError::Io {
                path: self.backups_root.clone(),
                source,
            })?;

        let archive_path = self.backups_root.join(format!("{id}.tar"));
        let result = self.archive_workspace(cluster, &archive_path).await;

        let byte_size = match result {
            Ok(size) => size,
            Err(err) => {
                let _ = tokio::fs::remove_file(&archive_path).await;
                return Err(err);
            }
        };

        let checksum = match checksum_file(&archive_path).await {
            Ok(sum) => sum,
            Err(err) => {
                let _ = tokio::fs::remove_file(&archive_path).await;
                return Err(err);
            }
        };

        let sidecar = SidecarManifest {
            id: &id,
            cluster_id: &cluster.id,
            template_name: &cluster.template_name,
            checksum: &checksum,
            kind,
            created_at_ms: now_ms,
        };
        let sidecar_path = self.sidecar_path(&id);
        if let Err(err) = write_sidecar(&sidecar_path, &sidecar).await {
            let _ = tokio::fs::remove_file(&archive_path).await;
            return Err(err);
        }

        let backup = Backup {
            id,
            cluster_id: cluster.id.clone(),
            template_name: cluster.template_name.clone(),
            kind,
            archive_path,
            byte_size,
            checksum,
            created_at_ms: now_ms,
        };
        self.backup_repo.insert(backup.clone()).await;

        self.enforce_retention(&cluster.id, cluster.backup_policy.retention_days, cluster.backup_policy.max_backups, now_ms)
            .await;

        Ok(backup)
    }

    async fn archive_workspace(&self, cluster: &Cluster, archive_path: &PathBuf) -> Result<u64, BackupError> {
        let file = tokio::fs::File::create(archive_path)
            .await
            .map_err(|source| BackupError::Io {
                path: archive_path.clone(),
                source,
            })?;
        let mut builder = tokio_tar::Builder::new(file);

        if cluster.workspace_path.exists() {
            builder
                .append_dir_all(".", &cluster.workspace_path)
                .await
                .map_err(|source| BackupError::Io {
                    path: cluster.workspace_path.clone(),
                    source,
                })?;
        }

        builder.finish().await.map_err(|source| BackupError::Io {
            path: archive_path.clone(),
            source,
        })?;

        let metadata = tokio::fs::metadata(archive_path)
            .await
            .map_err(|source| BackupError::Io {
                path: archive_path.clone(),
                source,
            })?;
        Ok(metadata.len())
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.backups_root.join(format!("{id}{SIDECAR_SUFFIX}"))
    }

    /// Delete-by-age then delete-by-count, never touching the most recent
    /// backup regardless of either threshold.
    async fn enforce_retention(&self, cluster_id: &str, retention_days: u32, max_backups: u32, now_ms: u64) {
        let mut backups = self.backup_repo.list_for_cluster(cluster_id).await;
        backups.sort_by_key(|b| b.created_at_ms);
        let Some(most_recent_id) = backups.last().map(|b| b.id.clone()) else {
            return;
        };

        let retention_ms = retention_days as u64 * 86_400_000;
        let mut survivors: Vec<Backup> = Vec::new();
        for backup in backups {
            let too_old = now_ms.saturating_sub(backup.created_at_ms) > retention_ms;
            if too_old && backup.id != most_recent_id {
                self.remove_backup(&backup).await;
            } else {
                survivors.push(backup);
            }
        }

        survivors.sort_by_key(|b| b.created_at_ms);
        while survivors.len() as u32 > max_backups.max(1) {
            if survivors[0].id == most_recent_id {
                break;
            }
            let oldest = survivors.remove(0);
            self.remove_backup(&oldest).await;
        }
    }

    async fn remove_backup(&self, backup: &Backup) {
        let _ = tokio::fs::remove_file(&backup.archive_path).await;
        let _ = tokio::fs::remove_file(self.sidecar_path(&backup.id)).await;
        self.backup_repo.remove(&backup.id).await;
    }

    /// Restores a backup onto `target_cluster_id`, or `backup.cluster_id`
    /// if not given. A missing target is treated as a fresh `create` using
    /// the template recorded in the backup's sidecar metadata.
    pub async fn restore(&self, backup_id: &str, target_cluster_id: Option<&str>) -> Result<Cluster, BackupError> {
        let backup = self
            .backup_repo
            .get(backup_id)
            .await
            .ok_or_else(|| BackupError::NotFound(backup_id.to_string()))?;

        let actual_checksum = checksum_file(&backup.archive_path).await?;
        if actual_checksum != backup.checksum {
            return Err(BackupError::IntegrityError { id: backup.id.clone() });
        }

        let target_id = target_cluster_id.unwrap_or(&backup.cluster_id);
        match self.cluster_repo.get(target_id).await {
            Some(cluster) => {
                if cluster.state == ClusterState::Running {
                    self.engine.stop(&Principal::system(), &cluster.id, 10).await?;
                }
                self.replace_workspace(&cluster.workspace_path, &backup.archive_path).await?;
                let restarted = self.engine.start(&Principal::system(), &cluster.id).await?;
                Ok(restarted)
            }
            None => {
                let created = self
                    .engine
                    .create(&Principal::system(), &backup.template_name, None, None, "restore")
                    .await?;
                self.replace_workspace(&created.workspace_path, &backup.archive_path).await?;
                Ok(created)
            }
        }
    }

    async fn replace_workspace(&self, workspace_path: &PathBuf, archive_path: &PathBuf) -> Result<(), BackupError> {
        if workspace_path.exists() {
            tokio::fs::remove_dir_all(workspace_path)
                .await
                .map_err(|source| BackupError::Io {
                    path: workspace_path.clone(),
                    source,
                })?;
        }
        tokio::fs::create_dir_all(workspace_path)
            .await
            .map_err(|source| BackupError::Io {
                path: workspace_path.clone(),
                source,
            })?;

        let file = tokio::fs::File::open(archive_path)
            .await
            .map_err(|source| BackupError::Io {
                path: archive_path.clone(),
                source,
            })?;
        let mut archive = tokio_tar::Archive::new(file);
        archive
            .unpack(workspace_path)
            .await
            .map_err(|source| BackupError::Io {
                path: workspace_path.clone(),
                source,
            })?;
        Ok(())
    }
}

async fn checksum_file(path: &PathBuf) -> Result<String, BackupError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| BackupError::Io {
        path: path.clone(),
        source,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

async fn write_sidecar(path: &PathBuf, manifest: &SidecarManifest<'_>) -> Result<(), BackupError> {
    let json = serde_json::to_vec_pretty(manifest)?;
    tokio::fs::write(path, json).await.map_err(|source| BackupError::Io {
        path: path.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{BackupPolicy, ClusterLocks, Quotas, RecoveryPolicy},
        ports::PortAllocator,
        repository::{InMemoryAlertRepository, InMemoryBackupRepository, InMemoryClusterRepository},
        runtime::FakeRuntime,
        templates::TemplateRegistry,
        workspace::WorkspaceManager,
    };

    struct Harness {
        backups: BackupEngine,
        cluster: Cluster,
        _templates_dir: tempfile::TempDir,
        _workspaces_dir: tempfile::TempDir,
        _backups_dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let templates_dir = tempfile::tempdir().unwrap();
        let web_dir = templates_dir.path().join("web");
        std::fs::create_dir_all(&web_dir).unwrap();
        std::fs::write(
            web_dir.join("manifest.json"),
            r#"{"image": "nginx:latest", "container_port": 80}"#,
        )
        .unwrap();
        let workspaces_dir = tempfile::tempdir().unwrap();
        let backups_dir = tempfile::tempdir().unwrap();

        let cluster_repo = Arc::new(InMemoryClusterRepository::default());
        let backup_repo = Arc::new(InMemoryBackupRepository::default());
        let alerts = Arc::new(AlertBoard::new(Arc::new(InMemoryAlertRepository::default())));

        let engine = Arc::new(ClusterEngine::new(
            cluster_repo.clone(),
            Arc::new(TemplateRegistry::load(templates_dir.path()).unwrap()),
            Arc::new(PortAllocator::new(crate::config::PortRange::new(30000, 30010).unwrap())),
            Arc::new(WorkspaceManager::new(workspaces_dir.path())),
            Arc::new(FakeRuntime::new()),
            Arc::new(ClusterLocks::new()),
        ));

        let cluster = engine
            .create(&Principal::user("alice"), "web", None, None, "alice")
            .await
            .unwrap();
        std::fs::write(cluster.workspace_path.join("data.txt"), b"payload").unwrap();

        let backups = BackupEngine::new(cluster_repo, backup_repo, engine, alerts, backups_dir.path());

        Harness {
            backups,
            cluster,
            _templates_dir: templates_dir,
            _workspaces_dir: workspaces_dir,
            _backups_dir: backups_dir,
        }
    }

    #[tokio::test]
    async fn snapshot_then_restore_round_trips_workspace_contents() {
        let h = harness().await;
        let backup = h
            .backups
            .snapshot(&h.cluster, BackupKind::Full, "backup-1".to_string(), 1_000)
            .await
            .unwrap();

        std::fs::remove_file(h.cluster.workspace_path.join("data.txt")).unwrap();

        h.backups.restore(&backup.id, Some(&h.cluster.id)).await.unwrap();

        let restored = std::fs::read(h.cluster.workspace_path.join("data.txt")).unwrap();
        assert_eq!(restored, b"payload");
    }

    #[tokio::test]
    async fn restore_with_tampered_archive_is_rejected() {
        let h = harness().await;
        let backup = h
            .backups
            .snapshot(&h.cluster, BackupKind::Full, "backup-1".to_string(), 1_000)
            .await
            .unwrap();

        tokio::fs::write(&backup.archive_path, b"corrupted").await.unwrap();

        let err = h.backups.restore(&backup.id, Some(&h.cluster.id)).await.unwrap_err();
        assert!(matches!(err, BackupError::IntegrityError { .. }));
    }

    #[tokio::test]
    async fn retention_keeps_the_most_recent_backup() {
        let h = harness().await;
        let mut cluster = h.cluster.clone();
        cluster.backup_policy = BackupPolicy {
            auto_backup_enabled: true,
            interval_hours: 1,
            retention_days: 0,
            max_backups: 1,
        };

        h.backups
            .snapshot(&cluster, BackupKind::Full, "backup-1".to_string(), 0)
            .await
            .unwrap();
        h.backups
            .snapshot(&cluster, BackupKind::Full, "backup-2".to_string(), 10_000)
            .await
            .unwrap();

        let remaining = h.backups.backup_repo.list_for_cluster(&cluster.id).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "backup-2");
    }
}
