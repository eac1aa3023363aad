//! Workspace manager: creates, owns and tears down per-cluster on-disk
//! working directories, and renders the per-cluster runtime manifest
//! substituted from the cluster's template.
//!
//! Directory creation is atomic by staging through a temporary path
//! before it becomes visible under its final name: render into a
//! `tempfile::TempDir` next to the target, then rename it into place.
//! Any failure before the rename leaves no partial directory visible
//! under the cluster's id.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{cluster::Quotas, templates::TemplateManifest};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to render manifest: {0}")]
    Render(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct RenderedManifest<'a> {
    cluster_name: &'a str,
    image: &'a str,
    host_port: u16,
    container_port: u16,
    quotas: &'a Quotas,
}

const RENDERED_MANIFEST_FILE: &str = "clusterforge.json";

#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, cluster_id: &str) -> PathBuf {
        self.root.join(cluster_id)
    }

    /// Creates `<root>/<cluster_id>` and renders the manifest into it.
    /// On any failure, the partially-built directory is removed.
    pub fn create(
        &self,
        cluster_id: &str,
        cluster_name: &str,
        host_port: u16,
        template: &TemplateManifest,
        quotas: &Quotas,
    ) -> Result<PathBuf, WorkspaceError> {
        std::fs::create_dir_all(&self.root).map_err(|source| WorkspaceError::Io {
            path: self.root.clone(),
            source,
        })?;

        let final_path = self.path_for(cluster_id);
        let staging = tempfile::Builder::new()
            .prefix(&format!("{cluster_id}-"))
            .tempdir_in(&self.root)
            .map_err(|source| WorkspaceError::Io {
                path: self.root.clone(),
                source,
            })?;

        let result = self.render_into(staging.path(), cluster_name, host_port, template, quotas);
        match result {
            Ok(()) => {
                let staging_path = staging.into_path();
                std::fs::rename(&staging_path, &final_path).map_err(|source| {
                    let _ = std::fs::remove_dir_all(&staging_path);
                    WorkspaceError::Io {
                        path: final_path.clone(),
                        source,
                    }
                })?;
                Ok(final_path)
            }
            Err(err) => Err(err),
        }
    }

    fn render_into(
        &self,
        dir: &Path,
        cluster_name: &str,
        host_port: u16,
        template: &TemplateManifest,
        quotas: &Quotas,
    ) -> Result<(), WorkspaceError> {
        let rendered = RenderedManifest {
            cluster_name,
            image: &template.image,
            host_port,
            container_port: template.container_port,
            quotas,
        };
        let json = serde_json::to_vec_pretty(&rendered)?;
        std::fs::write(dir.join(RENDERED_MANIFEST_FILE), json).map_err(|source| {
            WorkspaceError::Io {
                path: dir.to_path_buf(),
                source,
            }
        })
    }

    /// Removes a cluster's workspace. Callers are responsible for only
    /// invoking this once the cluster has transitioned to `DELETING`.
    pub fn destroy(&self, cluster_id: &str) -> Result<(), WorkspaceError> {
        let path = self.path_for(cluster_id);
        if !path.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&path).map_err(|source| WorkspaceError::Io { path, source })
    }

    /// Garbage-collects workspace directories with no corresponding entry
    /// in `live_cluster_ids` — orphans left behind by a crash between the
    /// delete ordering's steps.
    pub fn garbage_collect(&self, live_cluster_ids: &[String]) -> Result<Vec<String>, WorkspaceError> {
        let mut removed = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(source) => {
                return Err(WorkspaceError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| WorkspaceError::Io {
                path: self.root.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if live_cluster_ids.iter().any(|id| id == &name) {
                continue;
            }
            std::fs::remove_dir_all(entry.path()).map_err(|source| WorkspaceError::Io {
                path: entry.path(),
                source,
            })?;
            removed.push(name);
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> TemplateManifest {
        TemplateManifest {
            image: "nginx:latest".into(),
            container_port: 80,
            default_quotas: Quotas::default(),
        }
    }

    #[test]
    fn create_renders_manifest_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let path = manager
            .create("c1", "web-1", 30000, &manifest(), &Quotas::default())
            .unwrap();

        assert!(path.join(RENDERED_MANIFEST_FILE).exists());
        assert_eq!(path, manager.path_for("c1"));
    }

    #[test]
    fn destroy_removes_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        manager
            .create("c1", "web-1", 30000, &manifest(), &Quotas::default())
            .unwrap();

        manager.destroy("c1").unwrap();
        assert!(!manager.path_for("c1").exists());
    }

    #[test]
    fn destroy_of_missing_workspace_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        assert!(manager.destroy("ghost").is_ok());
    }

    #[test]
    fn garbage_collect_removes_orphans_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        manager
            .create("live", "web-1", 30000, &manifest(), &Quotas::default())
            .unwrap();
        manager
            .create("orphan", "web-2", 30001, &manifest(), &Quotas::default())
            .unwrap();

        let removed = manager
            .garbage_collect(&["live".to_string()])
            .unwrap();

        assert_eq!(removed, vec!["orphan".to_string()]);
        assert!(manager.path_for("live").exists());
        assert!(!manager.path_for("orphan").exists());
    }
}
