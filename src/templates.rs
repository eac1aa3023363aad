//! Template registry: enumerates named templates on disk and resolves a
//! template name to its manifest file and default quotas.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};

use crate::cluster::Quotas;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("failed to scan templates root {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed manifest at {path}: {source}")]
    MalformedManifest {
        path: PathBuf,
        source: serde_json::Error,
    },
}

const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Declarative on-disk descriptor read from `<templates_root>/<name>/manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateManifest {
    pub image: String,
    #[serde(default)]
    pub container_port: u16,
    #[serde(default)]
    pub default_quotas: Quotas,
}

/// Read-only descriptor discovered from disk.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub manifest_path: PathBuf,
    pub manifest: TemplateManifest,
}

#[derive(Debug)]
pub struct TemplateRegistry {
    root: PathBuf,
    templates: RwLock<BTreeMap<String, Template>>,
}

impl TemplateRegistry {
    /// Scans `root` eagerly; each subdirectory containing a manifest file
    /// becomes a template named after the directory.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, TemplateError> {
        let root = root.into();
        let registry = Self {
            root,
            templates: RwLock::new(BTreeMap::new()),
        };
        registry.refresh()?;
        Ok(registry)
    }

    pub fn list(&self) -> Vec<Template> {
        self.templates.read().unwrap().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Result<Template, TemplateError> {
        self.templates
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))
    }

    /// Re-scans the templates root, replacing the in-memory index.
    pub fn refresh(&self) -> Result<(), TemplateError> {
        let mut discovered = BTreeMap::new();

        let entries = std::fs::read_dir(&self.root).map_err(|source| TemplateError::Scan {
            path: self.root.clone(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| TemplateError::Scan {
                path: self.root.clone(),
                source,
            })?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let manifest_path = entry.path().join(MANIFEST_FILE_NAME);
            if !manifest_path.exists() {
                continue;
            }

            let manifest = read_manifest(&manifest_path)?;
            discovered.insert(
                name.clone(),
                Template {
                    name,
                    manifest_path,
                    manifest,
                },
            );
        }

        *self.templates.write().unwrap() = discovered;
        Ok(())
    }
}

fn read_manifest(path: &Path) -> Result<TemplateManifest, TemplateError> {
    let contents = std::fs::read(path).map_err(|source| TemplateError::Scan {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&contents).map_err(|source| TemplateError::MalformedManifest {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_template(root: &Path, name: &str, manifest: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE_NAME), manifest).unwrap();
    }

    #[test]
    fn discovers_templates_with_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_template(
            dir.path(),
            "web",
            r#"{"image": "nginx:latest", "container_port": 80}"#,
        );
        write_template(dir.path(), "no-manifest", "");
        std::fs::remove_file(dir.path().join("no-manifest").join(MANIFEST_FILE_NAME)).ok();

        let registry = TemplateRegistry::load(dir.path()).unwrap();
        let names: Vec<_> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["web".to_string()]);

        let web = registry.get("web").unwrap();
        assert_eq!(web.manifest.image, "nginx:latest");
        assert_eq!(web.manifest.container_port, 80);
    }

    #[test]
    fn get_on_unknown_template_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TemplateRegistry::load(dir.path()).unwrap();
        assert!(matches!(
            registry.get("ghost"),
            Err(TemplateError::NotFound(_))
        ));
    }

    #[test]
    fn refresh_picks_up_newly_added_templates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TemplateRegistry::load(dir.path()).unwrap();
        assert!(registry.list().is_empty());

        write_template(dir.path(), "db", r#"{"image": "postgres:16"}"#);
        registry.refresh().unwrap();
        assert_eq!(registry.list().len(), 1);
    }
}
