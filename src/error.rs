//! Crate-wide error taxonomy.
//!
//! Mirrors the layering the rest of the crate uses: each component owns a
//! narrow error enum (`runtime::RuntimeError`, `cluster::LifecycleError`,
//! `backup::BackupError`, ...) and this top-level enum collects them with
//! `#[from]` so callers that don't care which component failed can just
//! match on [`ClusterForgeError`].

use crate::{
    auth::AuthError, backup::BackupError, cluster::LifecycleError, config::ConfigurationError,
    ports::PortError, runtime::RuntimeError, templates::TemplateError, workspace::WorkspaceError,
};

pub type Result<T> = std::result::Result<T, ClusterForgeError>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterForgeError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("operation not valid in current state: {0}")]
    IllegalState(String),
    #[error("uniqueness violation: {0}")]
    Conflict(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
