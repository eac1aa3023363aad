//! Cluster lifecycle engine: the only component permitted to create
//! clusters or mutate their lifecycle fields. Each operation here is a
//! transactional boundary: on failure after partial side effects it
//! unwinds what it already did before surfacing the error.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::{SystemTime, UNIX_EPOCH},
};

use ferroid::{base32::Base32UlidExt, id::ULID};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{
    auth::{authorize, AuthError, Principal},
    cluster::{naming, BackupPolicy, Cluster, ClusterState, Quotas, RecoveryPolicy},
    ports::{PortAllocator, PortError},
    repository::ClusterRepository,
    runtime::{EnvVars, ResourceLimits, RuntimeDriver, RuntimeError},
    templates::{TemplateError, TemplateRegistry},
    workspace::{WorkspaceError, WorkspaceManager},
};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("cluster not found: {0}")]
    NotFound(String),
    #[error("operation not valid in state {0:?}")]
    IllegalState(ClusterState),
    #[error("invalid quota: {0}")]
    InvalidQuota(&'static str),
    #[error("could not find a non-colliding name after {0} attempts")]
    NameConflict(u32),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Fine-grained per-cluster locks: a map keyed by cluster id, entries
/// allocated on first use and never removed. Lifecycle operations take a
/// lock blocking; the recovery loop takes it non-blocking and skips its
/// tick on contention rather than waiting.
#[derive(Debug, Default)]
pub struct ClusterLocks {
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, cluster_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(cluster_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn lock(&self, cluster_id: &str) -> OwnedMutexGuard<()> {
        self.entry(cluster_id).lock_owned().await
    }

    pub fn try_lock(&self, cluster_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(cluster_id).try_lock_owned().ok()
    }
}

fn new_id() -> String {
    ULID::from_datetime(SystemTime::now()).encode().to_string()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn limits_of(quotas: Quotas) -> ResourceLimits {
    ResourceLimits {
        cpu_cores: quotas.cpu_cores,
        memory_mb: quotas.memory_mb,
        disk_gb: quotas.disk_gb,
        network_mbps: quotas.network_mbps,
    }
}

#[derive(Debug)]
pub struct ClusterEngine {
    repo: Arc<dyn ClusterRepository>,
    templates: Arc<TemplateRegistry>,
    ports: Arc<PortAllocator>,
    workspaces: Arc<WorkspaceManager>,
    runtime: Arc<dyn RuntimeDriver>,
    locks: Arc<ClusterLocks>,
}

impl ClusterEngine {
    pub fn new(
        repo: Arc<dyn ClusterRepository>,
        templates: Arc<TemplateRegistry>,
        ports: Arc<PortAllocator>,
        workspaces: Arc<WorkspaceManager>,
        runtime: Arc<dyn RuntimeDriver>,
        locks: Arc<ClusterLocks>,
    ) -> Self {
        Self {
            repo,
            templates,
            ports,
            workspaces,
            runtime,
            locks,
        }
    }

    pub fn locks(&self) -> Arc<ClusterLocks> {
        self.locks.clone()
    }

    pub async fn create(
        &self,
        principal: &Principal,
        template_name: &str,
        base_name: Option<&str>,
        quotas: Option<Quotas>,
        owner_id: &str,
    ) -> Result<Cluster, LifecycleError> {
        authorize(principal, owner_id)?;

        let template = self.templates.get(template_name)?;
        let quotas = quotas.unwrap_or(template.manifest.default_quotas);
        quotas.validate()?;

        let id = new_id();
        let mut suffix = naming::suffix_from_id(&id);
        let mut name = naming::generate_name(base_name, template_name, &suffix);
        let mut attempts = 1;
        while self.repo.get_by_name(&name).await.is_some() {
            if attempts >= naming::MAX_NAMING_ATTEMPTS {
                return Err(LifecycleError::NameConflict(attempts));
            }
            suffix = naming::suffix_from_id(&new_id());
            name = naming::generate_name(base_name, template_name, &suffix);
            attempts += 1;
        }

        let _guard = self.locks.lock(&id).await;

        let port = self.ports.acquire()?;

        let workspace_path = match self
            .workspaces
            .create(&id, &name, port, &template.manifest, &quotas)
        {
            Ok(path) => path,
            Err(err) => {
                self.ports.release(port);
                return Err(err.into());
            }
        };

        let container_id = match self
            .runtime
            .run(
                &name,
                &template.manifest.image,
                &workspace_path,
                port,
                template.manifest.container_port,
                &EnvVars::default(),
                limits_of(quotas),
            )
            .await
        {
            Ok(container_id) => container_id,
            Err(err) => {
                let _ = self.workspaces.destroy(&id);
                self.ports.release(port);
                return Err(err.into());
            }
        };

        let now = now_ms();
        let cluster = Cluster {
            id,
            name,
            template_name: template_name.to_string(),
            owner_id: owner_id.to_string(),
            created_at_ms: now,
            host_port: port,
            workspace_path,
            container_id: Some(container_id),
            quotas,
            state: ClusterState::Running,
            restart_attempts: 0,
            last_transition_ms: now,
            recovery_policy: RecoveryPolicy::default(),
            backup_policy: BackupPolicy::default(),
        };
        self.repo.insert(cluster.clone()).await;
        Ok(cluster)
    }

    pub async fn start(&self, principal: &Principal, id: &str) -> Result<Cluster, LifecycleError> {
        let _guard = self.locks.lock(id).await;
        let mut cluster = self
            .repo
            .get(id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        authorize(principal, &cluster.owner_id)?;

        if !matches!(cluster.state, ClusterState::Stopped | ClusterState::Failed) {
            return Err(LifecycleError::IllegalState(cluster.state));
        }

        let container_id = cluster
            .container_id
            .clone()
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        self.runtime.start_existing(&container_id).await?;
        self.runtime
            .update_limits(&container_id, limits_of(cluster.quotas))
            .await?;

        cluster.state = ClusterState::Running;
        cluster.last_transition_ms = now_ms();
        self.repo.update(cluster.clone()).await;
        Ok(cluster)
    }

    pub async fn stop(&self, principal: &Principal, id: &str, grace_seconds: u32) -> Result<Cluster, LifecycleError> {
        let _guard = self.locks.lock(id).await;
        let mut cluster = self
            .repo
            .get(id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        authorize(principal, &cluster.owner_id)?;

        if cluster.state != ClusterState::Running {
            return Err(LifecycleError::IllegalState(cluster.state));
        }

        let container_id = cluster
            .container_id
            .clone()
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        self.runtime.stop(&container_id, grace_seconds).await?;

        cluster.state = ClusterState::Stopped;
        cluster.last_transition_ms = now_ms();
        self.repo.update(cluster.clone()).await;
        Ok(cluster)
    }

    /// Delete ordering is load-bearing: stop, remove container, remove
    /// workspace, release port, persist `DELETED`. A crash between steps
    /// must still converge, which is why `remove` tolerates an
    /// already-gone container and `destroy`/`release` are idempotent.
    pub async fn delete(&self, principal: &Principal, id: &str) -> Result<(), LifecycleError> {
        let _guard = self.locks.lock(id).await;
        let mut cluster = self
            .repo
            .get(id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        authorize(principal, &cluster.owner_id)?;

        if cluster.state == ClusterState::Deleted {
            return Err(LifecycleError::IllegalState(cluster.state));
        }

        if let Some(container_id) = cluster.container_id.clone() {
            if cluster.state == ClusterState::Running {
                self.runtime.stop(&container_id, 10).await?;
            }
            match self.runtime.remove(&container_id).await {
                Ok(()) | Err(RuntimeError::RuntimeNotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.workspaces.destroy(id)?;
        self.ports.release(cluster.host_port);

        cluster.state = ClusterState::Deleted;
        cluster.container_id = None;
        cluster.last_transition_ms = now_ms();
        self.repo.update(cluster).await;
        Ok(())
    }

    pub async fn update_limits(
        &self,
        principal: &Principal,
        id: &str,
        quotas: Quotas,
    ) -> Result<Cluster, LifecycleError> {
        quotas.validate()?;

        let _guard = self.locks.lock(id).await;
        let mut cluster = self
            .repo
            .get(id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        authorize(principal, &cluster.owner_id)?;

        if cluster.state == ClusterState::Deleted || cluster.state.is_transient() {
            return Err(LifecycleError::IllegalState(cluster.state));
        }

        if cluster.state == ClusterState::Running {
            if let Some(container_id) = &cluster.container_id {
                self.runtime.update_limits(container_id, limits_of(quotas)).await?;
            }
        }

        cluster.quotas = quotas;
        cluster.last_transition_ms = now_ms();
        self.repo.update(cluster.clone()).await;
        Ok(cluster)
    }

    pub async fn get(&self, principal: &Principal, id: &str) -> Result<Cluster, LifecycleError> {
        let cluster = self
            .repo
            .get(id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        authorize(principal, &cluster.owner_id)?;
        Ok(cluster)
    }

    /// Non-admins can only ever see their own clusters — `owner_filter` is
    /// honored as given for an admin, and forced to the principal's own id
    /// otherwise.
    pub async fn list(&self, principal: &Principal, owner_filter: Option<&str>) -> Vec<Cluster> {
        let effective_filter = if principal.is_admin {
            owner_filter
        } else {
            Some(principal.user_id.as_str())
        };
        self.repo.list(effective_filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{repository::InMemoryClusterRepository, runtime::FakeRuntime, templates::TemplateRegistry};

    fn write_template(root: &std::path::Path, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            r#"{"image": "nginx:latest", "container_port": 80}"#,
        )
        .unwrap();
    }

    struct Harness {
        engine: ClusterEngine,
        _templates_dir: tempfile::TempDir,
        _workspaces_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let templates_dir = tempfile::tempdir().unwrap();
        write_template(templates_dir.path(), "web");
        let workspaces_dir = tempfile::tempdir().unwrap();

        let engine = ClusterEngine::new(
            Arc::new(InMemoryClusterRepository::default()),
            Arc::new(TemplateRegistry::load(templates_dir.path()).unwrap()),
            Arc::new(PortAllocator::new(crate::config::PortRange::new(30000, 30010).unwrap())),
            Arc::new(WorkspaceManager::new(workspaces_dir.path())),
            Arc::new(FakeRuntime::new()),
            Arc::new(ClusterLocks::new()),
        );

        Harness {
            engine,
            _templates_dir: templates_dir,
            _workspaces_dir: workspaces_dir,
        }
    }

    #[tokio::test]
    async fn create_inserts_running_cluster() {
        let h = harness();
        let alice = Principal::user("alice");
        let cluster = h
            .engine
            .create(&alice, "web", Some("demo"), None, "alice")
            .await
            .unwrap();
        assert_eq!(cluster.state, ClusterState::Running);
        assert!(cluster.name.starts_with("demo-web-"));
        assert!(cluster.container_id.is_some());

        let fetched = h.engine.get(&alice, &cluster.id).await.unwrap();
        assert_eq!(fetched.id, cluster.id);
    }

    #[tokio::test]
    async fn create_with_invalid_quota_is_rejected() {
        let h = harness();
        let bad = Quotas {
            cpu_cores: 0.0,
            memory_mb: 512,
            disk_gb: 1,
            network_mbps: 0,
        };
        let alice = Principal::user("alice");
        let err = h
            .engine
            .create(&alice, "web", None, Some(bad), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidQuota(_)));
    }

    #[tokio::test]
    async fn start_on_running_cluster_is_illegal_state() {
        let h = harness();
        let alice = Principal::user("alice");
        let cluster = h.engine.create(&alice, "web", None, None, "alice").await.unwrap();
        let err = h.engine.start(&alice, &cluster.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::IllegalState(ClusterState::Running)));
    }

    #[tokio::test]
    async fn stop_then_start_roundtrips_to_running() {
        let h = harness();
        let alice = Principal::user("alice");
        let cluster = h.engine.create(&alice, "web", None, None, "alice").await.unwrap();

        let stopped = h.engine.stop(&alice, &cluster.id, 5).await.unwrap();
        assert_eq!(stopped.state, ClusterState::Stopped);

        let restarted = h.engine.start(&alice, &cluster.id).await.unwrap();
        assert_eq!(restarted.state, ClusterState::Running);
    }

    #[tokio::test]
    async fn delete_releases_port_and_removes_workspace() {
        let h = harness();
        let alice = Principal::user("alice");
        let cluster = h.engine.create(&alice, "web", None, None, "alice").await.unwrap();
        let workspace_path = cluster.workspace_path.clone();
        let port = cluster.host_port;

        h.engine.delete(&alice, &cluster.id).await.unwrap();

        assert!(!workspace_path.exists());
        let deleted = h.engine.get(&alice, &cluster.id).await.unwrap();
        assert_eq!(deleted.state, ClusterState::Deleted);

        let reacquired = h.engine.create(&alice, "web", None, None, "alice").await.unwrap();
        assert_eq!(reacquired.host_port, port);
    }

    #[tokio::test]
    async fn update_limits_while_running_reapplies_immediately() {
        let h = harness();
        let alice = Principal::user("alice");
        let cluster = h.engine.create(&alice, "web", None, None, "alice").await.unwrap();
        let bigger = Quotas {
            cpu_cores: 2.0,
            memory_mb: 1024,
            disk_gb: 2,
            network_mbps: 100,
        };
        let updated = h.engine.update_limits(&alice, &cluster.id, bigger).await.unwrap();
        assert_eq!(updated.quotas.memory_mb, 1024);
    }

    #[tokio::test]
    async fn update_limits_on_deleted_cluster_is_illegal_state() {
        let h = harness();
        let alice = Principal::user("alice");
        let cluster = h.engine.create(&alice, "web", None, None, "alice").await.unwrap();
        h.engine.delete(&alice, &cluster.id).await.unwrap();

        let err = h
            .engine
            .update_limits(&alice, &cluster.id, Quotas::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::IllegalState(ClusterState::Deleted)));
    }

    #[tokio::test]
    async fn list_filters_by_owner() {
        let h = harness();
        let alice = Principal::user("alice");
        let bob = Principal::user("bob");
        let admin = Principal::admin("root");
        h.engine.create(&alice, "web", None, None, "alice").await.unwrap();
        h.engine.create(&bob, "web", None, None, "bob").await.unwrap();

        assert_eq!(h.engine.list(&alice, Some("alice")).await.len(), 1);
        assert_eq!(h.engine.list(&admin, None).await.len(), 2);
    }
}
