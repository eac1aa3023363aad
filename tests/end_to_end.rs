//! Cross-component scenarios: the lifecycle engine, health loop, metrics
//! engine and backup engine wired together against a shared in-memory
//! cluster repository and [`FakeRuntime`], the way an embedder would
//! assemble the crate around a real Docker daemon.

use std::sync::Arc;

use clusterforge::{
    alerts::{AlertBoard, AlertEvent, Severity},
    auth::Principal,
    backup::{BackupEngine, BackupKind},
    cluster::{ClusterEngine, ClusterLocks, ClusterState},
    config::{HealthConfig, PortRange},
    health::HealthLoop,
    metrics::MetricsEngine,
    ports::PortAllocator,
    repository::{
        ClusterRepository, InMemoryAlertRepository, InMemoryBackupRepository,
        InMemoryClusterRepository, InMemoryHealthSampleRepository,
        InMemoryMetricsSampleRepository,
    },
    runtime::{FakeRuntime, StatsResult},
    templates::TemplateRegistry,
    workspace::WorkspaceManager,
    Quotas,
};

fn write_template(root: &std::path::Path, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("manifest.json"),
        r#"{"image": "nginx:latest", "container_port": 80}"#,
    )
    .unwrap();
}

struct Stack {
    engine: Arc<ClusterEngine>,
    cluster_repo: Arc<InMemoryClusterRepository>,
    runtime: Arc<FakeRuntime>,
    alerts: Arc<AlertBoard>,
    health: HealthLoop,
    metrics: MetricsEngine,
    backups: BackupEngine,
    _templates_dir: tempfile::TempDir,
    _workspaces_dir: tempfile::TempDir,
    _backups_dir: tempfile::TempDir,
}

fn build_stack(port_range: PortRange) -> Stack {
    let templates_dir = tempfile::tempdir().unwrap();
    write_template(templates_dir.path(), "web");
    let workspaces_dir = tempfile::tempdir().unwrap();
    let backups_dir = tempfile::tempdir().unwrap();

    let cluster_repo = Arc::new(InMemoryClusterRepository::default());
    let runtime = Arc::new(FakeRuntime::new());
    let locks = Arc::new(ClusterLocks::new());

    let engine = Arc::new(ClusterEngine::new(
        cluster_repo.clone(),
        Arc::new(TemplateRegistry::load(templates_dir.path()).unwrap()),
        Arc::new(PortAllocator::new(port_range)),
        Arc::new(WorkspaceManager::new(workspaces_dir.path())),
        runtime.clone(),
        locks.clone(),
    ));

    let alerts = Arc::new(AlertBoard::new(Arc::new(InMemoryAlertRepository::default())));

    let health = HealthLoop::new(
        cluster_repo.clone(),
        Arc::new(InMemoryHealthSampleRepository::default()),
        runtime.clone(),
        engine.clone(),
        locks,
        alerts.clone(),
        HealthConfig {
            tcp_timeout: std::time::Duration::from_millis(50),
            ..HealthConfig::default()
        },
    );

    let metrics = MetricsEngine::new(
        cluster_repo.clone(),
        Arc::new(InMemoryMetricsSampleRepository::default()),
        runtime.clone(),
        Default::default(),
    );

    let backups = BackupEngine::new(
        cluster_repo.clone(),
        Arc::new(InMemoryBackupRepository::default()),
        engine.clone(),
        alerts.clone(),
        backups_dir.path(),
    );

    Stack {
        engine,
        cluster_repo,
        runtime,
        alerts,
        health,
        metrics,
        backups,
        _templates_dir: templates_dir,
        _workspaces_dir: workspaces_dir,
        _backups_dir: backups_dir,
    }
}

#[tokio::test]
async fn full_lifecycle_round_trip() {
    let stack = build_stack(PortRange::new(31000, 31010).unwrap());

    let alice = Principal::user("alice");
    let cluster = stack
        .engine
        .create(&alice, "web", Some("demo"), None, "alice")
        .await
        .unwrap();
    assert_eq!(cluster.state, ClusterState::Running);

    let stopped = stack.engine.stop(&alice, &cluster.id, 5).await.unwrap();
    assert_eq!(stopped.state, ClusterState::Stopped);

    let restarted = stack.engine.start(&alice, &cluster.id).await.unwrap();
    assert_eq!(restarted.state, ClusterState::Running);

    stack.engine.delete(&alice, &cluster.id).await.unwrap();
    let deleted = stack.engine.get(&alice, &cluster.id).await.unwrap();
    assert_eq!(deleted.state, ClusterState::Deleted);
    assert!(!cluster.workspace_path.exists());
}

#[tokio::test]
async fn auto_recovery_restarts_a_crashed_cluster() {
    let stack = build_stack(PortRange::new(31100, 31110).unwrap());
    let alice = Principal::user("alice");
    let cluster = stack.engine.create(&alice, "web", None, None, "alice").await.unwrap();
    let container_id = cluster.container_id.clone().unwrap();

    stack.runtime.kill(&container_id, 137);
    stack.health.tick(1_000).await;

    let failed = stack.cluster_repo.get(&cluster.id).await.unwrap();
    assert_eq!(failed.state, ClusterState::Failed);

    // The next tick attempts a restart; FakeRuntime.start_existing always
    // succeeds, so the cluster converges back to RUNNING with no further
    // crash injected.
    stack.health.tick(1_500).await;
    let recovered = stack.cluster_repo.get(&cluster.id).await.unwrap();
    assert_eq!(recovered.state, ClusterState::Running);
    assert_eq!(recovered.restart_attempts, 1);
}

#[tokio::test]
async fn persistent_failure_enters_cooldown_and_raises_a_critical_alert() {
    let stack = build_stack(PortRange::new(31200, 31210).unwrap());
    let alice = Principal::user("alice");
    let cluster = stack.engine.create(&alice, "web", None, None, "alice").await.unwrap();
    let mut rx = stack.alerts.subscribe();

    // Each 60s tick clears the backoff window (capped at 30s), so every
    // FAILED-state tick bumps `restart_attempts` until cooldown kicks in.
    // The exit code changes every iteration so the identical-failure
    // shortcut doesn't short-circuit this before attempts are exhausted.
    let mut now = 0u64;
    let mut saw_cooldown_alert = false;
    for i in 0..30i64 {
        let current = stack.cluster_repo.get(&cluster.id).await.unwrap();
        if let Some(container_id) = &current.container_id {
            stack.runtime.kill(container_id, 1 + (i % 7));
        }
        stack.health.tick(now).await;
        now += 60_000;

        while let Ok(event) = rx.try_recv() {
            if let AlertEvent::Opened(alert) = event {
                if alert.kind == "recovery-cooldown" && alert.severity == Severity::Critical {
                    saw_cooldown_alert = true;
                }
            }
        }
        if saw_cooldown_alert {
            break;
        }
    }

    assert!(saw_cooldown_alert);
    let final_state = stack.cluster_repo.get(&cluster.id).await.unwrap();
    assert_eq!(final_state.state, ClusterState::Failed);
    assert!(final_state.restart_attempts >= final_state.recovery_policy.max_attempts);
}

#[tokio::test]
async fn quota_update_while_running_is_reflected_in_the_next_metrics_sample() {
    let stack = build_stack(PortRange::new(31300, 31310).unwrap());
    let alice = Principal::user("alice");
    let cluster = stack.engine.create(&alice, "web", None, None, "alice").await.unwrap();
    let container_id = cluster.container_id.clone().unwrap();

    stack.runtime.set_stats(
        &container_id,
        StatsResult {
            cpu_usage_nanos: 1_000_000_000,
            mem_usage_bytes: 256 * 1024 * 1024,
            ..Default::default()
        },
    );

    stack.metrics.tick(1_000).await;
    let before = stack.metrics.snapshot(&alice).await;
    let cpu_pct_before = before[&cluster.id].cpu_pct;

    let doubled = Quotas {
        cpu_cores: 2.0,
        ..cluster.quotas
    };
    stack.engine.update_limits(&alice, &cluster.id, doubled).await.unwrap();

    stack.metrics.tick(2_000).await;
    let after = stack.metrics.snapshot(&alice).await;
    let cpu_pct_after = after[&cluster.id].cpu_pct;

    assert!(cpu_pct_after < cpu_pct_before);
}

#[tokio::test]
async fn port_is_reclaimed_after_delete_once_the_range_is_exhausted() {
    let stack = build_stack(PortRange::new(31400, 31402).unwrap());
    let alice = Principal::user("alice");

    let first = stack.engine.create(&alice, "web", None, None, "alice").await.unwrap();
    let _second = stack.engine.create(&alice, "web", None, None, "alice").await.unwrap();

    let err = stack
        .engine
        .create(&alice, "web", None, None, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, clusterforge::cluster::LifecycleError::Port(_)));

    let freed_port = first.host_port;
    stack.engine.delete(&alice, &first.id).await.unwrap();

    let third = stack.engine.create(&alice, "web", None, None, "alice").await.unwrap();
    assert_eq!(third.host_port, freed_port);
}

#[tokio::test]
async fn backup_restores_onto_a_freshly_created_target_cluster() {
    let stack = build_stack(PortRange::new(31500, 31510).unwrap());
    let alice = Principal::user("alice");
    let source = stack.engine.create(&alice, "web", None, None, "alice").await.unwrap();
    std::fs::write(source.workspace_path.join("state.txt"), b"snapshot-me").unwrap();

    let backup = stack
        .backups
        .snapshot(&source, BackupKind::Full, "backup-1".to_string(), 1_000)
        .await
        .unwrap();

    let restored = stack
        .backups
        .restore(&backup.id, Some("cluster-that-does-not-exist-yet"))
        .await
        .unwrap();

    assert_ne!(restored.id, source.id);
    assert_eq!(restored.template_name, "web");
    let restored_file = std::fs::read(restored.workspace_path.join("state.txt")).unwrap();
    assert_eq!(restored_file, b"snapshot-me");
}
