//! Process entry point: assembles the control-plane components against a
//! real Docker daemon and in-memory repositories, then runs the health,
//! metrics and backup loops on their own intervals until shutdown.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use clusterforge::{
    alerts::AlertBoard,
    backup::BackupEngine,
    cluster::{ClusterEngine, ClusterLocks},
    config::Config,
    health::HealthLoop,
    metrics::MetricsEngine,
    repository::{
        ClusterRepository, InMemoryAlertRepository, InMemoryBackupRepository,
        InMemoryClusterRepository, InMemoryHealthSampleRepository,
        InMemoryMetricsSampleRepository,
    },
    runtime::BollardRuntime,
    templates::TemplateRegistry,
    workspace::WorkspaceManager,
};
use ferroid::{base32::Base32UlidExt, id::ULID};
use tokio::time::interval;

fn new_id() -> String {
    ULID::from_datetime(SystemTime::now()).encode().to_string()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            log::error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let templates = match TemplateRegistry::load(config.templates_root.clone()) {
        Ok(templates) => Arc::new(templates),
        Err(err) => {
            log::error!("failed to load templates from {:?}: {err}", config.templates_root);
            std::process::exit(1);
        }
    };

    let runtime = match BollardRuntime::connect(config.runtime_timeouts.call, config.runtime_timeouts.stats) {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => {
            log::error!("failed to connect to container runtime: {err}");
            std::process::exit(1);
        }
    };

    let cluster_repo = Arc::new(InMemoryClusterRepository::default());
    let health_repo = Arc::new(InMemoryHealthSampleRepository::default());
    let metrics_repo = Arc::new(InMemoryMetricsSampleRepository::default());
    let alert_repo = Arc::new(InMemoryAlertRepository::default());
    let backup_repo = Arc::new(InMemoryBackupRepository::default());

    let live_clusters = cluster_repo.list_non_deleted().await;
    let live_ids: Vec<String> = live_clusters.iter().map(|cluster| cluster.id.clone()).collect();
    let held_ports: Vec<u16> = live_clusters.iter().map(|cluster| cluster.host_port).collect();

    let workspaces = Arc::new(WorkspaceManager::new(config.workspaces_root.clone()));
    match workspaces.garbage_collect(&live_ids) {
        Ok(removed) if !removed.is_empty() => {
            log::info!("garbage-collected {} orphaned workspace(s): {removed:?}", removed.len());
        }
        Ok(_) => {}
        Err(err) => log::error!("workspace garbage collection failed: {err}"),
    }

    let ports = Arc::new(clusterforge::ports::PortAllocator::seeded(config.port_range, held_ports));
    let locks = Arc::new(ClusterLocks::new());

    let engine = Arc::new(ClusterEngine::new(
        cluster_repo.clone(),
        templates,
        ports,
        workspaces,
        runtime.clone(),
        locks.clone(),
    ));

    let alerts = Arc::new(AlertBoard::new(alert_repo));

    let health = Arc::new(HealthLoop::new(
        cluster_repo.clone(),
        health_repo,
        runtime.clone(),
        engine.clone(),
        locks,
        alerts.clone(),
        config.health.clone(),
    ));

    let metrics = Arc::new(MetricsEngine::new(
        cluster_repo.clone(),
        metrics_repo,
        runtime,
        config.metrics,
    ));

    let backups = Arc::new(BackupEngine::new(
        cluster_repo,
        backup_repo,
        engine,
        alerts,
        config.backups_root.clone(),
    ));

    log::info!("clusterforge control plane starting up");

    let health_task = tokio::spawn({
        let health = health.clone();
        let mut ticker = interval(config.health.interval);
        async move {
            loop {
                ticker.tick().await;
                health.tick(now_ms()).await;
            }
        }
    });

    let metrics_task = tokio::spawn({
        let metrics = metrics.clone();
        let mut ticker = interval(config.metrics.interval);
        async move {
            loop {
                ticker.tick().await;
                metrics.tick(now_ms()).await;
            }
        }
    });

    let backup_task = tokio::spawn({
        let backups = backups.clone();
        let mut ticker = interval(config.backup.scheduler_tick);
        async move {
            loop {
                ticker.tick().await;
                backups.tick(now_ms(), new_id).await;
            }
        }
    });

    shutdown_signal().await;
    log::info!("shutdown signal received, stopping background loops");

    health_task.abort();
    metrics_task.abort();
    backup_task.abort();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    log::error!("failed to install SIGTERM handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
