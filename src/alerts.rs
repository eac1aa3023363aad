//! Alert store & broadcast bus: append-only alerts with idempotent
//! coalescing, plus a bounded fan-out so slow subscribers coalesce or
//! drop updates rather than stalling the loops that raise them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::repository::AlertRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    // Ordered Low < Medium < High < Critical for `.max()` coalescing.
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub cluster_id: String,
    pub severity: Severity,
    pub kind: String,
    pub message: String,
    pub opened_at_ms: u64,
    pub last_seen_ms: u64,
    pub resolved_at_ms: Option<u64>,
    pub resolution_note: Option<String>,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        self.resolved_at_ms.is_none()
    }
}

#[derive(Debug, Clone)]
pub enum AlertEvent {
    Opened(Alert),
    Updated(Alert),
    Resolved(Alert),
}

/// Capacity of the broadcast channel handed to every subscriber. A
/// subscriber that falls this far behind starts missing the oldest events
/// instead of blocking the publisher (`broadcast::Receiver::recv` reports
/// `Lagged` to the caller, which is expected to resync from
/// [`AlertBoard::list_for_cluster`]).
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct AlertBoard {
    repo: Arc<dyn AlertRepository>,
    events: broadcast::Sender<AlertEvent>,
    coalesce_window_ms: RwLock<u64>,
}

impl AlertBoard {
    pub fn new(repo: Arc<dyn AlertRepository>) -> Self {
        Self::with_coalesce_window(repo, 60_000)
    }

    pub fn with_coalesce_window(repo: Arc<dyn AlertRepository>, coalesce_window_ms: u64) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            repo,
            events,
            coalesce_window_ms: RwLock::new(coalesce_window_ms),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    /// Raises an alert for `(cluster_id, kind)`. If an open alert for that
    /// pair already exists and was last seen within the coalesce window, its
    /// `last_seen_ms`/message/severity are updated in place instead of
    /// opening a new one.
    pub async fn raise(
        &self,
        cluster_id: &str,
        kind: &str,
        severity: Severity,
        message: impl Into<String>,
        mut id_factory: impl FnMut() -> String,
        now_ms: u64,
    ) -> Alert {
        let window = *self.coalesce_window_ms.read().await;
        if let Some(mut existing) = self.repo.find_open(cluster_id, kind).await {
            if now_ms.saturating_sub(existing.last_seen_ms) <= window {
                existing.last_seen_ms = now_ms;
                existing.severity = severity.max(existing.severity);
                existing.message = message.into();
                let updated = self.repo.upsert(existing).await;
                let _ = self.events.send(AlertEvent::Updated(updated.clone()));
                return updated;
            }
        }

        let alert = Alert {
            id: id_factory(),
            cluster_id: cluster_id.to_string(),
            severity,
            kind: kind.to_string(),
            message: message.into(),
            opened_at_ms: now_ms,
            last_seen_ms: now_ms,
            resolved_at_ms: None,
            resolution_note: None,
        };
        let inserted = self.repo.upsert(alert).await;
        let _ = self.events.send(AlertEvent::Opened(inserted.clone()));
        inserted
    }

    pub async fn resolve(&self, alert_id: &str, note: impl Into<String>, now_ms: u64) -> Option<Alert> {
        let resolved = self.repo.resolve(alert_id, note.into(), now_ms).await?;
        let _ = self.events.send(AlertEvent::Resolved(resolved.clone()));
        Some(resolved)
    }

    pub async fn list_for_cluster(&self, cluster_id: &str) -> Vec<Alert> {
        self.repo.list_for_cluster(cluster_id).await
    }
}
