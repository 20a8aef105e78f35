use backup_worker::cluster::local::{LocalGroup, SharedServices};
use backup_worker::restore::RestoreSummary;
use backup_worker::Worker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Running,
    Finished,
    Failed,
}

/// A restore dispatched from this node, polled by id.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreStatus {
    pub id: String,
    pub restore_ts: u64,
    pub groups: Vec<u32>,
    pub phase: RestorePhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<RestoreSummary>,
}

pub struct AppState {
    pub node: LocalGroup,
    pub restores: DashMap<String, RestoreStatus>,
    /// Cancelled on shutdown; backups started over HTTP derive from it
    pub shutdown: CancellationToken,
    /// Set on the node hosting the cluster's control plane
    pub authority: Option<SharedServices>,
}

impl AppState {
    pub fn new(node: LocalGroup, shutdown: CancellationToken) -> Self {
        Self {
            node,
            restores: DashMap::new(),
            shutdown,
            authority: None,
        }
    }

    pub fn with_authority(mut self, shared: SharedServices) -> Self {
        self.authority = Some(shared);
        self
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.node.worker
    }
}
