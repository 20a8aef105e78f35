//! Cluster-wide backups.
//!
//! The coordinator picks one read timestamp for the whole cluster, asks every
//! group to back up its predicates as of that timestamp and, once every group
//! has succeeded, appends a manifest to the destination's chain.

pub mod coordinator;
pub mod group;

use serde::{Deserialize, Serialize};

use crate::cluster::GroupId;
use crate::destination::Credentials;
use crate::manifest::{backup_path, DropOperation};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupRequest {
    /// Destination URI (`file:///...` or a local path)
    pub destination: String,
    #[serde(default)]
    pub credentials: Credentials,
    /// Start a new chain even if the destination already has one
    #[serde(default)]
    pub force_full: bool,

    // Filled in by the coordinator before fan-out
    #[serde(default)]
    pub read_ts: u64,
    #[serde(default)]
    pub since_ts: u64,
    #[serde(default)]
    pub group_id: GroupId,
    #[serde(default)]
    pub predicates: Vec<String>,
    /// UTC time of the request, `%Y%m%d.%H%M%S%.3f`; names the backup directory
    #[serde(default)]
    pub unix_ts: String,
}

impl BackupRequest {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn force_full(mut self, force_full: bool) -> Self {
        self.force_full = force_full;
        self
    }

    /// Directory holding this backup's payloads.
    pub fn path(&self) -> String {
        backup_path(&self.unix_ts)
    }
}

/// What one group reports back to the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupResponse {
    pub drop_operations: Vec<DropOperation>,
}
