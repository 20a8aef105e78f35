//! Cluster-wide restores.
//!
//! A restore is dispatched by a coordinator to the leader of every group as a
//! proposal on that group's consensus log, then applied by every replica when
//! the log delivers it (see `apply`).

pub mod apply;
pub mod coordinator;
pub mod load;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::cluster::GroupId;
use crate::destination::Credentials;

pub use apply::RestoreOutcome;
pub use coordinator::{RestoreDispatch, RestoreSummary, RetryDecision};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Source URI holding the manifest chain
    pub location: String,
    /// Chain to restore; empty picks the most recent chain
    #[serde(default)]
    pub backup_id: String,
    /// Last backup of the chain to restore; 0 picks the latest
    #[serde(default)]
    pub backup_num: u64,
    #[serde(default)]
    pub credentials: Credentials,
    /// Key for encrypted chains
    #[serde(default)]
    pub encryption_key_file: Option<PathBuf>,

    // Filled in by the coordinator before dispatch
    #[serde(default)]
    pub group_id: GroupId,
    #[serde(default)]
    pub restore_ts: u64,
}

impl RestoreRequest {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Default::default()
        }
    }
}

/// Steps a replica runs, in order, when it applies a restore entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStage {
    DropExisting,
    ReassignTablets,
    LoadData,
    ReloadSchema,
    UpdateLeases,
    ProposeSnapshot,
    Done,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStage::DropExisting => "drop_existing",
            RestoreStage::ReassignTablets => "reassign_tablets",
            RestoreStage::LoadData => "load_data",
            RestoreStage::ReloadSchema => "reload_schema",
            RestoreStage::UpdateLeases => "update_leases",
            RestoreStage::ProposeSnapshot => "propose_snapshot",
            RestoreStage::Done => "done",
        };
        f.write_str(name)
    }
}
