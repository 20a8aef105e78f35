//! Interfaces to the collaborators this crate coordinates but does not own:
//! the timestamp oracle, each group's consensus log, the storage engine, the
//! schema catalog, the control-plane membership service, the id lease
//! authority and the peer transport.

pub mod local;
pub mod peers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backup::{BackupRequest, BackupResponse};
use crate::manifest::DropOperation;
use crate::membership::{MembershipState, Tablet};
use crate::restore::RestoreRequest;
use crate::Result;

pub type GroupId = u32;

/// Transaction timestamp oracle.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// A timestamp at which every committed transaction is visible.
    async fn read_only_timestamp(&self) -> Result<u64>;

    /// A fresh timestamp, greater than any handed out before.
    async fn next_timestamp(&self) -> Result<u64>;

    /// Wait until the local replica has applied every transaction up to `ts`.
    async fn wait_for_ts(&self, ts: u64) -> Result<()>;
}

/// Entries carried by a group's replicated log that this crate produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Proposal {
    Restore(RestoreRequest),
}

/// Callback invoked by a consensus log for every committed entry, in log order.
#[async_trait]
pub trait ProposalApplier: Send + Sync {
    async fn apply(&self, proposal: &Proposal, index: u64) -> Result<()>;
}

/// One group's consensus log.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Propose an entry and wait until it is applied locally. Returns its index.
    async fn propose(&self, proposal: Proposal) -> Result<u64>;

    fn am_leader(&self) -> bool;

    async fn wait_for_applied_index(&self, index: u64) -> Result<()>;

    /// Snapshot the applied state and truncate the log behind it.
    async fn propose_snapshot(&self) -> Result<()>;
}

/// A single versioned value of one predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRecord {
    pub predicate: String,
    pub namespace: u64,
    pub uid: u64,
    pub value: Vec<u8>,
    /// Commit timestamp of this value
    pub version: u64,
}

/// Key-value storage engine of the local replica.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Latest value of every key of `predicates` visible at `read_ts` and
    /// committed after `since_ts`.
    async fn scan(&self, predicates: &[String], since_ts: u64, read_ts: u64)
        -> Result<Vec<KvRecord>>;

    /// Drop operations committed in `(since_ts, read_ts]`, in commit order.
    async fn drop_history(&self, since_ts: u64, read_ts: u64) -> Result<Vec<DropOperation>>;

    /// Write `records` as committed at `ts`.
    async fn write_batch(&self, records: Vec<KvRecord>, ts: u64) -> Result<()>;

    /// Remove all data and abort transactions started before `ts`.
    async fn drop_all(&self, ts: u64) -> Result<()>;
}

/// Predicate/type schema and the authorization cache derived from it.
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    async fn reload_schema(&self) -> Result<()>;

    fn reset_acl_cache(&self);
}

/// Control-plane record of which group owns which predicate.
#[async_trait]
pub trait MembershipService: Send + Sync {
    /// Refresh the local view from the control plane.
    async fn update_membership_state(&self) -> Result<()>;

    fn membership_state(&self) -> MembershipState;

    /// Assign `predicate` to `group` even if another group serves it.
    async fn force_tablet(&self, predicate: &str, group: GroupId) -> Result<Tablet>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseKind {
    Uid,
    NamespaceId,
}

/// Cluster-wide id allocator.
#[async_trait]
pub trait IdLease: Send + Sync {
    /// Make sure ids up to and including `value` are never handed out again.
    async fn assign_ids(&self, value: u64, kind: LeaseKind) -> Result<()>;
}

/// Point-to-point calls served by every node.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Cancelling `cancel` abandons the call if the group has not started
    /// writing its payload.
    async fn backup(&self, req: BackupRequest, cancel: CancellationToken) -> Result<BackupResponse>;

    async fn restore(&self, req: RestoreRequest) -> Result<()>;
}

/// Resolves connections to members of other groups.
pub trait PeerRouter: Send + Sync {
    fn any_server(&self, group: GroupId) -> Option<Arc<dyn WorkerClient>>;

    fn leader(&self, group: GroupId) -> Option<Arc<dyn WorkerClient>>;
}
