//! Restore dispatch: verify the chain, pick one restore timestamp and hand a
//! proposal to the leader of every group.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::RestoreRequest;
use crate::cluster::{GroupId, Proposal};
use crate::tasks::Op;
use crate::worker::Worker;
use crate::{Result, WorkerError};

/// Outcome of every group's proposal, gathered after the dispatch returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub restore_ts: u64,
    pub restored: Vec<GroupId>,
    pub failed: BTreeMap<GroupId, String>,
}

impl RestoreSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A restore whose proposals are still in flight.
#[must_use = "dropping the dispatch detaches the restore; call wait() to observe it"]
pub struct RestoreDispatch {
    pub restore_ts: u64,
    pub groups: Vec<GroupId>,
    handle: JoinHandle<RestoreSummary>,
}

impl RestoreDispatch {
    pub async fn wait(self) -> Result<RestoreSummary> {
        Ok(self.handle.await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
}

/// Whether a failed restore proposal is worth another attempt.
///
/// Only transport and routing failures are retried. Anything raised while
/// proposing, and any error not listed here, fails the group immediately.
pub fn retry_decision(err: &WorkerError) -> RetryDecision {
    match err {
        WorkerError::NoConnection(_)
        | WorkerError::ConsensusNotInitialized
        | WorkerError::NotServingGroup(_)
        | WorkerError::GroupMismatch { .. }
        | WorkerError::WaitForTs { .. } => RetryDecision::Retry,
        _ => RetryDecision::Fail,
    }
}

impl Worker {
    /// Validate `req` and dispatch it to every group.
    ///
    /// Returns once the proposals are dispatched; the returned handle resolves
    /// when every group has either applied the restore or given up.
    pub async fn process_restore_request(
        self: &Arc<Self>,
        mut req: RestoreRequest,
    ) -> Result<RestoreDispatch> {
        if req.location.is_empty() {
            return Err(WorkerError::InvalidRequest(
                "restore request must name a location".to_string(),
            ));
        }

        self.deps.membership.update_membership_state().await?;
        let groups = self.deps.membership.membership_state().group_ids();

        // Only guards restores coordinated from this node
        if self.tasks.is_running(Op::Restore) {
            return Err(WorkerError::RestoreInProgress);
        }

        req.credentials.validate()?;
        self.verify_backup(&req, &groups).await.map_err(|e| {
            error!(location = %req.location, error = %e, "Error while verifying backup");
            e
        })?;

        req.restore_ts = self.deps.oracle.next_timestamp().await?;
        info!(
            location = %req.location,
            backup_id = %req.backup_id,
            backup_num = req.backup_num,
            restore_ts = req.restore_ts,
            groups = ?groups,
            "Dispatching restore"
        );

        let (tx, mut rx) = mpsc::channel::<(GroupId, Result<()>)>(groups.len().max(1));
        for group in &groups {
            let mut group_req = req.clone();
            group_req.group_id = *group;

            let worker = Arc::clone(self);
            let tx = tx.clone();
            // Detached from the caller: work already dispatched is not cancelled
            tokio::spawn(async move {
                let group = group_req.group_id;
                let res = worker.try_restore_proposal(group_req).await;
                let _ = tx.send((group, res)).await;
            });
        }
        drop(tx);

        let restore_ts = req.restore_ts;
        let expected = groups.len();
        let handle = tokio::spawn(async move {
            let mut summary = RestoreSummary {
                restore_ts,
                ..Default::default()
            };
            for _ in 0..expected {
                match rx.recv().await {
                    Some((group, Ok(()))) => summary.restored.push(group),
                    Some((group, Err(e))) => {
                        error!(group, restore_ts, error = %e, "Error while restoring group");
                        summary.failed.insert(group, e.to_string());
                    }
                    None => break,
                }
            }
            summary.restored.sort_unstable();
            if summary.is_success() {
                info!(restore_ts, groups = summary.restored.len(), "Restore finished");
            }
            summary
        });

        Ok(RestoreDispatch {
            restore_ts,
            groups,
            handle,
        })
    }

    /// The chain must be readable and record exactly the current set of groups.
    async fn verify_backup(&self, req: &RestoreRequest, groups: &[GroupId]) -> Result<()> {
        let handler = self.deps.handlers.open(&req.location, &req.credentials)?;
        let chain = handler.get_manifests(&req.backup_id, req.backup_num).await?;
        let last = chain.last().ok_or_else(|| {
            WorkerError::ManifestMissing(format!("no manifests found at {}", req.location))
        })?;

        // Appliers fall back to their own key when the request names none
        if chain.iter().any(|m| m.encrypted)
            && req.encryption_key_file.is_none()
            && !self.encrypted()
        {
            return Err(WorkerError::Verify(
                "backup is encrypted but no encryption key was given or configured".to_string(),
            ));
        }

        let current: BTreeSet<GroupId> = groups.iter().copied().collect();
        let recorded: BTreeSet<GroupId> = last.groups.keys().copied().collect();
        if current != recorded {
            return Err(WorkerError::Verify(format!(
                "backup has groups {:?} but the cluster has groups {:?}",
                recorded, current
            )));
        }
        Ok(())
    }

    /// Propose the restore for one group, retrying transient failures with a
    /// fixed backoff.
    pub(crate) async fn try_restore_proposal(&self, req: RestoreRequest) -> Result<()> {
        let group = req.group_id;
        let max_attempts = self.restore_policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.propose_restore_or_send(&req).await {
                Ok(()) => {
                    info!(group, attempt, restore_ts = req.restore_ts, "Restore proposal accepted");
                    return Ok(());
                }
                Err(e) => e,
            };

            if retry_decision(&err) == RetryDecision::Fail || attempt >= max_attempts {
                return Err(err);
            }
            warn!(group, attempt, error = %err, "Restore proposal failed, retrying");
            tokio::time::sleep(self.restore_policy.retry_backoff()).await;
        }
    }

    /// Propose locally when this node leads the group, otherwise send to the
    /// group's leader.
    async fn propose_restore_or_send(&self, req: &RestoreRequest) -> Result<()> {
        if self.serves_group(req.group_id) && self.is_leader() {
            return self.handle_restore_rpc(req.clone()).await;
        }

        let leader = self
            .deps
            .peers
            .leader(req.group_id)
            .ok_or(WorkerError::NoConnection(req.group_id))?;
        leader.restore(req.clone()).await
    }

    /// Serve a restore sent by a coordinator: wait for the restore timestamp
    /// and propose the request on this group's log.
    pub(crate) async fn handle_restore_rpc(&self, req: RestoreRequest) -> Result<()> {
        if !self.serves_group(req.group_id) {
            return Err(WorkerError::NotServingGroup(req.group_id));
        }

        let restore_ts = req.restore_ts;
        self.deps
            .oracle
            .wait_for_ts(restore_ts)
            .await
            .map_err(|e| WorkerError::WaitForTs {
                ts: restore_ts,
                reason: e.to_string(),
            })?;

        match self.deps.log.propose(Proposal::Restore(req)).await {
            Ok(index) => {
                info!(restore_ts, index, "Restore proposal applied");
                Ok(())
            }
            Err(WorkerError::ConsensusNotInitialized) => Err(WorkerError::ConsensusNotInitialized),
            Err(e) => Err(WorkerError::RestoreProposal(Box::new(e))),
        }
    }
}
