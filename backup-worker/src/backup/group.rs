//! Per-group backup: runs on a member of the group being backed up.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{BackupRequest, BackupResponse};
use crate::codec::{self, BackupPayload};
use crate::tasks::Op;
use crate::worker::Worker;
use crate::{Result, WorkerError};

impl Worker {
    /// Back up the predicates `req` assigns to this node's group.
    ///
    /// Cancellation is honoured until the payload starts being written; after
    /// that the write runs to completion.
    pub async fn backup_current_group(
        &self,
        req: BackupRequest,
        cancel: CancellationToken,
    ) -> Result<BackupResponse> {
        info!(group = req.group_id, read_ts = req.read_ts, "Backup request");
        if cancel.is_cancelled() {
            error!(group = req.group_id, "Context cancelled before backup started");
            return Err(WorkerError::Cancelled);
        }

        if self.group_id != req.group_id {
            return Err(WorkerError::GroupMismatch {
                mine: self.group_id,
                requested: req.group_id,
            });
        }

        tokio::select! {
            res = self.deps.oracle.wait_for_ts(req.read_ts) => res?,
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
        }

        let _task = self.tasks.start_task(Op::Backup, req.read_ts)?;
        self.write_backup(&req).await
    }

    /// Route a group backup to this node or to any member of the target group.
    pub(crate) async fn backup_group(
        self: Arc<Self>,
        req: BackupRequest,
        cancel: CancellationToken,
    ) -> Result<BackupResponse> {
        if self.group_id == req.group_id {
            return self.backup_current_group(req, cancel).await;
        }

        let group = req.group_id;
        let peer = self.deps.peers.any_server(group).ok_or_else(|| {
            error!(group, "Couldn't find a server in group");
            WorkerError::NoConnection(group)
        })?;
        peer.backup(req, cancel).await.map_err(|e| {
            error!(group, error = %e, "Backup error");
            e
        })
    }

    async fn write_backup(&self, req: &BackupRequest) -> Result<BackupResponse> {
        let handler = self
            .deps
            .handlers
            .open(&req.destination, &req.credentials)?;

        let records = self
            .deps
            .storage
            .scan(&req.predicates, req.since_ts, req.read_ts)
            .await?;
        let drop_operations = self
            .deps
            .storage
            .drop_history(req.since_ts, req.read_ts)
            .await?;
        let record_count = records.len();

        let payload = BackupPayload {
            group_id: req.group_id,
            read_ts: req.read_ts,
            since_ts: req.since_ts,
            records,
        };
        let level = self.compression_level;
        let key = self.encryption.clone();
        let data =
            tokio::task::spawn_blocking(move || codec::encode(&payload, level, key.as_ref()))
                .await??;
        let bytes = data.len();

        handler
            .write_payload(&req.path(), req.group_id, req.read_ts, data)
            .await?;

        info!(
            group = req.group_id,
            read_ts = req.read_ts,
            since_ts = req.since_ts,
            predicates = req.predicates.len(),
            records = record_count,
            bytes,
            drops = drop_operations.len(),
            "Group backup written"
        );

        Ok(BackupResponse { drop_operations })
    }
}
