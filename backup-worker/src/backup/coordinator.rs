//! Cluster-wide backup coordination.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{BackupRequest, BackupResponse};
use crate::cluster::GroupId;
use crate::manifest::{DropOperation, Manifest, ManifestDraft};
use crate::worker::Worker;
use crate::{Result, WorkerError};

impl Worker {
    /// Back up every group at a single read timestamp and append the result to
    /// the destination's manifest chain.
    ///
    /// Nothing is written to the chain unless every group succeeds.
    pub async fn process_backup_request(
        self: &Arc<Self>,
        mut req: BackupRequest,
        cancel: CancellationToken,
    ) -> Result<Manifest> {
        if let Err(e) = self.health_check() {
            error!(error = %e, "Backup cancelled, not ready to accept requests");
            return Err(e);
        }

        let _lock = self
            .backup_lock
            .try_lock()
            .map_err(|_| WorkerError::BackupInProgress)?;

        let attempt = self.metrics.start();

        req.read_ts = self
            .deps
            .oracle
            .read_only_timestamp()
            .await
            .map_err(|e| {
                error!(error = %e, "Unable to retrieve readonly timestamp for backup");
                e
            })?;
        req.unix_ts = Utc::now().format("%Y%m%d.%H%M%S%.3f").to_string();

        // The previous manifest decides where this backup starts.
        let handler = self
            .deps
            .handlers
            .open(&req.destination, &req.credentials)?;
        let latest = handler.get_latest_manifest().await?;
        req.since_ts = since_ts_for(latest.as_ref(), req.force_full, self.encrypted())?;

        self.deps.membership.update_membership_state().await?;
        let predicates = self.deps.membership.membership_state().predicate_map();

        info!(
            read_ts = req.read_ts,
            since_ts = req.since_ts,
            unix_ts = %req.unix_ts,
            destination = %req.destination,
            groups = ?predicates.keys().collect::<Vec<_>>(),
            "Created backup request"
        );

        let drop_operations = self.fan_out_backup(&req, &predicates, &cancel).await?;

        let manifest = Manifest::chained(
            latest.as_ref(),
            ManifestDraft {
                read_ts: req.read_ts,
                since_ts: req.since_ts,
                path: req.path(),
                groups: predicates,
                drop_operations,
                encrypted: self.encrypted(),
            },
        )?;
        handler.write_manifest(&manifest).await?;

        info!(
            backup_id = %manifest.backup_id,
            backup_num = manifest.backup_num,
            backup_type = %manifest.manifest_type,
            read_ts = manifest.read_ts,
            "Backup completed"
        );
        attempt.succeed();
        Ok(manifest)
    }

    /// Spawn one group backup per group and join all of them. The first
    /// failure cancels the groups that have not started writing yet.
    async fn fan_out_backup(
        self: &Arc<Self>,
        req: &BackupRequest,
        predicates: &BTreeMap<GroupId, Vec<String>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DropOperation>> {
        let cancel = cancel.child_token();
        let _cancel_on_exit = cancel.clone().drop_guard();

        let (tx, mut rx) = mpsc::channel::<(GroupId, Result<BackupResponse>)>(predicates.len().max(1));
        for (group, preds) in predicates {
            let mut group_req = req.clone();
            group_req.group_id = *group;
            group_req.predicates = preds.clone();

            let worker = Arc::clone(self);
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let group = group_req.group_id;
                let res = worker.backup_group(group_req, cancel).await;
                let _ = tx.send((group, res)).await;
            });
        }
        drop(tx);

        let mut drop_operations = Vec::new();
        for _ in 0..predicates.len() {
            match rx.recv().await {
                Some((_, Ok(res))) => drop_operations.extend(res.drop_operations),
                Some((group, Err(e))) => {
                    error!(group, error = %e, "Error received during backup");
                    return Err(e);
                }
                None => {
                    return Err(WorkerError::Rpc(
                        "backup fan-out ended before every group answered".to_string(),
                    ))
                }
            }
        }

        // A cluster-wide drop is reported by every group
        drop_operations.sort_by_key(|op| op.ts);
        drop_operations.dedup();
        Ok(drop_operations)
    }
}

/// Lower bound of the next backup: 0 for a new chain, otherwise the read
/// timestamp of the latest manifest, whose encryption state must match ours.
fn since_ts_for(latest: Option<&Manifest>, force_full: bool, encrypted: bool) -> Result<u64> {
    if force_full {
        return Ok(0);
    }
    let Some(latest) = latest else {
        return Ok(0);
    };

    match (latest.encrypted, encrypted) {
        (false, true) => Err(WorkerError::EncryptionMismatch(
            "latest manifest indicates the last backup was not encrypted \
             but this instance has encryption turned on"
                .to_string(),
        )),
        (true, false) => Err(WorkerError::EncryptionMismatch(
            "latest manifest indicates the last backup was encrypted \
             but this instance has encryption turned off"
                .to_string(),
        )),
        _ => Ok(latest.valid_read_ts()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::local::LocalCluster;
    use crate::cluster::MembershipService;
    use crate::crypto::KEY_LEN;
    use crate::destination::{BlobHandler, FileHandler};
    use crate::manifest::{DropOp, ManifestType};
    use crate::tasks::Op;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn destination(dir: &TempDir) -> String {
        format!("file://{}", dir.path().display())
    }

    #[tokio::test]
    async fn test_first_forced_full_backup() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.commit("name", 0, 1, b"alice").unwrap();

        let coordinator = cluster.worker(1).unwrap();
        let manifest = coordinator
            .process_backup_request(
                BackupRequest::new(destination(&dir)).force_full(true),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(manifest.manifest_type, ManifestType::Full);
        assert_eq!(manifest.backup_num, 1);
        assert_eq!(manifest.since_ts, 0);
        assert_eq!(coordinator.metrics().snapshot().succeeded, 1);

        let stored = FileHandler::new(dir.path())
            .get_latest_manifest()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, manifest);
    }

    #[tokio::test]
    async fn test_second_backup_is_incremental() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.commit("name", 0, 1, b"alice").unwrap();
        let coordinator = cluster.worker(1).unwrap();

        let first = coordinator
            .process_backup_request(
                BackupRequest::new(destination(&dir)).force_full(true),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        cluster.commit("name", 0, 2, b"bob").unwrap();
        let second = coordinator
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(second.manifest_type, ManifestType::Incremental);
        assert_eq!(second.backup_num, 2);
        assert_eq!(second.since_ts, first.read_ts);
        assert_eq!(second.backup_id, first.backup_id);
        assert!(second.read_ts > first.read_ts);

        // Forcing a full backup starts a new chain regardless of history
        let third = coordinator
            .process_backup_request(
                BackupRequest::new(destination(&dir)).force_full(true),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(third.since_ts, 0);
        assert_eq!(third.backup_num, 1);
        assert_ne!(third.backup_id, first.backup_id);
    }

    #[tokio::test]
    async fn test_fan_out_covers_every_group() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1, 2, 3]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.set_tablet("age", 1);
        cluster.set_tablet("friend", 2);
        cluster.set_tablet("email", 3);
        cluster.commit("friend", 0, 7, b"0x8").unwrap();

        // Coordinate from group 2 so groups 1 and 3 are reached through peers
        let manifest = cluster
            .worker(2)
            .unwrap()
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manifest.groups.len(), 3);
        let all: Vec<String> = manifest.groups.values().flatten().cloned().collect();
        let unique: BTreeSet<String> = all.iter().cloned().collect();
        assert_eq!(all.len(), unique.len());
        assert_eq!(unique, cluster.membership.membership_state().predicates());

        for group in [1, 2, 3] {
            let file = dir
                .path()
                .join(&manifest.path)
                .join(crate::manifest::payload_name(manifest.read_ts, group));
            assert!(file.exists(), "missing payload for group {}", group);
        }
    }

    #[tokio::test]
    async fn test_encryption_mismatch_rejected_before_fan_out() {
        let dir = TempDir::new().unwrap();
        let key_dir = TempDir::new().unwrap();
        let key_file = key_dir.path().join("enc.key");
        std::fs::write(&key_file, [9u8; KEY_LEN]).unwrap();

        let mut encrypted_config = LocalCluster::local_config();
        encrypted_config.backup.encryption_key_file = Some(key_file);
        let encrypted = LocalCluster::with_config(&[1], encrypted_config).unwrap();
        encrypted.set_tablet("name", 1);
        let manifest = encrypted
            .worker(1)
            .unwrap()
            .process_backup_request(
                BackupRequest::new(destination(&dir)).force_full(true),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(manifest.encrypted);

        let plain = LocalCluster::new(&[1]).unwrap();
        plain.set_tablet("name", 1);
        let coordinator = plain.worker(1).unwrap();
        let result = coordinator
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(WorkerError::EncryptionMismatch(_))));
        assert_eq!(coordinator.metrics().snapshot().failed, 1);
        // No group was asked to write anything
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().is_dir())
            .count();
        assert_eq!(backups, 1);
        assert_eq!(FileHandler::new(dir.path()).list_manifests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_group_failure_aborts_backup() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1, 2]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.set_tablet("friend", 2);

        // Group 2 is busy with a restore, so its backup is refused
        let _busy = cluster
            .worker(2)
            .unwrap()
            .tasks()
            .start_task(Op::Restore, 1)
            .unwrap();

        let coordinator = cluster.worker(1).unwrap();
        let result = coordinator
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(WorkerError::TaskConflict { .. })));
        assert!(FileHandler::new(dir.path()).list_manifests().await.unwrap().is_empty());
        assert_eq!(coordinator.metrics().snapshot().failed, 1);
        assert_eq!(coordinator.metrics().snapshot().pending, 0);
    }

    #[tokio::test]
    async fn test_not_ready_and_concurrent_backups_rejected() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1]).unwrap();
        let coordinator = cluster.worker(1).unwrap();

        coordinator.set_ready(false);
        let result = coordinator
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(WorkerError::NotReady(_))));
        coordinator.set_ready(true);

        let _held = coordinator.backup_lock.lock().await;
        let result = coordinator
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(WorkerError::BackupInProgress)));
    }

    #[tokio::test]
    async fn test_cancelled_backup_never_starts() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1]).unwrap();
        cluster.set_tablet("name", 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cluster
            .worker(1)
            .unwrap()
            .process_backup_request(BackupRequest::new(destination(&dir)), cancel)
            .await;

        assert!(matches!(result, Err(WorkerError::Cancelled)));
        assert!(FileHandler::new(dir.path()).list_manifests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_backup_writes_no_group_payload() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1, 2]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.set_tablet("friend", 2);
        cluster.commit("friend", 0, 7, b"0x8").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cluster
            .worker(1)
            .unwrap()
            .process_backup_request(BackupRequest::new(destination(&dir)), cancel)
            .await;
        assert!(matches!(result, Err(WorkerError::Cancelled)));

        // Let any stray group task finish before looking at the destination
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let written: Vec<_> = walk(dir.path())
            .into_iter()
            .filter(|name| name.ends_with(".backup"))
            .collect();
        assert!(written.is_empty(), "payloads written after cancel: {:?}", written);
    }

    fn walk(dir: &std::path::Path) -> Vec<String> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                names.extend(walk(&path));
            } else {
                names.push(path.file_name().unwrap().to_string_lossy().into_owned());
            }
        }
        names
    }

    #[tokio::test]
    async fn test_drop_operations_recorded_once() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1, 2]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.set_tablet("friend", 2);
        cluster.commit("name", 0, 1, b"alice").unwrap();
        let coordinator = cluster.worker(1).unwrap();

        let first = coordinator
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();
        assert!(first.drop_operations.is_empty());

        cluster.drop_predicate("name").unwrap();
        cluster.drop_all().unwrap();

        let second = coordinator
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();
        let ops: Vec<DropOp> = second.drop_operations.iter().map(|d| d.op).collect();
        assert_eq!(ops, vec![DropOp::Attr, DropOp::All]);
    }

    #[test]
    fn test_since_ts_rules() {
        let latest = Manifest::chained(
            None,
            ManifestDraft {
                read_ts: 40,
                since_ts: 0,
                path: "backup.x".to_string(),
                groups: BTreeMap::new(),
                drop_operations: vec![],
                encrypted: false,
            },
        )
        .unwrap();

        assert_eq!(since_ts_for(None, false, true).unwrap(), 0);
        assert_eq!(since_ts_for(Some(&latest), false, false).unwrap(), 40);
        assert_eq!(since_ts_for(Some(&latest), true, false).unwrap(), 0);
        assert_eq!(since_ts_for(Some(&latest), true, true).unwrap(), 0);
        assert!(matches!(
            since_ts_for(Some(&latest), false, true),
            Err(WorkerError::EncryptionMismatch(_))
        ));
    }
}
