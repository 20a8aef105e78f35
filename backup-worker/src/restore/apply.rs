//! Applying a committed restore entry on one replica.
//!
//! Every replica of a group runs the same stages from the same log entry, so
//! they end in the same state without talking to each other.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};

use super::load::load_chain;
use super::{RestoreRequest, RestoreStage};
use crate::cluster::{GroupId, LeaseKind, Proposal, ProposalApplier};
use crate::crypto::EncryptionKey;
use crate::tasks::Op;
use crate::worker::Worker;
use crate::{Result, WorkerError};

/// What one replica ended up with after applying a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub group_id: GroupId,
    pub restore_ts: u64,
    pub tablets: Vec<String>,
    pub records: usize,
    pub max_uid: u64,
    pub max_namespace: u64,
}

#[async_trait]
impl ProposalApplier for Worker {
    async fn apply(&self, proposal: &Proposal, index: u64) -> Result<()> {
        match proposal {
            Proposal::Restore(req) => self.apply_restore(req, index).await.map(|_| ()),
        }
    }
}

impl Worker {
    /// Run every restore stage for the entry at log `index`.
    ///
    /// A failure stops at the failing stage; the log keeps the entry and
    /// delivers it again.
    pub async fn apply_restore(&self, req: &RestoreRequest, index: u64) -> Result<RestoreOutcome> {
        let group = self.group_id;
        let restore_ts = req.restore_ts;
        let _task = self.tasks.start_task(Op::Restore, restore_ts)?;
        info!(group, restore_ts, index, location = %req.location, "Applying restore");

        let at = |stage: RestoreStage| {
            move |e: WorkerError| {
                error!(group, restore_ts, %stage, error = %e, "Restore stage failed");
                WorkerError::at_stage(stage, e)
            }
        };

        // Also aborts transactions started before the restore
        self.deps
            .storage
            .drop_all(restore_ts)
            .await
            .map_err(at(RestoreStage::DropExisting))?;

        let handler = self
            .deps
            .handlers
            .open(&req.location, &req.credentials)
            .map_err(at(RestoreStage::ReassignTablets))?;
        let chain = handler
            .get_manifests(&req.backup_id, req.backup_num)
            .await
            .map_err(at(RestoreStage::ReassignTablets))?;
        let last = chain
            .last()
            .ok_or_else(|| {
                WorkerError::ManifestMissing(format!("no backup manifests found at {}", req.location))
            })
            .map_err(at(RestoreStage::ReassignTablets))?;
        let tablets: Vec<String> = last
            .predicates_for(group)
            .map(<[String]>::to_vec)
            .ok_or_else(|| {
                WorkerError::ManifestMissing(format!(
                    "backup manifest does not contain information for group {}",
                    group
                ))
            })
            .map_err(at(RestoreStage::ReassignTablets))?;
        for predicate in &tablets {
            let tablet = self
                .deps
                .membership
                .force_tablet(predicate, group)
                .await
                .map_err(at(RestoreStage::ReassignTablets))?;
            if tablet.group_id != group {
                return Err(at(RestoreStage::ReassignTablets)(WorkerError::TabletAssignment {
                    predicate: predicate.clone(),
                    group,
                }));
            }
        }

        let key = self
            .restore_key(req)
            .map_err(at(RestoreStage::LoadData))?;
        let owned: BTreeSet<String> = tablets.iter().cloned().collect();
        let loaded = load_chain(handler.as_ref(), &chain, &owned, key.as_ref())
            .await
            .map_err(at(RestoreStage::LoadData))?;
        let records = loaded.records.len();
        self.deps
            .storage
            .write_batch(loaded.records, restore_ts)
            .await
            .map_err(at(RestoreStage::LoadData))?;

        self.deps
            .catalog
            .reload_schema()
            .await
            .map_err(at(RestoreStage::ReloadSchema))?;
        self.deps.catalog.reset_acl_cache();

        if loaded.max_uid > 0 {
            self.deps
                .id_lease
                .assign_ids(loaded.max_uid, LeaseKind::Uid)
                .await
                .map_err(at(RestoreStage::UpdateLeases))?;
        }
        if loaded.max_namespace > 0 {
            self.deps
                .id_lease
                .assign_ids(loaded.max_namespace, LeaseKind::NamespaceId)
                .await
                .map_err(at(RestoreStage::UpdateLeases))?;
        }

        if self.is_leader() {
            // Snapshot once the entry is applied so recovery never replays it
            let log = Arc::clone(&self.deps.log);
            tokio::spawn(async move {
                if let Err(e) = log.wait_for_applied_index(index).await {
                    error!(group, index, error = %e, "Error waiting for restore to be applied");
                    return;
                }
                match log.propose_snapshot().await {
                    Ok(()) => info!(group, index, "Snapshot proposed after restore"),
                    Err(e) => error!(group, index, error = %e, "Unable to propose snapshot after restore"),
                }
            });
        }

        self.deps
            .membership
            .update_membership_state()
            .await
            .map_err(at(RestoreStage::Done))?;

        info!(group, restore_ts, tablets = tablets.len(), records, "Restore applied");
        Ok(RestoreOutcome {
            group_id: group,
            restore_ts,
            tablets,
            records,
            max_uid: loaded.max_uid,
            max_namespace: loaded.max_namespace,
        })
    }

    /// Key named in the request, else the node's own key.
    fn restore_key(&self, req: &RestoreRequest) -> Result<Option<EncryptionKey>> {
        match &req.encryption_key_file {
            Some(path) => EncryptionKey::from_file(path).map(Some),
            None => Ok(self.encryption.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupRequest;
    use crate::cluster::local::{LocalCluster, MemMembership};
    use crate::cluster::{MembershipService, Oracle};
    use crate::crypto::KEY_LEN;
    use crate::destination::{BlobHandler, FileHandler};
    use crate::membership::{MembershipState, Tablet};
    use crate::worker::WorkerDeps;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn destination(dir: &TempDir) -> String {
        format!("file://{}", dir.path().display())
    }

    async fn restore_request(cluster: &LocalCluster, dir: &TempDir, group: GroupId) -> RestoreRequest {
        let mut req = RestoreRequest::new(destination(dir));
        req.group_id = group;
        req.restore_ts = cluster.oracle.next_timestamp().await.unwrap();
        req
    }

    #[tokio::test]
    async fn test_apply_restores_data_schema_and_leases() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.commit("name", 0, 41, b"alice").unwrap();
        cluster.commit("name", 7, 3, b"bob").unwrap();
        let group = cluster.group(1).unwrap();
        group
            .worker
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();

        cluster.commit("name", 0, 99, b"after backup").unwrap();
        let acl_resets = group.catalog.acl_resets();

        let req = restore_request(&cluster, &dir, 1).await;
        let outcome = group.worker.apply_restore(&req, 1).await.unwrap();

        assert_eq!(outcome.tablets, vec!["name".to_string()]);
        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.max_uid, 41);
        assert_eq!(outcome.max_namespace, 7);
        assert_eq!(group.storage.get("name", 0, 41), Some(b"alice".to_vec()));
        assert_eq!(group.storage.get("name", 0, 99), None);
        assert!(group.catalog.schema().contains("name"));
        assert_eq!(group.catalog.acl_resets(), acl_resets + 1);
        assert_eq!(cluster.id_lease.max_uid(), 41);
        assert_eq!(cluster.id_lease.max_namespace(), 7);
        assert!(!group.worker.tasks().is_running(Op::Restore));
    }

    #[tokio::test]
    async fn test_replayed_entry_yields_same_state() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1, 2]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.set_tablet("friend", 2);
        cluster.commit("name", 0, 1, b"alice").unwrap();
        cluster.commit("friend", 0, 1, b"0x2").unwrap();
        cluster
            .worker(1)
            .unwrap()
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();

        let group = cluster.group(2).unwrap();
        let proposal = Proposal::Restore(restore_request(&cluster, &dir, 2).await);

        group.worker.apply(&proposal, 1).await.unwrap();
        let tablets = cluster.membership.membership_state().groups;
        let schema = group.catalog.schema();
        let data = group.storage.get("friend", 0, 1);

        group.worker.apply(&proposal, 1).await.unwrap();
        assert_eq!(cluster.membership.membership_state().groups, tablets);
        assert_eq!(group.catalog.schema(), schema);
        assert_eq!(group.storage.get("friend", 0, 1), data);
        assert_eq!(data, Some(b"0x2".to_vec()));
    }

    #[tokio::test]
    async fn test_failed_stage_is_reported() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.commit("name", 0, 1, b"alice").unwrap();
        let group = cluster.group(1).unwrap();
        let manifest = group
            .worker
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();

        // Lose the payload after the manifest was written
        std::fs::remove_dir_all(dir.path().join(&manifest.path)).unwrap();

        let req = restore_request(&cluster, &dir, 1).await;
        let err = group.worker.apply_restore(&req, 1).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Apply {
                stage: RestoreStage::LoadData,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_manifest_without_group_is_rejected() {
        let dir = TempDir::new().unwrap();
        let source = LocalCluster::new(&[1]).unwrap();
        source.set_tablet("name", 1);
        source.commit("name", 0, 1, b"alice").unwrap();
        source
            .worker(1)
            .unwrap()
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();

        let target = LocalCluster::new(&[1, 5]).unwrap();
        target.set_tablet("email", 5);
        target.commit("email", 0, 2, b"bob@example.com").unwrap();

        let req = restore_request(&target, &dir, 5).await;
        let err = target
            .group(5)
            .unwrap()
            .worker
            .apply_restore(&req, 1)
            .await
            .unwrap_err();
        match err {
            WorkerError::Apply { stage, source } => {
                assert_eq!(stage, RestoreStage::ReassignTablets);
                assert!(matches!(*source, WorkerError::ManifestMissing(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Accepts every reassignment but hands the tablet to another group.
    struct RefusingMembership(Arc<MemMembership>);

    #[async_trait]
    impl MembershipService for RefusingMembership {
        async fn update_membership_state(&self) -> Result<()> {
            self.0.update_membership_state().await
        }

        fn membership_state(&self) -> MembershipState {
            self.0.membership_state()
        }

        async fn force_tablet(&self, predicate: &str, _group: GroupId) -> Result<Tablet> {
            Ok(Tablet {
                predicate: predicate.to_string(),
                group_id: 99,
                force: true,
            })
        }
    }

    #[tokio::test]
    async fn test_refused_tablet_move_stops_before_loading() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.commit("name", 0, 1, b"alice").unwrap();
        let group = cluster.group(1).unwrap();
        group
            .worker
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();

        let deps = WorkerDeps {
            membership: Arc::new(RefusingMembership(cluster.membership.clone())),
            ..group.worker.deps.clone()
        };
        let mut config = LocalCluster::local_config();
        config.node.group_id = 1;
        let worker = Worker::new(&config, deps).unwrap();

        let req = restore_request(&cluster, &dir, 1).await;
        let err = worker.apply_restore(&req, 1).await.unwrap_err();
        match err {
            WorkerError::Apply { stage, source } => {
                assert_eq!(stage, RestoreStage::ReassignTablets);
                assert!(matches!(
                    *source,
                    WorkerError::TabletAssignment { ref predicate, group: 1 } if predicate == "name"
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(group.storage.get("name", 0, 1), None);
    }

    #[tokio::test]
    async fn test_encrypted_restore_uses_request_key() {
        let dir = TempDir::new().unwrap();
        let key_dir = TempDir::new().unwrap();
        let key_file = key_dir.path().join("enc.key");
        std::fs::write(&key_file, [3u8; KEY_LEN]).unwrap();

        let mut config = LocalCluster::local_config();
        config.backup.encryption_key_file = Some(key_file.clone());
        let source = LocalCluster::with_config(&[1], config).unwrap();
        source.set_tablet("name", 1);
        source.commit("name", 0, 5, b"secret").unwrap();
        source
            .worker(1)
            .unwrap()
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();
        assert!(FileHandler::new(dir.path()).get_latest_manifest().await.unwrap().unwrap().encrypted);

        let target = LocalCluster::new(&[1]).unwrap();
        let group = target.group(1).unwrap();
        let mut req = restore_request(&target, &dir, 1).await;
        assert!(group.worker.apply_restore(&req, 1).await.is_err());

        req.encryption_key_file = Some(key_file);
        group.worker.apply_restore(&req, 1).await.unwrap();
        assert_eq!(group.storage.get("name", 0, 5), Some(b"secret".to_vec()));
    }

    #[tokio::test]
    async fn test_leader_snapshots_after_restore() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(&[1]).unwrap();
        cluster.set_tablet("name", 1);
        cluster.commit("name", 0, 1, b"alice").unwrap();
        let group = cluster.group(1).unwrap();
        group
            .worker
            .process_backup_request(BackupRequest::new(destination(&dir)), CancellationToken::new())
            .await
            .unwrap();

        let summary = group
            .worker
            .process_restore_request(RestoreRequest::new(destination(&dir)))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(summary.is_success(), "{:?}", summary.failed);

        let index = group.log.applied_index();
        tokio::time::timeout(std::time::Duration::from_secs(5), group.log.wait_for_snapshot(index))
            .await
            .unwrap();
        assert_eq!(group.log.retained_entries().await, 0);
        assert_eq!(group.log.replay().await.unwrap(), 0);
    }
}
