//! A worker node: one replica of one group, plus the cluster-wide
//! coordination entry points it can serve.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backup::{BackupRequest, BackupResponse};
use crate::cluster::{
    ConsensusLog, GroupId, IdLease, MembershipService, Oracle, PeerRouter, SchemaCatalog, Storage,
    WorkerClient,
};
use crate::config::{Config, RestoreConfig};
use crate::crypto::EncryptionKey;
use crate::destination::{Credentials, HandlerFactory};
use crate::manifest::Manifest;
use crate::metrics::BackupMetrics;
use crate::restore::RestoreRequest;
use crate::tasks::TaskTracker;
use crate::{Result, WorkerError};

/// Collaborators a worker is wired to.
#[derive(Clone)]
pub struct WorkerDeps {
    pub oracle: Arc<dyn Oracle>,
    pub log: Arc<dyn ConsensusLog>,
    pub storage: Arc<dyn Storage>,
    pub catalog: Arc<dyn SchemaCatalog>,
    pub membership: Arc<dyn MembershipService>,
    pub id_lease: Arc<dyn IdLease>,
    pub handlers: Arc<dyn HandlerFactory>,
    pub peers: Arc<dyn PeerRouter>,
}

pub struct Worker {
    pub(crate) node_id: String,
    pub(crate) group_id: GroupId,
    pub(crate) deps: WorkerDeps,
    pub(crate) tasks: TaskTracker,
    /// Serializes backups coordinated by this node
    pub(crate) backup_lock: tokio::sync::Mutex<()>,
    pub(crate) metrics: BackupMetrics,
    pub(crate) encryption: Option<EncryptionKey>,
    pub(crate) compression_level: i32,
    pub(crate) restore_policy: RestoreConfig,
    ready: AtomicBool,
}

impl Worker {
    pub fn new(config: &Config, deps: WorkerDeps) -> Result<Self> {
        let encryption = config
            .backup
            .encryption_key_file
            .as_deref()
            .map(EncryptionKey::from_file)
            .transpose()?;

        Ok(Self {
            node_id: config.node.id.clone(),
            group_id: config.node.group_id,
            deps,
            tasks: TaskTracker::new(),
            backup_lock: tokio::sync::Mutex::new(()),
            metrics: BackupMetrics::default(),
            encryption,
            compression_level: config.backup.compression_level,
            restore_policy: config.restore.clone(),
            ready: AtomicBool::new(true),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn serves_group(&self, group: GroupId) -> bool {
        self.group_id == group
    }

    pub fn is_leader(&self) -> bool {
        self.deps.log.am_leader()
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn metrics(&self) -> &BackupMetrics {
        &self.metrics
    }

    pub fn encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn health_check(&self) -> Result<()> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WorkerError::NotReady(format!(
                "node {} is still starting up or shutting down",
                self.node_id
            )))
        }
    }

    /// Every manifest at `location`, in the order they were written.
    pub async fn list_backups(
        &self,
        location: &str,
        credentials: &Credentials,
    ) -> Result<Vec<Manifest>> {
        let handler = self.deps.handlers.open(location, credentials)?;
        handler.list_manifests().await.map_err(|e| {
            tracing::error!(location, error = %e, "Cannot read manifests");
            e
        })
    }
}

/// Entry points served to peers (and to this node's own fan-out).
#[async_trait]
impl WorkerClient for Worker {
    async fn backup(&self, req: BackupRequest, cancel: CancellationToken) -> Result<BackupResponse> {
        tracing::debug!(group = req.group_id, read_ts = req.read_ts, "Received backup request from peer");
        self.backup_current_group(req, cancel).await
    }

    async fn restore(&self, req: RestoreRequest) -> Result<()> {
        self.handle_restore_rpc(req).await
    }
}
