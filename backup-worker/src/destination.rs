//! Backup destinations.
//!
//! A destination holds the master manifest plus one payload file per group per
//! backup. Only local paths (`file://` or bare) are served here; object stores
//! are reached through other `HandlerFactory` implementations.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cluster::GroupId;
use crate::manifest::{payload_name, Manifest, MasterManifest, MANIFEST_VERSION, MASTER_MANIFEST};
use crate::{Result, WorkerError};

/// Credentials for object-store destinations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub session_token: String,
    #[serde(default)]
    pub anonymous: bool,
}

impl Credentials {
    /// Accept anonymous access, a complete key pair, or no keys at all
    /// (ambient credentials). A half-filled pair is rejected.
    pub fn validate(&self) -> Result<()> {
        if self.anonymous {
            return Ok(());
        }
        match (self.access_key.is_empty(), self.secret_key.is_empty()) {
            (true, true) if self.session_token.is_empty() => Ok(()),
            (false, false) => Ok(()),
            _ => Err(WorkerError::InvalidCredentials(
                "access key and secret key must be provided together".to_string(),
            )),
        }
    }
}

#[async_trait]
pub trait BlobHandler: Send + Sync {
    /// Most recently written manifest, if any backup exists at the destination.
    async fn get_latest_manifest(&self) -> Result<Option<Manifest>>;

    /// Chain prefix `[1..backup_num]` of `backup_id` (see `manifests_to_restore`).
    async fn get_manifests(&self, backup_id: &str, backup_num: u64) -> Result<Vec<Manifest>>;

    /// Every manifest at the destination, in write order.
    async fn list_manifests(&self) -> Result<Vec<Manifest>>;

    async fn write_payload(&self, path: &str, group: GroupId, read_ts: u64, data: Bytes)
        -> Result<()>;

    async fn read_payload(&self, path: &str, group: GroupId, read_ts: u64) -> Result<Bytes>;

    /// Append `manifest` to the master manifest atomically.
    async fn write_manifest(&self, manifest: &Manifest) -> Result<()>;
}

pub trait HandlerFactory: Send + Sync {
    fn open(&self, location: &str, credentials: &Credentials) -> Result<Arc<dyn BlobHandler>>;
}

/// Dispatches on the location's URI scheme.
#[derive(Debug, Clone, Default)]
pub struct UriHandlerFactory;

impl HandlerFactory for UriHandlerFactory {
    fn open(&self, location: &str, credentials: &Credentials) -> Result<Arc<dyn BlobHandler>> {
        credentials.validate()?;
        if location.is_empty() {
            return Err(WorkerError::InvalidRequest(
                "backup location cannot be empty".to_string(),
            ));
        }
        match location.split_once("://") {
            Some(("file", path)) => Ok(Arc::new(FileHandler::new(path))),
            Some((scheme, _)) => Err(WorkerError::Handler(format!(
                "unsupported destination scheme: {}",
                scheme
            ))),
            None => Ok(Arc::new(FileHandler::new(location))),
        }
    }
}

/// Destination on a local or mounted filesystem.
#[derive(Debug, Clone)]
pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_master(&self) -> Result<MasterManifest> {
        let path = self.root.join(MASTER_MANIFEST);
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MasterManifest::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn payload_path(&self, path: &str, group: GroupId, read_ts: u64) -> PathBuf {
        self.root.join(path).join(payload_name(read_ts, group))
    }
}

#[async_trait]
impl BlobHandler for FileHandler {
    async fn get_latest_manifest(&self) -> Result<Option<Manifest>> {
        Ok(self.read_master().await?.latest().cloned())
    }

    async fn get_manifests(&self, backup_id: &str, backup_num: u64) -> Result<Vec<Manifest>> {
        let master = self.read_master().await?;
        crate::manifest::manifests_to_restore(&master.manifests, backup_id, backup_num)
    }

    async fn list_manifests(&self) -> Result<Vec<Manifest>> {
        Ok(self.read_master().await?.manifests)
    }

    async fn write_payload(
        &self,
        path: &str,
        group: GroupId,
        read_ts: u64,
        data: Bytes,
    ) -> Result<()> {
        let file = self.payload_path(path, group, read_ts);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(path = %file.display(), bytes = data.len(), "Writing backup payload");
        tokio::fs::write(&file, &data).await?;
        Ok(())
    }

    async fn read_payload(&self, path: &str, group: GroupId, read_ts: u64) -> Result<Bytes> {
        let file = self.payload_path(path, group, read_ts);
        match tokio::fs::read(&file).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(WorkerError::ManifestMissing(
                format!("payload {} is missing", file.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let mut master = self.read_master().await?;
        master.format_version = MANIFEST_VERSION;
        master.manifests.push(manifest.clone());

        // Write to a temp file then rename so readers never see a torn chain
        let tmp = self.root.join(format!("{}.tmp", MASTER_MANIFEST));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&master)?).await?;
        tokio::fs::rename(&tmp, self.root.join(MASTER_MANIFEST)).await?;

        info!(
            backup_id = %manifest.backup_id,
            backup_num = manifest.backup_num,
            read_ts = manifest.read_ts,
            "Wrote backup manifest"
        );
        Ok(())
    }
}
