//! Manifest chain types.
//!
//! A manifest describes one backup step. Manifests sharing a `backup_id` form a
//! chain rooted at a full backup; each incremental manifest covers the range
//! `(since_ts, read_ts]` where `since_ts` is the previous manifest's read timestamp.
//! The destination keeps every manifest in a single master file, in write order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::cluster::GroupId;
use crate::{Result, WorkerError};

/// Format version written by this release. Manifests without a version field
/// were written by older releases and deserialize as version 0.
pub const MANIFEST_VERSION: u32 = 1;

/// Name of the master manifest file at the root of a destination.
pub const MASTER_MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestType {
    Full,
    Incremental,
}

impl fmt::Display for ManifestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestType::Full => write!(f, "full"),
            ManifestType::Incremental => write!(f, "incremental"),
        }
    }
}

/// Kind of destructive operation recorded between two backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropOp {
    /// Drop all data and schema.
    All,
    /// Drop all data, keep schema.
    Data,
    /// Drop a single predicate; `value` holds its name.
    Attr,
    /// Drop a namespace; `value` holds the namespace id.
    Namespace,
    /// Drop a type definition; `value` holds its name.
    Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropOperation {
    pub op: DropOp,
    #[serde(default)]
    pub value: String,
    /// Commit timestamp of the drop
    pub ts: u64,
}

impl DropOperation {
    /// Whether this drop removes data of `predicate` in `namespace`.
    pub fn invalidates(&self, predicate: &str, namespace: u64) -> bool {
        match self.op {
            DropOp::All | DropOp::Data => true,
            DropOp::Attr => self.value == predicate,
            DropOp::Namespace => self.value.parse::<u64>().ok() == Some(namespace),
            DropOp::Type => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub version: u32,
    /// Inclusive upper bound of the data in this backup.
    pub read_ts: u64,
    /// Exclusive lower bound; 0 for a full backup.
    pub since_ts: u64,
    /// Predicates owned by each group at `read_ts`.
    pub groups: BTreeMap<GroupId, Vec<String>>,
    #[serde(default)]
    pub drop_operations: Vec<DropOperation>,
    #[serde(rename = "type")]
    pub manifest_type: ManifestType,
    pub backup_id: String,
    pub backup_num: u64,
    #[serde(default)]
    pub encrypted: bool,
    /// Directory, relative to the destination root, holding the payloads.
    pub path: String,
    #[serde(default)]
    pub compression: String,
}

/// Contents of the master manifest file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterManifest {
    #[serde(default)]
    pub format_version: u32,
    #[serde(default)]
    pub manifests: Vec<Manifest>,
}

impl MasterManifest {
    pub fn latest(&self) -> Option<&Manifest> {
        self.manifests.last()
    }
}

/// Directory name for the payloads of one backup.
pub fn backup_path(unix_ts: &str) -> String {
    format!("backup.{}", unix_ts)
}

/// File name of one group's payload inside a backup directory.
pub fn payload_name(read_ts: u64, group: GroupId) -> String {
    format!("r{}-g{}.backup", read_ts, group)
}

/// Everything the coordinator gathered for the manifest it is about to write.
#[derive(Debug, Clone)]
pub struct ManifestDraft {
    pub read_ts: u64,
    pub since_ts: u64,
    pub path: String,
    pub groups: BTreeMap<GroupId, Vec<String>>,
    pub drop_operations: Vec<DropOperation>,
    pub encrypted: bool,
}

impl Manifest {
    /// Timestamp the next incremental backup must start from.
    ///
    /// Version 0 manifests stored the backup's effective read timestamp in `since_ts`.
    pub fn valid_read_ts(&self) -> u64 {
        if self.version == 0 {
            self.since_ts
        } else {
            self.read_ts
        }
    }

    pub fn predicates_for(&self, group: GroupId) -> Option<&[String]> {
        self.groups.get(&group).map(Vec::as_slice)
    }

    /// Build the manifest that follows `latest`. A draft with `since_ts == 0`
    /// starts a new chain.
    pub fn chained(latest: Option<&Manifest>, draft: ManifestDraft) -> Result<Manifest> {
        let (manifest_type, backup_id, backup_num) = if draft.since_ts == 0 {
            (ManifestType::Full, uuid::Uuid::new_v4().to_string(), 1)
        } else {
            let prev = latest.ok_or_else(|| {
                WorkerError::ManifestMissing(format!(
                    "incremental backup since {} has no previous manifest",
                    draft.since_ts
                ))
            })?;
            (
                ManifestType::Incremental,
                prev.backup_id.clone(),
                prev.backup_num + 1,
            )
        };

        Ok(Manifest {
            version: MANIFEST_VERSION,
            read_ts: draft.read_ts,
            since_ts: draft.since_ts,
            groups: draft.groups,
            drop_operations: draft.drop_operations,
            manifest_type,
            backup_id,
            backup_num,
            encrypted: draft.encrypted,
            path: draft.path,
            compression: "zstd".to_string(),
        })
    }
}

/// Check the chain invariants: rooted at a full backup, contiguous numbering,
/// and each `since_ts` equal to the previous manifest's read timestamp.
pub fn validate_chain(chain: &[Manifest]) -> Result<()> {
    let first = chain
        .first()
        .ok_or_else(|| WorkerError::InvalidChain("chain is empty".to_string()))?;

    // Version 0 manifests kept their own read timestamp in `since_ts`.
    let rooted = first.manifest_type == ManifestType::Full
        && first.backup_num == 1
        && (first.version == 0 || first.since_ts == 0);
    if !rooted {
        return Err(WorkerError::InvalidChain(format!(
            "chain {} does not start with a full backup (type {}, num {})",
            first.backup_id, first.manifest_type, first.backup_num
        )));
    }

    for pair in chain.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.backup_id != prev.backup_id {
            return Err(WorkerError::InvalidChain(format!(
                "backup {} does not belong to chain {}",
                next.backup_id, prev.backup_id
            )));
        }
        if next.manifest_type != ManifestType::Incremental {
            return Err(WorkerError::InvalidChain(format!(
                "backup {} of chain {} is not incremental",
                next.backup_num, next.backup_id
            )));
        }
        if next.backup_num != prev.backup_num + 1 {
            return Err(WorkerError::InvalidChain(format!(
                "chain {} jumps from backup {} to {}",
                next.backup_id, prev.backup_num, next.backup_num
            )));
        }
        if next.version != 0 && next.since_ts != prev.valid_read_ts() {
            return Err(WorkerError::InvalidChain(format!(
                "backup {} starts at {} but backup {} ended at {}",
                next.backup_num,
                next.since_ts,
                prev.backup_num,
                prev.valid_read_ts()
            )));
        }
    }

    Ok(())
}

/// Select the chain prefix `[1..backup_num]` to restore.
///
/// An empty `backup_id` picks the chain of the most recent manifest and a
/// `backup_num` of 0 picks the latest manifest of the chain.
pub fn manifests_to_restore(
    all: &[Manifest],
    backup_id: &str,
    backup_num: u64,
) -> Result<Vec<Manifest>> {
    let backup_id = if backup_id.is_empty() {
        match all.last() {
            Some(latest) => latest.backup_id.as_str(),
            None => {
                return Err(WorkerError::ManifestMissing(
                    "no backup manifests found at location".to_string(),
                ))
            }
        }
    } else {
        backup_id
    };

    let mut chain: Vec<Manifest> = all
        .iter()
        .filter(|m| m.backup_id == backup_id)
        .cloned()
        .collect();
    if chain.is_empty() {
        return Err(WorkerError::ManifestMissing(format!(
            "no backup with id {}",
            backup_id
        )));
    }
    chain.sort_by_key(|m| m.backup_num);

    let last_num = chain.last().map(|m| m.backup_num).unwrap_or(0);
    let upto = if backup_num == 0 { last_num } else { backup_num };
    if upto > last_num {
        return Err(WorkerError::ManifestMissing(format!(
            "backup {} of chain {} not found (latest is {})",
            upto, backup_id, last_num
        )));
    }
    chain.retain(|m| m.backup_num <= upto);

    validate_chain(&chain)?;
    Ok(chain)
}
