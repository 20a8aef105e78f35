//! Reading a manifest chain back into records.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::cluster::KvRecord;
use crate::codec;
use crate::crypto::EncryptionKey;
use crate::destination::BlobHandler;
use crate::manifest::Manifest;
use crate::{Result, WorkerError};

/// Records of a chain as of its last backup, plus the highest ids they use.
#[derive(Debug, Default)]
pub struct LoadedData {
    pub records: Vec<KvRecord>,
    pub max_uid: u64,
    pub max_namespace: u64,
}

type RecordKey = (String, u64, u64);

/// Replay `chain` in order and keep the records of `predicates`.
///
/// Payloads of every group are read, since a predicate may have been owned by
/// another group in earlier backups of the chain. Drops recorded in a manifest
/// apply to everything loaded from the manifests before it.
pub async fn load_chain(
    handler: &dyn BlobHandler,
    chain: &[Manifest],
    predicates: &BTreeSet<String>,
    key: Option<&EncryptionKey>,
) -> Result<LoadedData> {
    let mut state: BTreeMap<RecordKey, KvRecord> = BTreeMap::new();

    for manifest in chain {
        for drop in &manifest.drop_operations {
            state.retain(|(pred, ns, _), _| !drop.invalidates(pred, *ns));
        }

        let key = match (manifest.encrypted, key) {
            (true, None) => {
                return Err(WorkerError::Crypto(format!(
                    "backup {} of chain {} is encrypted but no key was provided",
                    manifest.backup_num, manifest.backup_id
                )))
            }
            (true, Some(key)) => Some(key.clone()),
            (false, _) => None,
        };

        for group in manifest.groups.keys() {
            let data = handler
                .read_payload(&manifest.path, *group, manifest.read_ts)
                .await?;
            let key = key.clone();
            let payload =
                tokio::task::spawn_blocking(move || codec::decode(&data, key.as_ref())).await??;

            let total = payload.records.len();
            let mut kept = 0;
            for record in payload.records {
                if !predicates.contains(&record.predicate) {
                    continue;
                }
                kept += 1;
                let key = (record.predicate.clone(), record.namespace, record.uid);
                state.insert(key, record);
            }
            debug!(
                backup_num = manifest.backup_num,
                group,
                records = total,
                kept,
                "Loaded backup payload"
            );
        }
    }

    let mut loaded = LoadedData::default();
    for record in state.into_values() {
        loaded.max_uid = loaded.max_uid.max(record.uid);
        loaded.max_namespace = loaded.max_namespace.max(record.namespace);
        loaded.records.push(record);
    }
    Ok(loaded)
}
