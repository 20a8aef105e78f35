//! On-disk format of one group's backup payload: JSON records, zstd
//! compressed, optionally sealed with the node's encryption key.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cluster::{GroupId, KvRecord};
use crate::crypto::EncryptionKey;
use crate::{Result, WorkerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    pub group_id: GroupId,
    pub read_ts: u64,
    pub since_ts: u64,
    pub records: Vec<KvRecord>,
}

pub fn encode(payload: &BackupPayload, level: i32, key: Option<&EncryptionKey>) -> Result<Bytes> {
    let json = serde_json::to_vec(payload)?;
    let compressed = zstd::encode_all(json.as_slice(), level)
        .map_err(|e| WorkerError::Compression(e.to_string()))?;
    let data = match key {
        Some(key) => key.seal(&compressed)?,
        None => compressed,
    };
    Ok(Bytes::from(data))
}

pub fn decode(data: &[u8], key: Option<&EncryptionKey>) -> Result<BackupPayload> {
    let compressed = match key {
        Some(key) => key.open(data)?,
        None => data.to_vec(),
    };
    let json = zstd::decode_all(compressed.as_slice())
        .map_err(|e| WorkerError::Compression(e.to_string()))?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> BackupPayload {
        BackupPayload {
            group_id: 1,
            read_ts: 20,
            since_ts: 0,
            records: (0..100)
                .map(|uid| KvRecord {
                    predicate: "name".to_string(),
                    namespace: 0,
                    uid,
                    value: format!("person-{}", uid).into_bytes(),
                    version: 5,
                })
                .collect(),
        }
    }

    #[test]
    fn test_payload_is_compressed() {
        let encoded = encode(&payload(), 3, None).unwrap();
        let raw = serde_json::to_vec(&payload()).unwrap();
        assert!(encoded.len() < raw.len());
        assert_eq!(decode(&encoded, None).unwrap(), payload());
    }

    #[test]
    fn test_encrypted_payload_needs_key() {
        let key = EncryptionKey::from_bytes(&[3u8; crate::crypto::KEY_LEN]).unwrap();
        let encoded = encode(&payload(), 3, Some(&key)).unwrap();
        assert!(decode(&encoded, None).is_err());
        assert_eq!(decode(&encoded, Some(&key)).unwrap().records.len(), 100);
    }
}
