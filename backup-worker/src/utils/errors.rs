//! Custom error types for the backup worker.

use thiserror::Error;

use crate::restore::RestoreStage;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not ready to accept requests: {0}")]
    NotReady(String),

    #[error("Backup request group mismatch. Mine: {mine}. Requested: {requested}")]
    GroupMismatch { mine: u32, requested: u32 },

    #[error("This server doesn't serve group id: {0}")]
    NotServingGroup(u32),

    #[error("Encryption mismatch: {0}. Try the force_full flag")]
    EncryptionMismatch(String),

    #[error("Manifest data missing: {0}")]
    ManifestMissing(String),

    #[error("Invalid manifest chain: {0}")]
    InvalidChain(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Another backup is already in progress on this node")]
    BackupInProgress,

    #[error("Another restore operation is already running. Please retry later")]
    RestoreInProgress,

    #[error("Cannot start {requested}: operation {running} is already running")]
    TaskConflict { requested: String, running: String },

    #[error("No connection to group {0}")]
    NoConnection(u32),

    #[error("Consensus log isn't initialized yet")]
    ConsensusNotInitialized,

    #[error("Cannot wait for timestamp {ts}: {reason}")]
    WaitForTs { ts: u64, reason: String },

    #[error("Failed to verify backup: {0}")]
    Verify(String),

    #[error("Cannot assign tablet for predicate {predicate} to group {group}")]
    TabletAssignment { predicate: String, group: u32 },

    #[error("Cannot propose restore request: {0}")]
    RestoreProposal(#[source] Box<WorkerError>),

    #[error("Restore failed at stage {stage}: {source}")]
    Apply {
        stage: RestoreStage,
        #[source]
        source: Box<WorkerError>,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Destination handler error: {0}")]
    Handler(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl WorkerError {
    /// Wrap an error raised while executing one restore stage.
    pub fn at_stage(stage: RestoreStage, source: WorkerError) -> Self {
        WorkerError::Apply {
            stage,
            source: Box::new(source),
        }
    }

    /// Rejection errors are caused by the request itself and never succeed on retry.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            WorkerError::InvalidRequest(_)
                | WorkerError::GroupMismatch { .. }
                | WorkerError::EncryptionMismatch(_)
                | WorkerError::ManifestMissing(_)
                | WorkerError::InvalidChain(_)
                | WorkerError::InvalidCredentials(_)
                | WorkerError::Verify(_)
        )
    }
}

/// Stable error codes used when errors cross the peer RPC boundary, so the
/// receiving side can rebuild a variant with the same retry behaviour.
impl WorkerError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkerError::NoConnection(_) => "no_connection",
            WorkerError::ConsensusNotInitialized => "not_initialized",
            WorkerError::NotServingGroup(_) | WorkerError::GroupMismatch { .. } => "wrong_group",
            WorkerError::WaitForTs { .. } => "wait_for_ts",
            WorkerError::RestoreProposal(_) => "restore_proposal",
            WorkerError::BackupInProgress => "backup_in_progress",
            WorkerError::RestoreInProgress => "restore_in_progress",
            WorkerError::TaskConflict { .. } => "task_conflict",
            WorkerError::NotReady(_) => "not_ready",
            WorkerError::Cancelled => "cancelled",
            e if e.is_rejection() => "rejected",
            _ => "internal",
        }
    }

    pub fn from_remote(code: &str, group: u32, message: String) -> Self {
        match code {
            "no_connection" => WorkerError::NoConnection(group),
            "not_initialized" => WorkerError::ConsensusNotInitialized,
            "wrong_group" => WorkerError::NotServingGroup(group),
            "wait_for_ts" => WorkerError::WaitForTs {
                ts: 0,
                reason: message,
            },
            "restore_proposal" => WorkerError::RestoreProposal(Box::new(WorkerError::Rpc(message))),
            "backup_in_progress" => WorkerError::BackupInProgress,
            "restore_in_progress" => WorkerError::RestoreInProgress,
            "task_conflict" => task_conflict_from_message(message),
            "not_ready" => WorkerError::NotReady(message),
            "cancelled" => WorkerError::Cancelled,
            "rejected" => WorkerError::InvalidRequest(message),
            _ => WorkerError::Rpc(message),
        }
    }
}

/// Recover the operation names from a `TaskConflict` display string.
fn task_conflict_from_message(message: String) -> WorkerError {
    let parsed = message
        .strip_prefix("Cannot start ")
        .and_then(|rest| rest.strip_suffix(" is already running"))
        .and_then(|rest| rest.split_once(": operation "));
    match parsed {
        Some((requested, running)) => WorkerError::TaskConflict {
            requested: requested.to_string(),
            running: running.to_string(),
        },
        None => WorkerError::TaskConflict {
            requested: "unknown".to_string(),
            running: message,
        },
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_conflict_survives_remote_hop() {
        let local = WorkerError::TaskConflict {
            requested: "backup".to_string(),
            running: "restore".to_string(),
        };
        let remote = WorkerError::from_remote(local.code(), 2, local.to_string());

        assert_eq!(remote.code(), "task_conflict");
        assert!(matches!(
            remote,
            WorkerError::TaskConflict { ref requested, ref running }
                if requested == "backup" && running == "restore"
        ));
    }

    #[test]
    fn test_unknown_code_is_rpc_error() {
        let err = WorkerError::from_remote("internal", 2, "disk full".to_string());
        assert!(matches!(err, WorkerError::Rpc(ref m) if m == "disk full"));
    }
}
