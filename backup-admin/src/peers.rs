//! Peer RPC over HTTP: the client side of the `/internal` routes.

use async_trait::async_trait;
use backup_worker::backup::{BackupRequest, BackupResponse};
use backup_worker::cluster::{GroupId, WorkerClient};
use backup_worker::restore::RestoreRequest;
use backup_worker::{Result, WorkerError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::http::{Endpoint, JsonClient};

/// A member of another group, reached through its admin service.
pub struct HttpWorkerClient {
    group: GroupId,
    http: JsonClient,
}

impl HttpWorkerClient {
    pub fn new(group: GroupId, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            group,
            http: JsonClient::new(Endpoint::Group(group), base_url, timeout)?,
        })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn backup(&self, req: BackupRequest, cancel: CancellationToken) -> Result<BackupResponse> {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        tokio::select! {
            res = self.http.post("/internal/backup", &req) => res,
            _ = cancel.cancelled() => {
                tracing::warn!(group = self.group, "Backup cancelled while waiting on peer");
                Err(WorkerError::Cancelled)
            }
        }
    }

    async fn restore(&self, req: RestoreRequest) -> Result<()> {
        let _: serde_json::Value = self.http.post("/internal/restore", &req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::{serve, test_state};
    use tempfile::TempDir;

    fn group_request(dir: &TempDir, read_ts: u64) -> BackupRequest {
        let mut req = BackupRequest::new(dir.path().display().to_string());
        req.group_id = 1;
        req.read_ts = read_ts;
        req.unix_ts = "20260101.000000.000".to_string();
        req
    }

    #[tokio::test]
    async fn test_backup_through_http_peer() {
        let url = serve(test_state()).await;
        let dir = TempDir::new().unwrap();
        let client = HttpWorkerClient::new(1, &url, Duration::from_secs(5)).unwrap();

        let resp = client
            .backup(group_request(&dir, 0), CancellationToken::new())
            .await
            .unwrap();
        assert!(resp.drop_operations.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_abandons_peer_backup() {
        let url = serve(test_state()).await;
        let dir = TempDir::new().unwrap();
        let client = HttpWorkerClient::new(1, &url, Duration::from_secs(5)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .backup(group_request(&dir, 0), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));

        // The peer is still waiting for a timestamp nobody has issued
        let cancel = CancellationToken::new();
        let pending = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.backup(group_request(&dir, 100), cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
    }

    #[tokio::test]
    async fn test_remote_errors_keep_their_kind() {
        let url = serve(test_state()).await;
        let client = HttpWorkerClient::new(2, &url, Duration::from_secs(5)).unwrap();

        let mut req = RestoreRequest::new("/tmp/unused");
        req.group_id = 2;
        let err = client.restore(req).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotServingGroup(2)));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_no_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            HttpWorkerClient::new(3, &format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        let err = client
            .backup(BackupRequest::new("/tmp/unused"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NoConnection(3)));
    }
}
