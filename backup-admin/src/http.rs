//! JSON-over-HTTP calls to other admin services.

use backup_worker::cluster::GroupId;
use backup_worker::{Result, WorkerError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    code: String,
}

/// Who answers on the other end; decides how failures are reported.
#[derive(Debug, Clone, Copy)]
pub enum Endpoint {
    Group(GroupId),
    ControlPlane,
}

pub struct JsonClient {
    endpoint: Endpoint,
    base_url: String,
    client: reqwest::Client,
}

impl JsonClient {
    pub fn new(endpoint: Endpoint, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn get<Resp>(&self, path: &str) -> Result<Resp>
    where
        Resp: DeserializeOwned + Send,
    {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.client.get(&url), &url).await
    }

    pub async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned + Send,
    {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.client.post(&url).json(body), &url).await
    }

    async fn send<Resp>(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Resp>
    where
        Resp: DeserializeOwned + Send,
    {
        let resp = request.send().await.map_err(|e| {
            tracing::warn!(endpoint = ?self.endpoint, url, error = %e, "Peer unreachable");
            match self.endpoint {
                Endpoint::Group(group) => WorkerError::NoConnection(group),
                Endpoint::ControlPlane => {
                    WorkerError::Rpc(format!("control plane unreachable at {}: {}", url, e))
                }
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<Resp>()
                .await
                .map_err(|e| WorkerError::Rpc(format!("invalid response from {}: {}", url, e)));
        }

        let group = match self.endpoint {
            Endpoint::Group(group) => group,
            Endpoint::ControlPlane => 0,
        };
        match resp.json::<ErrorBody>().await {
            Ok(body) => Err(WorkerError::from_remote(&body.code, group, body.error)),
            Err(_) => Err(WorkerError::Rpc(format!("HTTP {} from {}", status, url))),
        }
    }
}
