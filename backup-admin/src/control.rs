//! Client side of the `/internal/control` routes: a node that does not host
//! the cluster's oracle, membership record and id lease reaches them here.

use async_trait::async_trait;
use backup_worker::cluster::local::ControlPlane;
use backup_worker::cluster::{GroupId, IdLease, LeaseKind, MembershipService, Oracle};
use backup_worker::membership::{MembershipState, Tablet};
use backup_worker::{Result, WorkerError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::http::{Endpoint, JsonClient};

/// How often a remote oracle is polled while waiting for a timestamp.
const TS_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize)]
pub struct TsResponse {
    pub ts: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupRequest {
    pub group_id: GroupId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TabletRequest {
    pub predicate: String,
    pub group_id: GroupId,
    /// Take the tablet from its current owner
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub value: u64,
    pub kind: LeaseKind,
}

pub struct RemoteOracle {
    http: Arc<JsonClient>,
}

#[async_trait]
impl Oracle for RemoteOracle {
    async fn read_only_timestamp(&self) -> Result<u64> {
        let resp: TsResponse = self.http.get("/internal/control/ts").await?;
        Ok(resp.ts)
    }

    async fn next_timestamp(&self) -> Result<u64> {
        let resp: TsResponse = self.http.post("/internal/control/ts", &()).await?;
        Ok(resp.ts)
    }

    async fn wait_for_ts(&self, ts: u64) -> Result<()> {
        loop {
            let current = self
                .read_only_timestamp()
                .await
                .map_err(|e| WorkerError::WaitForTs {
                    ts,
                    reason: e.to_string(),
                })?;
            if current >= ts {
                return Ok(());
            }
            tokio::time::sleep(TS_POLL_INTERVAL).await;
        }
    }
}

/// Membership record kept by the authority, cached between refreshes.
pub struct RemoteMembership {
    http: Arc<JsonClient>,
    cached: RwLock<MembershipState>,
}

impl RemoteMembership {
    /// Make `group` known to the authority.
    pub async fn register_group(&self, group: GroupId) -> Result<()> {
        let _: serde_json::Value = self
            .http
            .post("/internal/control/groups", &GroupRequest { group_id: group })
            .await?;
        self.update_membership_state().await
    }
}

#[async_trait]
impl MembershipService for RemoteMembership {
    async fn update_membership_state(&self) -> Result<()> {
        let state: MembershipState = self.http.get("/internal/control/membership").await?;
        *self.cached.write().unwrap_or_else(|e| e.into_inner()) = state;
        Ok(())
    }

    fn membership_state(&self) -> MembershipState {
        self.cached.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn force_tablet(&self, predicate: &str, group: GroupId) -> Result<Tablet> {
        let req = TabletRequest {
            predicate: predicate.to_string(),
            group_id: group,
            force: true,
        };
        self.http.post("/internal/control/tablets", &req).await
    }
}

pub struct RemoteIdLease {
    http: Arc<JsonClient>,
}

#[async_trait]
impl IdLease for RemoteIdLease {
    async fn assign_ids(&self, value: u64, kind: LeaseKind) -> Result<()> {
        let _: serde_json::Value = self
            .http
            .post("/internal/control/leases", &LeaseRequest { value, kind })
            .await?;
        Ok(())
    }
}

/// Everything a node needs from the authority at `base_url`.
pub struct RemoteControlPlane {
    pub oracle: Arc<RemoteOracle>,
    pub membership: Arc<RemoteMembership>,
    pub id_lease: Arc<RemoteIdLease>,
}

impl RemoteControlPlane {
    pub fn connect(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = Arc::new(JsonClient::new(Endpoint::ControlPlane, base_url, timeout)?);
        Ok(Self {
            oracle: Arc::new(RemoteOracle { http: http.clone() }),
            membership: Arc::new(RemoteMembership {
                http: http.clone(),
                cached: RwLock::new(MembershipState::default()),
            }),
            id_lease: Arc::new(RemoteIdLease { http }),
        })
    }

    pub fn control_plane(&self) -> ControlPlane {
        ControlPlane {
            oracle: self.oracle.clone(),
            membership: self.membership.clone(),
            id_lease: self.id_lease.clone(),
        }
    }
}
