//! Control-plane endpoints, served by the node that hosts the cluster's
//! oracle, membership record and id lease.

use crate::control::{GroupRequest, LeaseRequest, TabletRequest, TsResponse};
use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_worker::cluster::local::SharedServices;
use backup_worker::cluster::{IdLease, MembershipService, Oracle};
use backup_worker::membership::{MembershipState, Tablet};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/ts", get(read_ts).post(next_ts))
        .route("/membership", get(membership))
        .route("/groups", post(add_group))
        .route("/tablets", post(assign_tablet))
        .route("/leases", post(assign_ids))
}

fn authority(state: &AppState) -> Result<&SharedServices, AppError> {
    state
        .authority
        .as_ref()
        .ok_or_else(|| AppError::NotFound("this node does not host the control plane".into()))
}

async fn read_ts(State(state): State<Arc<AppState>>) -> Result<Json<TsResponse>, AppError> {
    let ts = authority(&state)?.oracle.read_only_timestamp().await?;
    Ok(Json(TsResponse { ts }))
}

async fn next_ts(State(state): State<Arc<AppState>>) -> Result<Json<TsResponse>, AppError> {
    let ts = authority(&state)?.oracle.next_timestamp().await?;
    Ok(Json(TsResponse { ts }))
}

async fn membership(
    State(state): State<Arc<AppState>>,
) -> Result<Json<MembershipState>, AppError> {
    let membership = &authority(&state)?.membership;
    membership.update_membership_state().await?;
    Ok(Json(membership.membership_state()))
}

async fn add_group(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GroupRequest>,
) -> Result<Json<Value>, AppError> {
    authority(&state)?.membership.add_group(body.group_id);
    tracing::info!(group = body.group_id, "Group joined");
    Ok(Json(json!({})))
}

async fn assign_tablet(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TabletRequest>,
) -> Result<Json<Tablet>, AppError> {
    let membership = &authority(&state)?.membership;
    let tablet = if body.force {
        membership.force_tablet(&body.predicate, body.group_id).await?
    } else {
        membership.set_tablet(&body.predicate, body.group_id)
    };
    Ok(Json(tablet))
}

async fn assign_ids(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LeaseRequest>,
) -> Result<Json<Value>, AppError> {
    authority(&state)?.id_lease.assign_ids(body.value, body.kind).await?;
    Ok(Json(json!({})))
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::routes::testing::{send, test_state};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_tablets_and_timestamps() {
        let app = create_router(test_state());

        let (status, body) = send(app.clone(), "POST", "/internal/control/ts", None).await;
        assert_eq!(status, StatusCode::OK);
        let issued = body["ts"].as_u64().unwrap();
        let (_, body) = send(app.clone(), "GET", "/internal/control/ts", None).await;
        assert_eq!(body["ts"].as_u64(), Some(issued));

        let (status, body) = send(
            app.clone(),
            "POST",
            "/internal/control/tablets",
            Some(json!({ "predicate": "name", "group_id": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["group_id"], 1);
        assert_eq!(body["force"], false);

        let (_, body) = send(app, "GET", "/internal/control/membership", None).await;
        assert!(body["groups"]["1"]["tablets"]["name"].is_object());
    }
}
