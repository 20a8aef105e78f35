//! Peer RPC endpoints served to other nodes' `HttpWorkerClient`.

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use backup_worker::backup::{BackupRequest, BackupResponse};
use backup_worker::cluster::WorkerClient;
use backup_worker::restore::RestoreRequest;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/backup", post(backup))
        .route("/restore", post(restore))
        .nest("/control", super::control::router(state))
}

async fn backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BackupRequest>,
) -> Result<Json<BackupResponse>, AppError> {
    let resp = state
        .worker()
        .backup_current_group(body, state.shutdown.child_token())
        .await?;
    Ok(Json(resp))
}

async fn restore(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RestoreRequest>,
) -> Result<Json<Value>, AppError> {
    state.worker().restore(body).await?;
    Ok(Json(json!({})))
}
