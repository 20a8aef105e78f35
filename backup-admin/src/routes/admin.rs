use crate::error::AppError;
use crate::state::{AppState, RestorePhase, RestoreStatus};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_worker::backup::BackupRequest;
use backup_worker::destination::Credentials;
use backup_worker::manifest::Manifest;
use backup_worker::restore::RestoreRequest;
use backup_worker::tasks::TaskInfo;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/backup", post(start_backup))
        .route("/backups", get(list_backups))
        .route("/restore", post(start_restore))
        .route("/restore/{id}", get(get_restore))
        .route("/tasks", get(list_tasks))
}

async fn start_backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BackupRequest>,
) -> Result<Json<Manifest>, AppError> {
    if body.destination.is_empty() {
        return Err(AppError::BadRequest("destination is required".into()));
    }

    let manifest = state
        .worker()
        .process_backup_request(body, state.shutdown.child_token())
        .await?;
    Ok(Json(manifest))
}

#[derive(Deserialize)]
pub struct ListBackupsQuery {
    pub location: String,
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListBackupsQuery>,
) -> Result<Json<Vec<Manifest>>, AppError> {
    let manifests = state
        .worker()
        .list_backups(&query.location, &Credentials::default())
        .await?;
    Ok(Json(manifests))
}

async fn start_restore(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RestoreRequest>,
) -> Result<(StatusCode, Json<RestoreStatus>), AppError> {
    let dispatch = state.worker().process_restore_request(body).await?;

    let id = uuid::Uuid::new_v4().to_string();
    let status = RestoreStatus {
        id: id.clone(),
        restore_ts: dispatch.restore_ts,
        groups: dispatch.groups.clone(),
        phase: RestorePhase::Running,
        started_at: Utc::now(),
        finished_at: None,
        summary: None,
    };
    state.restores.insert(id.clone(), status.clone());

    let state2 = state.clone();
    tokio::spawn(async move {
        let result = dispatch.wait().await;
        if let Some(mut entry) = state2.restores.get_mut(&id) {
            entry.finished_at = Some(Utc::now());
            match result {
                Ok(summary) => {
                    entry.phase = if summary.is_success() {
                        RestorePhase::Finished
                    } else {
                        RestorePhase::Failed
                    };
                    entry.summary = Some(summary);
                }
                Err(e) => {
                    tracing::error!(restore = %id, error = %e, "Restore collector failed");
                    entry.phase = RestorePhase::Failed;
                }
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn get_restore(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RestoreStatus>, AppError> {
    match state.restores.get(&id) {
        Some(status) => Ok(Json(status.clone())),
        None => Err(AppError::NotFound("Restore not found".into())),
    }
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskInfo>> {
    Json(state.worker().tasks().ongoing())
}
