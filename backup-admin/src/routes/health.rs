use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let worker = state.worker();
    worker.health_check()?;

    Ok(Json(json!({
        "status": "ok",
        "node": worker.node_id(),
        "group": worker.group_id(),
        "leader": worker.is_leader(),
        "encrypted": worker.encrypted(),
        "backups": worker.metrics().snapshot(),
        "tasks": worker.tasks().ongoing(),
    })))
}
