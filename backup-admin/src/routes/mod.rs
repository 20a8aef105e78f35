pub mod admin;
pub mod control;
pub mod health;
pub mod internal;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/admin", admin::router(state.clone()))
        .nest("/internal", internal::router(state.clone()))
        .route("/health", axum::routing::get(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use backup_worker::cluster::local::{LocalCluster, LocalGroup, SharedServices};
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    /// A single-node cluster that also hosts the control plane.
    pub fn test_state() -> Arc<AppState> {
        let shared = SharedServices::default();
        let node = LocalGroup::start(&LocalCluster::local_config(), &shared).unwrap();
        Arc::new(AppState::new(node, CancellationToken::new()).with_authority(shared))
    }

    /// Serve `state` on an ephemeral local port and return its base URL.
    pub async fn serve(state: Arc<AppState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state);
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{}", addr)
    }

    pub async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}
