mod config;
mod control;
mod error;
mod http;
mod peers;
mod routes;
mod state;

use crate::config::AppConfig;
use crate::control::RemoteControlPlane;
use crate::peers::HttpWorkerClient;
use crate::state::AppState;
use backup_worker::cluster::local::{LocalGroup, SharedServices};
use backup_worker::cluster::peers::PeerRegistry;
use backup_worker::destination::UriHandlerFactory;
use backup_worker::utils::logger;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let worker_config = match &config.worker_config {
        Some(path) => backup_worker::Config::from_file(path)?,
        None => backup_worker::Config::default(),
    };

    // Initialize logging
    logger::init(&worker_config.log, config.log_level.as_deref())?;
    tracing::info!(
        node = %worker_config.node.id,
        group = worker_config.node.group_id,
        "Starting backup admin on port {}",
        config.port
    );

    // Peers of other groups are reached over HTTP
    let peers = Arc::new(PeerRegistry::new());
    for peer in &worker_config.peers {
        let client = HttpWorkerClient::new(peer.group_id, &peer.url, config.peer_timeout)?;
        peers.register_remote(peer.group_id, Arc::new(client), peer.leader);
        tracing::info!(group = peer.group_id, url = %peer.url, leader = peer.leader, "Registered peer");
    }

    let cancel = CancellationToken::new();
    let state = match &worker_config.node.authority {
        // Oracle, membership and id lease live on another node
        Some(url) => {
            let remote = RemoteControlPlane::connect(url, config.peer_timeout)?;
            let node = LocalGroup::start_with(
                &worker_config,
                remote.control_plane(),
                &peers,
                Arc::new(UriHandlerFactory),
            )?;
            remote
                .membership
                .register_group(worker_config.node.group_id)
                .await?;
            tracing::info!(authority = %url, "Joined cluster");
            AppState::new(node, cancel.clone())
        }
        None => {
            let shared = SharedServices {
                peers,
                ..SharedServices::default()
            };
            for peer in &worker_config.peers {
                shared.membership.add_group(peer.group_id);
            }
            let node = LocalGroup::start(&worker_config, &shared)?;
            tracing::info!("Hosting the control plane");
            AppState::new(node, cancel.clone()).with_authority(shared)
        }
    };
    let state = Arc::new(state);

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    state.worker().set_ready(false);
    cancel.cancel();
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    // Abort backups that have not started writing yet
    cancel.cancel();
}
