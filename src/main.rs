use std::sync::Arc;

use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use showdown_host::agent::LifecycleController;
use showdown_host::api::{self, AppState};
use showdown_host::client::simulated::SimulatedClient;
use showdown_host::client::SharedClient;
use showdown_host::config::Config;
use showdown_host::invite::{self, InviteService, InviteTimings};
use showdown_host::metrics;
use showdown_host::presentation::PresentationSink;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    metrics::register_metrics();

    let config = Config::load();
    if config.roster.available().is_empty() {
        tracing::warn!("No agent in the roster has its credentials available yet");
    }

    let client: SharedClient = Arc::new(SimulatedClient::default());
    let sink = PresentationSink::new();

    let controller = LifecycleController::new(
        client.clone(),
        config.roster.clone(),
        config.lifecycle.clone(),
        sink.clone(),
    );
    let lifecycle = controller.subscribe_state();
    let handle = controller.start();

    let invites = InviteService::new(
        config.roster.clone(),
        config.lifecycle.battle_format.clone(),
        &config.invite,
    );
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let invite_worker = invite::spawn_invite_worker(
        invites.clone(),
        client,
        InviteTimings::from_config(&config.invite, &config.lifecycle),
        worker_shutdown_rx,
    );

    let app = api::router(AppState {
        sink,
        lifecycle,
        roster: config.roster.clone(),
        invites: invites.clone(),
    })
    .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!(
        format = %config.lifecycle.battle_format,
        "Showdown agent host listening on port {}",
        config.port
    );
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {e}");
    }

    let _ = worker_shutdown_tx.send(true);
    if let Err(e) = invite_worker.await {
        tracing::error!("Invite worker ended abnormally: {e}");
    }
    tokio::join!(
        handle.stop(),
        invites.shutdown(config.lifecycle.shutdown_grace)
    );
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
