use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use drone_dispatch::api;
use drone_dispatch::config::Config;
use drone_dispatch::engine::dispatch::run_dispatch_loop;
use drone_dispatch::engine::safety::run_safety_monitor;
use drone_dispatch::error::AppError;
use drone_dispatch::fleet::hub::run_discovery_loop;
use drone_dispatch::notify::{run_notification_loop, LogSink};
use drone_dispatch::state::{AppState, Collaborators};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let collaborators = Collaborators::from_config(&config);
    let (app_state, receivers) = AppState::new(config.clone(), collaborators);
    let shared_state = Arc::new(app_state);

    match shared_state.registry.sync_from_store().await {
        Ok(ids) => tracing::info!(drones = ids.len(), "fleet loaded from store"),
        Err(err) => tracing::error!(error = %err, "failed to load fleet from store"),
    }

    let app = api::rest::router(shared_state.clone());

    tokio::spawn(run_dispatch_loop(shared_state.dispatcher.clone()));
    tokio::spawn(run_safety_monitor(
        shared_state.dispatcher.clone(),
        receivers.alerts,
    ));
    tokio::spawn(run_notification_loop(
        shared_state.notifier.clone(),
        Arc::new(LogSink),
        receivers.notices,
    ));
    tokio::spawn(run_discovery_loop(
        shared_state.hub.clone(),
        config.discovery_interval,
    ));

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
