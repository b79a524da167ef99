mod app_state;
mod config;
mod credential;
mod db;
mod handlers;
mod ledger;
mod milestones;
mod provider;
mod queue;
mod worker;

use axum::{
    Router,
    routing::{get, patch, post, put},
};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use app_state::AppState;
use config::Config;
use db::init_pool;
use handlers::{cards, clients, orders, sync, webhook};
use provider::{HttpProvider, LoyaltyProvider, MockProvider};
use worker::{SyncWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loyalty_sync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse configuration
    let config = Arc::new(Config::parse());

    // Initialize database
    let pool = init_pool(&config.database_url).await?;

    let provider: Arc<dyn LoyaltyProvider> = if config.mock_provider {
        tracing::warn!("using mock loyalty provider");
        Arc::new(MockProvider::new())
    } else {
        Arc::new(HttpProvider::new(
            &config.luyoa_base_url,
            &config.luyoa_api_key,
            config.provider_timeout(),
        )?)
    };

    let state = AppState::new(pool.clone(), &config);

    // Start the sync worker
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = SyncWorker::new(
        pool,
        state.queue.clone(),
        provider,
        WorkerConfig {
            worker_id: config.worker_id.clone(),
            batch_size: config.worker_batch_size,
            poll_interval: config.poll_interval(),
        },
    );
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    // Build router
    let app = Router::new()
        .route("/health", get(handlers::health))
        // Provider callbacks
        .route("/webhooks/luyoa", post(webhook::luyoa_webhook))
        // Clients and points
        .route("/api/clients", post(clients::create_client))
        .route("/api/clients/{client_id}", get(clients::get_client))
        .route("/api/clients/{client_id}/adjust", post(clients::adjust_points))
        .route("/api/clients/{client_id}/redeem", post(clients::redeem_points))
        .route("/api/clients/{client_id}/visits", post(clients::record_visit))
        .route("/api/clients/{client_id}/history", get(clients::points_history))
        // Orders and rules
        .route("/api/orders", post(orders::record_order))
        .route("/api/orders/{order_id}/payment", patch(orders::update_order_payment))
        .route("/api/configs", put(orders::save_config))
        // Cards and credentials
        .route("/api/clients/{client_id}/card", post(cards::register_card))
        .route("/api/clients/{client_id}/card/deactivate", post(cards::deactivate_card))
        .route("/api/clients/{client_id}/credential", post(cards::mint_credential))
        .route("/api/clients/{client_id}/credential/rotate", post(cards::rotate_credential))
        .route(
            "/api/clients/{client_id}/credential/transient",
            post(cards::mint_transient_credential),
        )
        .route("/api/credentials/validate", post(cards::validate_credential))
        // Sync queue
        .route("/api/sync/stats", get(sync::queue_stats))
        .route("/api/sync/jobs", get(sync::list_jobs))
        .route("/api/sync/jobs/{job_id}", get(sync::get_job))
        .route("/api/sync/jobs/{job_id}/cancel", post(sync::cancel_job))
        .route("/api/sync/jobs/{job_id}/retry", post(sync::retry_job))
        .route("/api/sync/purge", post(sync::purge_jobs))
        // Add middleware
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        // Add shared state
        .with_state(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.socket_addr()).await?;

    tracing::info!("Server running on {}", config.socket_addr());
    tracing::info!(
        "Provider: {}",
        if config.mock_provider { "mock" } else { config.luyoa_base_url.as_str() }
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(tokio::signal::ctrl_c()))
        .await?;

    // Let the worker finish its batch
    let _ = shutdown_tx.send(true);
    worker_handle.await?;

    Ok(())
}

/// Resolves once `signal` fires. If the handler cannot be installed the
/// server keeps running rather than shutting down on the spot.
async fn wait_for_shutdown(signal: impl Future<Output = std::io::Result<()>>) {
    if let Err(e) = signal.await {
        tracing::error!(error = %e, "failed to listen for shutdown signal, ignoring");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_waits_for_signal() {
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(async { Ok(()) }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_signal_handler_does_not_stop_server() {
        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            wait_for_shutdown(async { Err(std::io::Error::other("no signal driver")) }),
        )
        .await;

        assert!(waited.is_err());
    }
}
