//! Relay Sender - webhook-facing HTTP server.
//!
//! Every inbound request is relayed twice: synchronously proxied to the
//! target (the caller gets the target's response back), and asynchronously
//! sealed into an envelope and published to the durable replay queue.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use reqwest::Client;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::web::{drain_publishes, health, relay_webhook, AppState};
use relay::{Config, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "sender_starting");

    // Load configuration; the sender additionally requires a listen port
    let config = Config::from_env()?;
    let port = config.listen_port()?;
    info!(
        port = port,
        queue = %config.queue_name,
        target = %config.target_url,
        "config_loaded"
    );

    // Publisher for the encrypted replay path
    let publisher = Publisher::new(
        config.amqp_url.clone(),
        config.queue_name.clone(),
        config.queue_max_bytes,
        config.delivery_limit,
    );
    info!("rabbitmq_publisher_created");

    // Shared HTTP client for the direct-forward path
    let client = Client::builder()
        .pool_max_idle_per_host(100)
        .build()
        .context("failed to create HTTP client")?;

    let state = AppState::new(config, publisher.clone(), client);
    let publishes = std::sync::Arc::clone(&state.publishes);

    // Every method and path lands on the relay handler; only /health is
    // served locally.
    let app = Router::new()
        .route("/health", get(health))
        .fallback(relay_webhook)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;

    info!(address = %addr, "sender_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Let in-flight replay publishes reach the broker, then close
    info!("sender_draining_publishes");
    drain_publishes(&publishes).await;
    publisher.close().await;

    info!("sender_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("sender_shutting_down");
}
