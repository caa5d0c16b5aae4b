//! Relay Receiver - durable consumer for the encrypted replay queue.
//!
//! This worker opens each queued envelope, replays the decrypted webhook
//! body against the target, and acks or nacks to drive redelivery.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::{queue, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "receiver_starting");

    // Load configuration from environment; missing settings are fatal
    let config = Config::from_env()?;
    tracing::info!(
        queue = %config.queue_name,
        consumer = %config.consumer_name,
        target = %config.target_url,
        prefetch = config.worker_concurrency,
        request_timeout_ms = config.request_timeout_ms,
        "config_loaded"
    );

    // Run the consumer until shutdown
    queue::consumer::run(config).await?;

    Ok(())
}
