//! Durable consumer for the encrypted replay queue.
//!
//! Each delivery is handled exactly once per attempt: open the envelope,
//! forward the plaintext to the target, then ack or nack. A nacked message is
//! requeued and comes back as a fresh delivery, which is what gives the
//! target at-least-once semantics (it must tolerate duplicates). The relay
//! queue is a quorum queue with a delivery limit, so a message that can never
//! be opened is requeued only that many times before the broker drops it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Connection, ConnectionProperties,
};
use reqwest::Client;
use tokio::{signal, task::JoinSet};
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::envelope::EnvelopeKey;
use crate::forward;
use crate::queue::declare_relay_queue;

/// Outcome of one delivery attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Forwarded; the broker may discard the message.
    Ack,
    /// Decode or forward failed; the broker should redeliver.
    Nak,
}

/// Decide the fate of a single delivery: open the envelope and forward the
/// plaintext to the target.
///
/// Decode failures and transport failures both come back as `Nak`. Any HTTP
/// status from the target counts as a completed forward — this path is
/// fire-and-forget, and the response is discarded.
pub async fn process_delivery(
    key: &EnvelopeKey,
    client: &Client,
    target_url: &Url,
    payload: &[u8],
    timeout: Duration,
) -> Outcome {
    let body = match key.open(payload) {
        Ok(body) => body,
        Err(e) => {
            error!(
                error = %e,
                payload_length = payload.len(),
                "envelope_decode_failed"
            );
            return Outcome::Nak;
        }
    };

    match forward::replay(client, target_url, body, timeout).await {
        Ok(()) => Outcome::Ack,
        Err(e) => {
            error!(error = %e, "replay_forward_failed");
            Outcome::Nak
        }
    }
}

/// Clamp the concurrency setting to the AMQP prefetch range. A plain cast
/// would wrap 65536 to 0, which the protocol reads as unlimited.
fn prefetch_from(concurrency: usize) -> u16 {
    u16::try_from(concurrency).unwrap_or(u16::MAX)
}

/// Run the durable consumer.
///
/// This function:
/// 1. Connects to the broker under the configured consumer name
/// 2. Sets QoS so at most `worker_concurrency` deliveries are in flight
/// 3. Declares the durable queue (idempotent operation)
/// 4. Consumes deliveries, spawning a task for each
/// 5. On SIGINT/SIGTERM stops pulling and drains in-flight handlers
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);

    info!(url_length = config.amqp_url.len(), "rabbitmq_connecting");

    let conn = Connection::connect(
        &config.amqp_url,
        ConnectionProperties::default().with_connection_name(config.consumer_name.as_str().into()),
    )
    .await
    .context("failed to connect to broker")?;

    info!("rabbitmq_connected");

    let channel = conn
        .create_channel()
        .await
        .context("failed to create channel")?;

    let prefetch_count = prefetch_from(config.worker_concurrency);
    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .context("failed to set QoS")?;

    info!(prefetch_count = prefetch_count, "rabbitmq_qos_set");

    declare_relay_queue(
        &channel,
        &config.queue_name,
        config.queue_max_bytes,
        config.delivery_limit,
    )
    .await?;

    let client = Client::builder()
        .pool_max_idle_per_host(100)
        .build()
        .context("failed to create HTTP client")?;
    let client = Arc::new(client);

    let mut consumer = channel
        .basic_consume(
            &config.queue_name,
            &config.consumer_name,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("failed to start consumer")?;

    info!(
        queue = %config.queue_name,
        consumer = %config.consumer_name,
        "rabbitmq_consumer_started"
    );
    info!("receiver_ready");

    let channel = Arc::new(channel);
    let timeout = Duration::from_millis(config.request_timeout_ms);

    // Create shutdown signal future
    let shutdown = async {
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
    };

    tokio::pin!(shutdown);

    let mut handlers: JoinSet<()> = JoinSet::new();

    // Process deliveries until shutdown
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("receiver_stopping");
                break;
            }
            // Reap finished handlers so the set does not grow unbounded.
            // An empty set resolves to None, which disables this branch.
            Some(_) = handlers.join_next() => {}
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;

                        info!(
                            queue = %config.queue_name,
                            delivery_tag = delivery_tag,
                            envelope_length = delivery.data.len(),
                            redelivered = delivery.redelivered,
                            "rabbitmq_envelope_received"
                        );

                        let client = Arc::clone(&client);
                        let config = Arc::clone(&config);
                        let channel = Arc::clone(&channel);

                        handlers.spawn(async move {
                            let outcome = process_delivery(
                                &config.key,
                                &client,
                                &config.target_url,
                                &delivery.data,
                                timeout,
                            )
                            .await;

                            match outcome {
                                Outcome::Ack => {
                                    if let Err(e) = channel
                                        .basic_ack(delivery_tag, BasicAckOptions::default())
                                        .await
                                    {
                                        error!(
                                            delivery_tag = delivery_tag,
                                            error = %e,
                                            "rabbitmq_ack_failed"
                                        );
                                    } else {
                                        info!(
                                            delivery_tag = delivery_tag,
                                            "rabbitmq_envelope_acked"
                                        );
                                    }
                                }
                                Outcome::Nak => {
                                    if let Err(e) = channel
                                        .basic_nack(
                                            delivery_tag,
                                            BasicNackOptions {
                                                requeue: true,
                                                ..Default::default()
                                            },
                                        )
                                        .await
                                    {
                                        error!(
                                            delivery_tag = delivery_tag,
                                            error = %e,
                                            "rabbitmq_nack_failed"
                                        );
                                    }
                                }
                            }
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    // Graceful drain: let in-flight ack/nak calls complete so no delivery is
    // left in limbo longer than necessary.
    while handlers.join_next().await.is_some() {}

    info!("receiver_shutdown_complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, Router};
    use std::sync::Mutex;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn test_key() -> EnvelopeKey {
        EnvelopeKey::from_bytes(&[0u8; 32]).unwrap()
    }

    #[test]
    fn test_prefetch_saturates_instead_of_wrapping() {
        assert_eq!(prefetch_from(16), 16);
        assert_eq!(prefetch_from(u16::MAX as usize), u16::MAX);
        assert_eq!(prefetch_from(u16::MAX as usize + 1), u16::MAX);
        assert_eq!(prefetch_from(usize::MAX), u16::MAX);
    }

    async fn serve(app: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn test_garbage_payload_naks_without_touching_target() {
        // Target is unreachable, but decode fails first.
        let target = Url::parse("http://127.0.0.1:9/").unwrap();
        let client = Client::new();

        let outcome =
            process_delivery(&test_key(), &client, &target, b"not an envelope", TIMEOUT).await;
        assert_eq!(outcome, Outcome::Nak);
    }

    #[tokio::test]
    async fn test_unreachable_target_naks() {
        let key = test_key();
        let envelope = key.seal(b"body=1").unwrap();

        let target = Url::parse("http://127.0.0.1:9/").unwrap();
        let client = Client::new();

        let outcome = process_delivery(&key, &client, &target, &envelope, TIMEOUT).await;
        assert_eq!(outcome, Outcome::Nak);
    }

    #[tokio::test]
    async fn test_error_status_still_acks() {
        // The replay path is fire-and-forget: a 500 from the target is a
        // completed round-trip, not a retry trigger.
        let app = Router::new().fallback(|| async { StatusCode::INTERNAL_SERVER_ERROR });
        let target = serve(app).await;

        let key = test_key();
        let envelope = key.seal(b"body=1").unwrap();
        let client = Client::new();

        let outcome = process_delivery(&key, &client, &target, &envelope, TIMEOUT).await;
        assert_eq!(outcome, Outcome::Ack);
    }

    #[tokio::test]
    async fn test_decrypted_plaintext_is_posted_verbatim() {
        type Captured = Arc<Mutex<Option<(Option<String>, Vec<u8>)>>>;
        let captured: Captured = Arc::new(Mutex::new(None));

        let app = Router::new()
            .fallback(
                |State(captured): State<Captured>, headers: HeaderMap, body: Bytes| async move {
                    let content_type = headers
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    *captured.lock().unwrap() = Some((content_type, body.to_vec()));
                    StatusCode::OK
                },
            )
            .with_state(Arc::clone(&captured));
        let target = serve(app).await;

        let key = test_key();
        let plaintext = b"payload=hello&n=1";
        let envelope = key.seal(plaintext).unwrap();
        let client = Client::new();

        let outcome = process_delivery(&key, &client, &target, &envelope, TIMEOUT).await;
        assert_eq!(outcome, Outcome::Ack);

        let captured = captured.lock().unwrap().take().unwrap();
        assert_eq!(
            captured.0.as_deref(),
            Some(forward::REPLAY_CONTENT_TYPE)
        );
        assert_eq!(captured.1, plaintext);
    }
}
