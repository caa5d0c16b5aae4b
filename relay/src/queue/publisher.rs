//! Async publisher for the encrypted replay queue.
//!
//! The publisher seals each webhook body into an envelope and publishes it
//! with publisher confirms, so a returned ack means the broker has durably
//! accepted the message. It maintains a persistent connection and channel,
//! reconnecting on demand, and can be shared across async tasks.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{bail, Context, Result};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::envelope::EnvelopeKey;
use crate::queue::declare_relay_queue;

/// Broker acknowledgment of a durably accepted envelope.
///
/// `sequence` is a publisher-side counter carried for log correlation; it has
/// no meaning beyond confirming durable acceptance.
#[derive(Debug)]
pub struct PublishAck {
    pub queue: String,
    pub sequence: u64,
}

/// Async publisher with connection management.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    queue: String,
    max_bytes: i64,
    delivery_limit: i64,
    sequence: AtomicU64,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl Publisher {
    /// Create a new publisher for the given broker URL and queue.
    pub fn new(url: String, queue: String, max_bytes: i64, delivery_limit: i64) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                queue,
                max_bytes,
                delivery_limit,
                sequence: AtomicU64::new(0),
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel> {
        // Check if we have a valid channel
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        // Need to reconnect
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("failed to connect to broker")?;

        info!("rabbitmq_publisher_connected");

        let ch = conn
            .create_channel()
            .await
            .context("failed to create channel")?;

        // Publisher confirms: publish resolves only once the broker has
        // durably accepted the message.
        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .context("failed to enable publisher confirms")?;

        declare_relay_queue(
            &ch,
            &self.inner.queue,
            self.inner.max_bytes,
            self.inner.delivery_limit,
        )
        .await?;

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Seal a webhook body and publish the envelope to the relay queue.
    ///
    /// A sealing failure aborts the publish; a broker failure surfaces to the
    /// caller. No retry happens here — the durable queue only ever sees
    /// messages the broker has confirmed.
    pub async fn publish(&self, key: &EnvelopeKey, body: &[u8]) -> Result<PublishAck> {
        let envelope = key.seal(body).context("failed to seal envelope")?;

        let channel = self.ensure_connected().await?;

        let confirmation = channel
            .basic_publish(
                "",
                &self.inner.queue,
                BasicPublishOptions::default(),
                &envelope,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/octet-stream".into()),
            )
            .await
            .context("failed to publish envelope")?
            .await
            .context("broker did not confirm publish")?;

        if let Confirmation::Nack(_) = confirmation {
            bail!("broker refused envelope for queue {}", self.inner.queue);
        }

        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        info!(
            queue = %self.inner.queue,
            sequence = sequence,
            envelope_length = envelope.len(),
            "rabbitmq_envelope_published"
        );

        Ok(PublishAck {
            queue: self.inner.queue.clone(),
            sequence,
        })
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_creation() {
        let publisher = Publisher::new(
            "amqp://localhost:5672".to_string(),
            "webhook_replay".to_string(),
            1024 * 1024,
            5,
        );
        assert!(Arc::strong_count(&publisher.inner) == 1);
        assert_eq!(publisher.inner.sequence.load(Ordering::Relaxed), 0);
    }
}
