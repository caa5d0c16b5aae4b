//! Queue module for the durable replay channel.
//!
//! This module provides:
//! - An async publisher that seals webhook bodies into envelopes and
//!   publishes them with confirms
//! - The consumer loop that opens envelopes, forwards them, and drives the
//!   ack/nak redelivery state machine
//!
//! ## Architecture
//!
//! ```text
//! Webhook → Sender → [encrypt] → durable queue → Receiver → [decrypt] → Target
//! ```

pub mod consumer;
pub mod publisher;

use anyhow::{Context, Result};
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable},
    Channel,
};
use tracing::info;

pub use consumer::{process_delivery, Outcome};
pub use publisher::{PublishAck, Publisher};

/// Arguments for the durable relay queue.
///
/// The queue is a quorum queue: unlike a classic queue, the broker counts
/// delivery attempts per message, so `x-delivery-limit` gives a poisoned
/// envelope (one that will never decode) a terminal drop after that many
/// requeues. `x-max-length-bytes` bounds retention.
pub(crate) fn relay_queue_arguments(max_bytes: i64, delivery_limit: i64) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
    arguments.insert("x-max-length-bytes".into(), AMQPValue::LongLongInt(max_bytes));
    arguments.insert("x-delivery-limit".into(), AMQPValue::LongLongInt(delivery_limit));
    arguments
}

/// Declare the durable relay queue with its retention and delivery bounds.
///
/// Both the sender and the receiver issue this with identical options, so the
/// declare is idempotent: the first caller creates the queue, later callers
/// (and restarts) see the existing one unchanged.
pub(crate) async fn declare_relay_queue(
    channel: &Channel,
    queue_name: &str,
    max_bytes: i64,
    delivery_limit: i64,
) -> Result<()> {
    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            relay_queue_arguments(max_bytes, delivery_limit),
        )
        .await
        .with_context(|| format!("failed to declare queue {queue_name}"))?;

    info!(
        queue = queue_name,
        max_bytes = max_bytes,
        delivery_limit = delivery_limit,
        "rabbitmq_queue_declared"
    );

    Ok(())
}
