//! Webhook relay - encrypted durable fan-out for inbound webhooks.
//!
//! This library provides shared modules for the two relay binaries:
//! - `relay-sender`: Web server that direct-forwards each webhook and
//!   publishes an encrypted copy to a durable queue
//! - `relay-receiver`: Durable consumer that decrypts queued envelopes and
//!   replays them against the target
//!
//! ## Architecture
//!
//! ```text
//! Webhook → Sender → direct forward → target (sync response)
//!                 → encrypt+publish → durable queue → Receiver → decrypt → target
//! ```

pub mod config;
pub mod envelope;
pub mod forward;
pub mod queue;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use envelope::{EnvelopeError, EnvelopeKey, NONCE_LEN};
pub use queue::{PublishAck, Publisher};
pub use web::AppState;
