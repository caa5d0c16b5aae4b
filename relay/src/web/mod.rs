//! Web server module for the sender.
//!
//! The sender accepts every inbound webhook call and relays it twice:
//! - synchronously, proxying the request to the target and returning the
//!   target's response to the caller
//! - asynchronously, sealing the body into an envelope and publishing it to
//!   the durable replay queue
//!
//! The two paths are independent; neither outcome affects the other.

pub mod handlers;

pub use handlers::{drain_publishes, health, relay_webhook, AppState, HealthResponse};
