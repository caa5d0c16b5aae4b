//! HTTP forwarding to the downstream target.
//!
//! Two shapes of forward exist:
//! - `replay`: the receiver's fire-and-forget POST of a decrypted body. The
//!   target's response is discarded; only reaching the target matters.
//! - `direct`: the sender's synchronous proxy of the original request. The
//!   target's status, headers, and body are relayed verbatim to the caller.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{
    header::{HeaderMap, HeaderName, CONTENT_LENGTH, CONTENT_TYPE, HOST},
    Client, Method,
};
use tracing::info;
use url::Url;

/// Content type used for replayed webhook bodies.
pub const REPLAY_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// POST a decrypted payload to the target, discarding the response.
///
/// Any HTTP status counts as success; only transport failures (connect,
/// timeout, request construction) are errors. The caller decides whether to
/// retry via the broker's redelivery machinery.
pub async fn replay(
    client: &Client,
    target_url: &Url,
    body: Vec<u8>,
    timeout: Duration,
) -> Result<()> {
    let response = client
        .post(target_url.clone())
        .header(CONTENT_TYPE, REPLAY_CONTENT_TYPE)
        .timeout(timeout)
        .body(body)
        .send()
        .await
        .with_context(|| format!("failed to reach target: {target_url}"))?;

    info!(
        target = %target_url,
        status_code = response.status().as_u16(),
        "replay_forward_complete"
    );

    Ok(())
}

/// Proxy an inbound request to the target, preserving method, headers, and
/// body. Returns the target's response for the caller to relay.
pub async fn direct(
    client: &Client,
    method: Method,
    target_url: &Url,
    headers: &HeaderMap,
    body: impl Into<reqwest::Body>,
    timeout: Duration,
) -> Result<reqwest::Response> {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if !is_hop_by_hop(name) && *name != HOST && *name != CONTENT_LENGTH {
            forwarded.append(name.clone(), value.clone());
        }
    }

    client
        .request(method, target_url.clone())
        .headers(forwarded)
        .timeout(timeout)
        .body(body)
        .send()
        .await
        .with_context(|| format!("failed to reach target: {target_url}"))
}

/// RFC 7230 hop-by-hop headers, owned by each connection rather than the
/// end-to-end exchange.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
