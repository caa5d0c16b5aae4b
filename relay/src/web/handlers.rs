//! Webhook endpoint handlers for the sender.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use reqwest::header::CONTENT_LENGTH;
use reqwest::Client;
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinSet};
use tracing::{error, info};

use crate::config::Config;
use crate::forward;
use crate::queue::Publisher;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub publisher: Publisher,
    pub client: Client,
    /// In-flight replay publishes, drained at shutdown so accepted webhooks
    /// are not lost between the caller's response and the broker's confirm.
    pub publishes: Arc<Mutex<JoinSet<()>>>,
}

impl AppState {
    pub fn new(config: Config, publisher: Publisher, client: Client) -> Self {
        Self {
            config: Arc::new(config),
            publisher,
            client,
            publishes: Arc::new(Mutex::new(JoinSet::new())),
        }
    }
}

/// Await every in-flight replay publish. Called once the server has stopped
/// accepting requests, before the publisher connection is closed.
pub async fn drain_publishes(publishes: &Mutex<JoinSet<()>>) {
    let mut in_flight = {
        let mut guard = publishes.lock().await;
        std::mem::take(&mut *guard)
    };
    while in_flight.join_next().await.is_some() {}
}

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Catch-all webhook endpoint.
///
/// Launches the encrypted publish as a detached task, then runs the direct
/// forward and relays the target's response. The publish outcome never
/// changes what the original caller sees.
pub async fn relay_webhook(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!(
        method = %method,
        body_length = body.len(),
        "webhook_received"
    );

    {
        let publisher = state.publisher.clone();
        let config = Arc::clone(&state.config);
        let body = body.clone();
        state.publishes.lock().await.spawn(async move {
            match publisher.publish(&config.key, &body).await {
                Ok(ack) => info!(
                    queue = %ack.queue,
                    sequence = ack.sequence,
                    "webhook_replay_published"
                ),
                Err(e) => error!(error = %e, "webhook_replay_publish_failed"),
            }
        });
    }

    let timeout = Duration::from_millis(state.config.request_timeout_ms);
    match forward::direct(
        &state.client,
        method,
        &state.config.target_url,
        &headers,
        body,
        timeout,
    )
    .await
    {
        Ok(response) => relay_response(response).await,
        Err(e) => {
            error!(error = %e, "direct_forward_failed");
            (StatusCode::BAD_GATEWAY, "failed to reach target").into_response()
        }
    }
}

/// Relay the target's status, headers, and body verbatim to the caller.
async fn relay_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !forward::is_hop_by_hop(name) && *name != CONTENT_LENGTH {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "direct_forward_body_read_failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read target response",
            )
                .into_response();
        }
    };

    info!(
        status_code = status.as_u16(),
        body_length = body.len(),
        "direct_forward_complete"
    );

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_drain_publishes_waits_for_in_flight_tasks() {
        let publishes = Arc::new(Mutex::new(JoinSet::new()));
        let confirmed = Arc::new(AtomicBool::new(false));

        {
            let confirmed = Arc::clone(&confirmed);
            publishes.lock().await.spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                confirmed.store(true, Ordering::SeqCst);
            });
        }

        drain_publishes(&publishes).await;
        assert!(confirmed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_health() {
        let Json(response) = health().await;
        assert_eq!(response.status, "ok");
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"status":"ok"}"#
        );
    }

    #[tokio::test]
    async fn test_relay_response_filters_hop_by_hop() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().fallback(|| async {
            (
                StatusCode::CREATED,
                [("x-target-header", "kept"), ("keep-alive", "timeout=5")],
                "created",
            )
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let upstream = Client::new()
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap();
        let response = relay_response(upstream).await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("x-target-header"),
            Some(&HeaderValue::from_static("kept"))
        );
        assert!(response.headers().get("keep-alive").is_none());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.as_ref(), b"created");
    }
}
