//! HTTP request handlers for the proxy surface and operational probes.

use crate::metrics::METRICS;
use crate::middleware::RequestId;
use crate::response::{error_body, HealthResponse, PoolCounts};
use crate::stream::event_stream_response;
use crate::upstream::{UpstreamBody, UpstreamCall};
use crate::AppState;
use axum::body::Body;
use axum::extract::{FromRequest, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Chat-completion request body, matching the upstream schema. Forwarded
/// verbatim with unset fields omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// `POST /v1/chat/completions` — relay a chat completion through the pool.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    request_parts: axum::extract::Request,
) -> Response {
    let start = std::time::Instant::now();
    METRICS.requests_total.fetch_add(1, Ordering::Relaxed);
    state.request_count.fetch_add(1, Ordering::Relaxed);

    let req_id = request_id(&request_parts);

    let request: ChatCompletionRequest =
        match Json::<ChatCompletionRequest>::from_request(request_parts, &state).await {
            Ok(Json(body)) => body,
            Err(e) => {
                METRICS.requests_error.fetch_add(1, Ordering::Relaxed);
                warn!(req_id = %req_id, error = %e, "Invalid chat completion body");
                return (StatusCode::BAD_REQUEST, error_body(format!("invalid request body: {e}")))
                    .into_response();
            }
        };

    let is_stream = request.stream.unwrap_or(false);
    if is_stream {
        METRICS.stream_requests_total.fetch_add(1, Ordering::Relaxed);
    }
    info!(
        req_id = %req_id,
        model = %request.model,
        stream = is_stream,
        "Relaying chat completion"
    );

    let payload = match serde_json::to_value(&request) {
        Ok(value) => value,
        Err(e) => {
            METRICS.requests_error.fetch_add(1, Ordering::Relaxed);
            error!(req_id = %req_id, error = %e, "Failed to re-encode request body");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("failed to encode request body"),
            )
                .into_response();
        }
    };

    let call = UpstreamCall::Chat {
        payload,
        stream: is_stream,
    };
    let result = state.engine.dispatch(call).await;
    METRICS.record_request_duration(start);

    match result {
        Ok(UpstreamBody::Streaming(upstream)) => {
            METRICS.requests_success.fetch_add(1, Ordering::Relaxed);
            event_stream_response(upstream, req_id)
        }
        Ok(UpstreamBody::Buffered(bytes)) => {
            METRICS.requests_success.fetch_add(1, Ordering::Relaxed);
            json_passthrough(StatusCode::OK, bytes)
        }
        Err(e) => {
            METRICS.requests_error.fetch_add(1, Ordering::Relaxed);
            error!(req_id = %req_id, error = %e, "Chat completion dispatch failed");
            dispatch_error_response(e)
        }
    }
}

/// `GET /v1/models` — relay the upstream model listing through the pool.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    request_parts: axum::extract::Request,
) -> Response {
    let start = std::time::Instant::now();
    METRICS.requests_total.fetch_add(1, Ordering::Relaxed);
    state.request_count.fetch_add(1, Ordering::Relaxed);

    let req_id = request_id(&request_parts);
    info!(req_id = %req_id, "Relaying model listing");

    let result = state.engine.dispatch(UpstreamCall::Models).await;
    METRICS.record_request_duration(start);

    match result {
        Ok(UpstreamBody::Buffered(bytes)) => {
            METRICS.requests_success.fetch_add(1, Ordering::Relaxed);
            json_passthrough(StatusCode::OK, bytes)
        }
        Ok(UpstreamBody::Streaming(upstream)) => {
            // Model listings are never requested as streams; read the body whole.
            METRICS.requests_success.fetch_add(1, Ordering::Relaxed);
            let bytes = upstream.bytes().await.unwrap_or_default();
            json_passthrough(StatusCode::OK, bytes)
        }
        Err(e) => {
            METRICS.requests_error.fetch_add(1, Ordering::Relaxed);
            error!(req_id = %req_id, error = %e, "Model listing dispatch failed");
            dispatch_error_response(e)
        }
    }
}

/// Readiness probe. Returns 200 once the ring has active keys.
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Lazily flip ready once the ring is populated.
    if !state.ready.load(Ordering::Relaxed) && state.selector.ring_len() > 0 {
        state.ready.store(true, Ordering::Relaxed);
    }

    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Health check with pool and storage status.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = match state.repo.stats_snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "Health check storage failure");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                error_body("storage unavailable"),
            )
                .into_response();
        }
    };

    let status = if snapshot.active_keys == 0 {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        uptime_secs: state.start_time.elapsed().as_secs(),
        requests: state.request_count.load(Ordering::Relaxed),
        ring_keys: state.selector.ring_len(),
        key_pool: PoolCounts::from(&snapshot),
    })
    .into_response()
}

/// Prometheus metrics in text exposition format.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = match state.repo.stats_snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "Metrics storage failure");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("storage unavailable"),
            )
                .into_response();
        }
    };
    let body = METRICS.render(
        state.selector.ring_len(),
        snapshot.active_keys,
        snapshot.inactive_keys,
        snapshot.revoked_keys,
    );
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

fn request_id(request: &axum::extract::Request) -> String {
    request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default()
}

fn json_passthrough(status: StatusCode, bytes: Bytes) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(bytes),
    )
        .into_response()
}

/// Map dispatch errors onto the downstream error surface.
fn dispatch_error_response(error: crate::Error) -> Response {
    match error {
        crate::Error::NoKeysAvailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("no active upstream keys available, add or activate keys"),
        )
            .into_response(),
        crate::Error::Exhausted {
            status: Some(status),
            body,
            ..
        } => {
            // Persistent upstream error: pass the last status and body through.
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            json_passthrough(status, Bytes::from(body))
        }
        error @ crate::Error::Exhausted { status: None, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body(error.to_string()),
        )
            .into_response(),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body(other.to_string()),
        )
            .into_response(),
    }
}
