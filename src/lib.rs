//! Authenticating reverse proxy for OpenAI-compatible chat APIs.
//!
//! Hides a pool of upstream provider credentials behind a small set of proxy
//! bearer tokens. Each request is dispatched onto a rotating, health-aware
//! upstream key; faulty keys are deactivated and retried onto the next one.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod repository;
pub mod response;
pub mod selector;
pub mod state;
pub mod stream;
pub mod upstream;
pub mod usage;
pub mod validator;

pub use config::Config;
pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Crate-wide error type.
#[derive(Debug)]
pub enum Error {
    /// Invalid or unusable configuration.
    Config(String),
    /// Repository operation failed. Fatal on the dispatch path.
    Storage(String),
    /// A key with the same secret already exists in the pool.
    DuplicateSecret,
    /// Connection, timeout, DNS or TLS failure talking to the upstream.
    Transport(String),
    /// The active key ring was empty on the first dispatch attempt.
    NoKeysAvailable,
    /// Every dispatch attempt failed; carries the last observed cause.
    Exhausted {
        attempts: u32,
        /// Last upstream HTTP status, if any attempt got that far.
        status: Option<u16>,
        body: String,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::Storage(msg) => write!(f, "storage error: {msg}"),
            Error::DuplicateSecret => write!(f, "a key with this secret already exists"),
            Error::Transport(msg) => write!(f, "upstream transport error: {msg}"),
            Error::NoKeysAvailable => write!(f, "no active upstream keys available"),
            Error::Exhausted {
                attempts,
                status: Some(status),
                body,
            } => write!(f, "all {attempts} attempts failed, last upstream status {status}: {body}"),
            Error::Exhausted { attempts, body, .. } => {
                write!(f, "all {attempts} attempts failed: {body}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Build the full application router.
///
/// Operational probes (`/health`, `/ready`, `/metrics`) are open; the proxy
/// surface (`/v1/*`) and operator surface (`/api/*`) require a proxy token.
pub fn create_router(state: Arc<AppState>) -> Router {
    let authed = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .merge(admin::router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::proxy_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .merge(authed)
        .layer(axum::middleware::from_fn(middleware::inject_request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Mask a secret for display: fixed 10 characters, revealing at most the
/// first 3 and last 4 characters.
pub fn mask_key(secret: &str) -> String {
    if secret.is_empty() || !secret.is_ascii() {
        return format!("{:<10}", "N/A");
    }

    if let Some(rest) = secret.strip_prefix("sk-") {
        if rest.len() >= 4 {
            return format!("sk-...{}", &secret[secret.len() - 4..]);
        }
        return format!("{:<10}", format!("sk-...{rest}"));
    }

    if secret.len() >= 7 {
        return format!("{}...{}", &secret[..3], &secret[secret.len() - 4..]);
    }

    let masked = if secret.len() == 1 {
        format!("{}...", &secret[..1])
    } else {
        format!("{}...{}", &secret[..1], &secret[secret.len() - 1..])
    };
    format!("{masked:<10}")
}
