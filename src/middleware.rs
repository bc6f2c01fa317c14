//! Proxy-token authentication and request correlation middleware.

use crate::response::error_body;
use crate::AppState;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Why a bearer token could not be extracted.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AuthFailure {
    MissingHeader,
    Malformed,
}

/// Pull the bearer token out of an `Authorization` header value.
pub(crate) fn bearer_token(header: Option<&str>) -> Result<&str, AuthFailure> {
    let header = header.ok_or(AuthFailure::MissingHeader)?;
    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(AuthFailure::Malformed),
    }
}

/// Constant-time membership test against the configured token set.
pub(crate) fn token_matches(accepted: &[String], provided: &str) -> bool {
    accepted.iter().any(|token| {
        token.len() == provided.len()
            && bool::from(token.as_bytes().ct_eq(provided.as_bytes()))
    })
}

/// Validate `Authorization: Bearer <token>` against the configured proxy
/// tokens. Missing or malformed header → 401; unknown token → 403.
pub async fn proxy_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let token = match bearer_token(header) {
        Ok(token) => token,
        Err(AuthFailure::MissingHeader) => {
            return (
                StatusCode::UNAUTHORIZED,
                error_body("missing Authorization header"),
            )
                .into_response();
        }
        Err(AuthFailure::Malformed) => {
            return (
                StatusCode::UNAUTHORIZED,
                error_body("invalid Authorization header, expected 'Bearer <token>'"),
            )
                .into_response();
        }
    };

    if !token_matches(&state.config.proxy_api_keys, token) {
        warn!("Rejected request with unknown proxy token");
        return (StatusCode::FORBIDDEN, error_body("invalid proxy token")).into_response();
    }

    next.run(request).await
}

/// Propagate or generate `x-request-id` for end-to-end correlation.
pub async fn inject_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            format!("rly-{:016x}", rng.gen::<u64>())
        });

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Request correlation ID, extractable from `Request::extensions()`.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_accepts_well_formed_header() {
        assert_eq!(bearer_token(Some("Bearer tok-123")), Ok("tok-123"));
        assert_eq!(bearer_token(Some("bearer tok-123")), Ok("tok-123"));
    }

    #[test]
    fn test_bearer_token_rejects_missing_header() {
        assert_eq!(bearer_token(None), Err(AuthFailure::MissingHeader));
    }

    #[test]
    fn test_bearer_token_rejects_malformed_headers() {
        for header in ["tok-123", "Basic tok-123", "Bearer", "Bearer a b"] {
            assert_eq!(
                bearer_token(Some(header)),
                Err(AuthFailure::Malformed),
                "header: {header:?}"
            );
        }
    }

    #[test]
    fn test_token_matches_exact_member_only() {
        let accepted = vec!["alpha".to_string(), "beta".to_string()];
        assert!(token_matches(&accepted, "alpha"));
        assert!(token_matches(&accepted, "beta"));
        assert!(!token_matches(&accepted, "alph"));
        assert!(!token_matches(&accepted, "alphaa"));
        assert!(!token_matches(&accepted, "gamma"));
    }

    #[test]
    fn test_token_matches_empty_set_rejects_everything() {
        assert!(!token_matches(&[], "anything"));
    }
}
