//! Operator surface: key CRUD, pool statistics and validation triggers.
//!
//! Mounted under `/api` behind the same flat proxy-token auth as the proxy
//! surface.

use crate::repository::KeyStatus;
use crate::response::{
    error_body, BulkAddResponse, BulkAddResult, KeyDisplay, MessageResponse, PageInfo,
    PaginatedKeys, StatsResponse, UsageEntry, ValidationReport,
};
use crate::usage::now_secs;
use crate::{mask_key, AppState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/keys", get(list_keys).post(add_key))
        .route("/api/keys/bulk", post(add_keys_bulk))
        .route("/api/keys/reset", post(reset_inactive_keys))
        .route("/api/keys/{id}", delete(delete_key))
        .route("/api/keys/{id}/status", put(update_key_status))
        .route("/api/keys/{id}/name", put(update_key_name))
        .route("/api/keys/{id}/validate", post(validate_key))
        .route("/api/validate_keys", post(validate_inactive_keys))
        .route("/api/stats", get(stats))
        .route("/api/usage", get(usage))
        .route("/api/usage/cleanup", post(cleanup_usage))
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    pub status: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
pub struct NewKeyPayload {
    pub secret: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkKeysPayload {
    /// One key per line, `secret` or `secret,name`.
    pub keys: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdatePayload {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct NameUpdatePayload {
    pub name: String,
}

/// `GET /api/keys` — paginated listing with masked secrets.
async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> Response {
    let page = params.page.max(1);
    let page_size = params.page_size.clamp(1, 100);
    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => match KeyStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    error_body(format!(
                        "invalid status filter '{raw}', expected active, inactive or revoked"
                    )),
                )
                    .into_response();
            }
        },
    };

    match state.repo.list_paginated(page, page_size, status).await {
        Ok((items, total)) => {
            let items: Vec<KeyDisplay> = items.iter().map(KeyDisplay::from).collect();
            let total_pages = total.div_ceil(page_size as u64);
            Json(PaginatedKeys {
                items,
                page_info: PageInfo {
                    total,
                    page,
                    page_size,
                    total_pages,
                },
            })
            .into_response()
        }
        Err(e) => storage_error(e),
    }
}

/// `POST /api/keys` — add one key to the pool.
async fn add_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewKeyPayload>,
) -> Response {
    let secret = payload.secret.trim();
    if secret.is_empty() {
        return (StatusCode::BAD_REQUEST, error_body("secret must not be empty")).into_response();
    }
    let name = payload
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    match state.repo.add(secret, name).await {
        Ok(id) => {
            info!(key_id = %id, key = %mask_key(secret), "Key added to pool");
            rebuild_ring(&state).await;
            match state.repo.get_by_id(&id).await {
                Ok(Some(key)) => {
                    (StatusCode::CREATED, Json(KeyDisplay::from(&key))).into_response()
                }
                Ok(None) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_body("key vanished after insert"),
                )
                    .into_response(),
                Err(e) => storage_error(e),
            }
        }
        Err(crate::Error::DuplicateSecret) => (
            StatusCode::CONFLICT,
            error_body(format!(
                "a key ending {} already exists",
                mask_key(secret)
            )),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

/// `POST /api/keys/bulk` — add many keys, one per line (`secret[,name]`).
async fn add_keys_bulk(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BulkKeysPayload>,
) -> Response {
    let mut results = Vec::new();
    for line in payload.keys.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (secret, name) = match line.split_once(',') {
            Some((secret, name)) => (secret.trim(), Some(name.trim()).filter(|n| !n.is_empty())),
            None => (line, None),
        };
        match state.repo.add(secret, name).await {
            Ok(id) => results.push(BulkAddResult {
                secret_masked: mask_key(secret),
                success: true,
                key_id: Some(id),
                error: None,
            }),
            Err(e) => {
                warn!(key = %mask_key(secret), error = %e, "Bulk add failed for key");
                results.push(BulkAddResult {
                    secret_masked: mask_key(secret),
                    success: false,
                    key_id: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    rebuild_ring(&state).await;
    let success_count = results.iter().filter(|r| r.success).count();
    let error_count = results.len() - success_count;
    Json(BulkAddResponse {
        results,
        success_count,
        error_count,
    })
    .into_response()
}

/// `PUT /api/keys/{id}/status` — operator-driven status transition. The only
/// path that moves a key in or out of Revoked.
async fn update_key_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<StatusUpdatePayload>,
) -> Response {
    let Some(status) = KeyStatus::parse(&payload.status) else {
        return (
            StatusCode::BAD_REQUEST,
            error_body(format!(
                "invalid status '{}', expected active, inactive or revoked",
                payload.status
            )),
        )
            .into_response();
    };

    match state.repo.set_status(&id, status).await {
        Ok(true) => {
            info!(key_id = %id, status = %status, "Key status updated by operator");
            rebuild_ring(&state).await;
            MessageResponse::new(format!("key {id} status updated to {status}")).into_response()
        }
        Ok(false) => key_not_found(&id),
        Err(e) => storage_error(e),
    }
}

/// `PUT /api/keys/{id}/name`
async fn update_key_name(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<NameUpdatePayload>,
) -> Response {
    match state.repo.set_name(&id, payload.name.trim()).await {
        Ok(true) => MessageResponse::new(format!("key {id} renamed")).into_response(),
        Ok(false) => key_not_found(&id),
        Err(e) => storage_error(e),
    }
}

/// `DELETE /api/keys/{id}` — remove a key and its usage tracking.
async fn delete_key(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.repo.delete(&id).await {
        Ok(true) => {
            state.accountant.forget(&id);
            info!(key_id = %id, "Key deleted");
            rebuild_ring(&state).await;
            MessageResponse::new(format!("key {id} deleted")).into_response()
        }
        Ok(false) => key_not_found(&id),
        Err(e) => storage_error(e),
    }
}

/// `POST /api/keys/reset` — flip every Inactive key back to Active.
async fn reset_inactive_keys(State(state): State<Arc<AppState>>) -> Response {
    let keys = match state.repo.list_all().await {
        Ok(keys) => keys,
        Err(e) => return storage_error(e),
    };

    let mut reset = 0u64;
    for key in keys.iter().filter(|k| k.status == KeyStatus::Inactive) {
        match state.repo.set_status(&key.id, KeyStatus::Active).await {
            Ok(true) => reset += 1,
            Ok(false) => warn!(key_id = %key.id, "Key disappeared during reset"),
            Err(e) => warn!(key_id = %key.id, error = %e, "Failed to reset key"),
        }
    }

    info!(reset, "Inactive keys reset to active");
    rebuild_ring(&state).await;
    MessageResponse::new(format!("reset {reset} inactive keys to active")).into_response()
}

/// `POST /api/validate_keys` — probe every Inactive key.
async fn validate_inactive_keys(State(state): State<Arc<AppState>>) -> Response {
    match state.validator.validate_all_inactive().await {
        Ok(results) => Json(ValidationReport {
            message: format!("validated {} inactive keys", results.len()),
            results,
        })
        .into_response(),
        Err(e) => storage_error(e),
    }
}

/// `POST /api/keys/{id}/validate` — probe a single key.
async fn validate_key(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.validator.validate_one(&id).await {
        Ok(Some(outcome)) => Json(outcome).into_response(),
        Ok(None) => key_not_found(&id),
        Err(e) => storage_error(e),
    }
}

/// `GET /api/stats` — global pool statistics.
async fn stats(State(state): State<Arc<AppState>>) -> Response {
    match state.repo.stats_snapshot().await {
        Ok(snapshot) => Json(StatsResponse {
            global_stats: snapshot,
        })
        .into_response(),
        Err(e) => storage_error(e),
    }
}

/// `GET /api/usage` — per-key sliding-window counts.
async fn usage(State(state): State<Arc<AppState>>) -> Response {
    let mut entries: Vec<UsageEntry> = state
        .accountant
        .aggregate(now_secs())
        .into_iter()
        .map(|(key_id, counts)| UsageEntry { key_id, counts })
        .collect();
    entries.sort_by(|a, b| a.key_id.cmp(&b.key_id));
    Json(entries).into_response()
}

/// `POST /api/usage/cleanup` — drop usage windows for deleted keys.
async fn cleanup_usage(State(state): State<Arc<AppState>>) -> Response {
    let keys = match state.repo.list_all().await {
        Ok(keys) => keys,
        Err(e) => return storage_error(e),
    };
    let valid: HashSet<String> = keys.into_iter().map(|k| k.id).collect();
    let removed = state.accountant.gc(&valid);
    info!(removed, "Cleaned up stale usage windows");
    MessageResponse::new(format!("removed usage tracking for {removed} deleted keys"))
        .into_response()
}

async fn rebuild_ring(state: &AppState) {
    if let Err(e) = state.selector.rebuild().await {
        warn!(error = %e, "Ring rebuild after pool change failed");
    }
}

fn key_not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        error_body(format!("no key with id '{id}'")),
    )
        .into_response()
}

fn storage_error(error: crate::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        error_body(error.to_string()),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_params_defaults() {
        let params: PageParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.page, 1);
        assert_eq!(params.page_size, 10);
        assert!(params.status.is_none());
    }

    #[test]
    fn test_bulk_line_splitting() {
        let payload = BulkKeysPayload {
            keys: "sk-a\nsk-b,backup\n\n  sk-c  \n".into(),
        };
        let lines: Vec<(&str, Option<&str>)> = payload
            .keys
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|line| match line.split_once(',') {
                Some((s, n)) => (s.trim(), Some(n.trim()).filter(|n| !n.is_empty())),
                None => (line, None),
            })
            .collect();
        assert_eq!(
            lines,
            vec![("sk-a", None), ("sk-b", Some("backup")), ("sk-c", None)]
        );
    }
}
