//! Serializable response bodies for the proxy and operator surfaces.

use crate::mask_key;
use crate::repository::{StatsSnapshot, UpstreamKey};
use crate::usage::WindowCounts;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// JSON error payload, used by middleware and handlers alike.
pub fn error_body(message: impl Into<String>) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: message.into(),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub requests: u64,
    pub ring_keys: usize,
    pub key_pool: PoolCounts,
}

#[derive(Debug, Serialize)]
pub struct PoolCounts {
    pub active: u64,
    pub inactive: u64,
    pub revoked: u64,
    pub total: u64,
}

impl From<&StatsSnapshot> for PoolCounts {
    fn from(snapshot: &StatsSnapshot) -> Self {
        Self {
            active: snapshot.active_keys,
            inactive: snapshot.inactive_keys,
            revoked: snapshot.revoked_keys,
            total: snapshot.total_keys,
        }
    }
}

/// A pool key with its secret masked for display.
#[derive(Debug, Serialize)]
pub struct KeyDisplay {
    pub id: String,
    pub secret_masked: String,
    pub status: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
}

impl From<&UpstreamKey> for KeyDisplay {
    fn from(key: &UpstreamKey) -> Self {
        Self {
            id: key.id.clone(),
            secret_masked: mask_key(&key.secret),
            status: key.status.to_string(),
            name: key.name.clone(),
            created_at: key.created_at,
            last_used_at: key.last_used_at,
            total_requests: key.total_requests,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PageInfo {
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

#[derive(Debug, Serialize)]
pub struct PaginatedKeys {
    pub items: Vec<KeyDisplay>,
    pub page_info: PageInfo,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub global_stats: StatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct UsageEntry {
    pub key_id: String,
    #[serde(flatten)]
    pub counts: WindowCounts,
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub message: String,
    pub results: Vec<ValidationOutcome>,
}

/// Result of one key validation probe.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub key_id: String,
    pub secret_masked: String,
    pub status_before: String,
    pub status_after: String,
    pub success: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BulkAddResult {
    pub secret_masked: String,
    pub success: bool,
    pub key_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BulkAddResponse {
    pub results: Vec<BulkAddResult>,
    pub success_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::KeyStatus;

    #[test]
    fn test_key_display_masks_secret() {
        let key = UpstreamKey {
            id: "id-1".into(),
            secret: "sk-supersecretvalue".into(),
            status: KeyStatus::Active,
            name: Some("primary".into()),
            created_at: Utc::now(),
            last_used_at: None,
            total_requests: 3,
        };
        let display = KeyDisplay::from(&key);
        assert_eq!(display.secret_masked, "sk-...alue");
        assert_eq!(display.status, "active");
        assert!(!serde_json::to_string(&display)
            .unwrap()
            .contains("supersecret"));
    }
}
