//! Dispatch engine: the per-request retry loop.
//!
//! Sole policy point for upstream outcomes. Selector, accountant and relay
//! report facts; this module decides what deactivates a key, what retries
//! and what surfaces to the caller.

use crate::mask_key;
use crate::metrics::METRICS;
use crate::repository::{KeyRepository, KeyStatus, UpstreamKey};
use crate::selector::KeySelector;
use crate::upstream::{UpstreamApi, UpstreamBody, UpstreamCall};
use crate::usage::{now_secs, UsageAccountant};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Pause between dispatch attempts.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Rotation-aware request dispatcher.
pub struct Engine {
    repo: Arc<dyn KeyRepository>,
    selector: Arc<KeySelector>,
    accountant: Arc<UsageAccountant>,
    upstream: Arc<dyn UpstreamApi>,
    max_retries: u32,
}

impl Engine {
    pub fn new(
        repo: Arc<dyn KeyRepository>,
        selector: Arc<KeySelector>,
        accountant: Arc<UsageAccountant>,
        upstream: Arc<dyn UpstreamApi>,
        max_retries: u32,
    ) -> Self {
        Self {
            repo,
            selector,
            accountant,
            upstream,
            max_retries: max_retries.max(1),
        }
    }

    /// Dispatch one downstream request onto the pool.
    ///
    /// Upstream 200 returns the reply body (or the unread streaming
    /// response) after the accounting side effects have landed. An empty
    /// ring on the first attempt is terminal ([`crate::Error::NoKeysAvailable`]);
    /// later attempts treat it as retryable. Exhaustion surfaces the last
    /// observed upstream status and body, or the transport failure.
    pub async fn dispatch(&self, call: UpstreamCall) -> Result<UpstreamBody, crate::Error> {
        let mut last_status: Option<u16> = None;
        let mut last_body = String::from("no upstream call was attempted");

        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                tokio::time::sleep(RETRY_DELAY).await;
            }

            let Some(candidate) = self.selector.next().await? else {
                if attempt == 1 {
                    warn!("No active upstream keys available");
                    return Err(crate::Error::NoKeysAvailable);
                }
                info!(
                    attempt,
                    max_attempts = self.max_retries,
                    "Key ring empty on retry, continuing"
                );
                continue;
            };

            METRICS.dispatch_attempts_total.fetch_add(1, Ordering::Relaxed);
            let masked = mask_key(&candidate.secret);
            if attempt > 1 {
                info!(
                    attempt,
                    max_attempts = self.max_retries,
                    key_id = %candidate.id,
                    key = %masked,
                    "Retrying with next key"
                );
            }

            match self.upstream.call(&call, &candidate.secret).await {
                Ok(response) if response.status == 200 => {
                    self.record_success(&candidate, &call).await;
                    return Ok(response.body);
                }
                Ok(response) => {
                    let status = response.status;
                    let body = response.into_text().await;
                    error!(
                        key_id = %candidate.id,
                        key = %masked,
                        status,
                        "Upstream returned an error"
                    );
                    if matches!(status, 401 | 403 | 429) {
                        self.deactivate(&candidate, &format!("upstream status {status}"))
                            .await?;
                    }
                    last_status = Some(status);
                    last_body = body;
                }
                Err(crate::Error::Transport(cause)) => {
                    error!(
                        key_id = %candidate.id,
                        key = %masked,
                        error = %cause,
                        "Upstream transport error"
                    );
                    self.deactivate(&candidate, "transport error").await?;
                    last_status = None;
                    last_body = cause;
                }
                Err(other) => return Err(other),
            }
        }

        Err(crate::Error::Exhausted {
            attempts: self.max_retries,
            status: last_status,
            body: last_body,
        })
    }

    /// Accounting for a successful dispatch. Fires before the response (or
    /// first streamed byte) reaches the caller and never fails the request.
    async fn record_success(&self, key: &UpstreamKey, call: &UpstreamCall) {
        let model = call.model_label();
        self.accountant.record(&key.id, now_secs());
        if let Err(e) = self.repo.touch_last_used(&key.id).await {
            warn!(key_id = %key.id, error = %e, "Failed to update last_used_at");
        }
        if let Err(e) = self.repo.increment_total_requests(&key.id).await {
            warn!(key_id = %key.id, error = %e, "Failed to increment total_requests");
        }
        if let Err(e) = self
            .repo
            .append_log(&key.id, model.as_deref(), Some("success"))
            .await
        {
            warn!(key_id = %key.id, error = %e, "Failed to append request log");
        }
    }

    /// Take a faulty key out of rotation and refresh the ring so the
    /// transition is visible to subsequent rebuilds.
    async fn deactivate(&self, key: &UpstreamKey, reason: &str) -> Result<(), crate::Error> {
        METRICS.keys_deactivated_total.fetch_add(1, Ordering::Relaxed);
        self.repo.set_status(&key.id, KeyStatus::Inactive).await?;
        info!(
            key_id = %key.id,
            key = %mask_key(&key.secret),
            reason,
            "Key deactivated"
        );
        self.selector.rebuild().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteRepository;
    use crate::upstream::testing::{FakeOutcome, FakeUpstream};
    use serde_json::json;

    struct Harness {
        repo: Arc<SqliteRepository>,
        selector: Arc<KeySelector>,
        accountant: Arc<UsageAccountant>,
        upstream: Arc<FakeUpstream>,
        engine: Engine,
    }

    async fn harness(
        secrets: &[&str],
        max_retries: u32,
        outcomes: Vec<FakeOutcome>,
    ) -> Harness {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        for secret in secrets {
            repo.add(secret, None).await.unwrap();
        }
        let selector = Arc::new(KeySelector::new(repo.clone(), 100));
        selector.rebuild().await.unwrap();
        let accountant = Arc::new(UsageAccountant::new(86_400));
        let upstream = Arc::new(FakeUpstream::scripted(outcomes));
        let engine = Engine::new(
            repo.clone(),
            selector.clone(),
            accountant.clone(),
            upstream.clone(),
            max_retries,
        );
        Harness {
            repo,
            selector,
            accountant,
            upstream,
            engine,
        }
    }

    fn chat_call() -> UpstreamCall {
        UpstreamCall::Chat {
            payload: json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
            stream: false,
        }
    }

    async fn body_text(body: UpstreamBody) -> String {
        match body {
            UpstreamBody::Buffered(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            UpstreamBody::Streaming(_) => panic!("expected buffered body"),
        }
    }

    #[tokio::test]
    async fn test_happy_path_accounts_and_returns_body() {
        let h = harness(&["sk-k1"], 5, vec![FakeOutcome::Status(200, r#"{"id":"x"}"#)]).await;

        let body = h.engine.dispatch(chat_call()).await.unwrap();
        assert_eq!(body_text(body).await, r#"{"id":"x"}"#);

        let key = h.repo.get_by_secret("sk-k1").await.unwrap().unwrap();
        assert_eq!(key.total_requests, 1);
        assert!(key.last_used_at.is_some());

        let snapshot = h.repo.stats_snapshot().await.unwrap();
        assert_eq!(snapshot.usage_last_24h, 1);

        let usage = h.accountant.aggregate(now_secs());
        assert_eq!(usage[&key.id].last_1m, 1);
        assert_eq!(h.upstream.call_count(), 1);
    }

    #[tokio::test]
    async fn test_key_fault_fails_over_to_next_key() {
        let h = harness(
            &["sk-k1", "sk-k2"],
            5,
            vec![
                FakeOutcome::Status(401, "unauthorized"),
                FakeOutcome::Status(200, r#"{"id":"x"}"#),
            ],
        )
        .await;

        let body = h.engine.dispatch(chat_call()).await.unwrap();
        assert_eq!(body_text(body).await, r#"{"id":"x"}"#);
        assert_eq!(h.upstream.call_count(), 2);

        // First candidate was deactivated; exactly one key accounted.
        let k1 = h.repo.get_by_secret("sk-k1").await.unwrap().unwrap();
        let k2 = h.repo.get_by_secret("sk-k2").await.unwrap().unwrap();
        let (faulted, used) = if k1.status == KeyStatus::Inactive {
            (k1, k2)
        } else {
            (k2, k1)
        };
        assert_eq!(faulted.status, KeyStatus::Inactive);
        assert_eq!(faulted.total_requests, 0);
        assert_eq!(used.status, KeyStatus::Active);
        assert_eq!(used.total_requests, 1);

        let snapshot = h.repo.stats_snapshot().await.unwrap();
        assert_eq!(snapshot.usage_last_24h, 1);
    }

    #[tokio::test]
    async fn test_deactivated_key_leaves_active_list() {
        let h = harness(
            &["sk-k1"],
            2,
            vec![FakeOutcome::Status(429, "rate limited")],
        )
        .await;

        let err = h.engine.dispatch(chat_call()).await.unwrap_err();
        assert!(matches!(err, crate::Error::Exhausted { .. }));
        assert!(h.repo.list_active(100).await.unwrap().is_empty());

        // The pool is now empty, so a fresh dispatch is terminal immediately.
        let err = h.engine.dispatch(chat_call()).await.unwrap_err();
        assert!(matches!(err, crate::Error::NoKeysAvailable));
    }

    #[tokio::test]
    async fn test_empty_pool_on_first_attempt_is_terminal() {
        let h = harness(&[], 5, vec![]).await;
        let err = h.engine.dispatch(chat_call()).await.unwrap_err();
        assert!(matches!(err, crate::Error::NoKeysAvailable));
        assert_eq!(h.upstream.call_count(), 0);
        assert_eq!(h.repo.stats_snapshot().await.unwrap().usage_last_24h, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_upstream_error_without_deactivation() {
        let h = harness(
            &["sk-k1", "sk-k2"],
            2,
            vec![
                FakeOutcome::Status(500, "oops"),
                FakeOutcome::Status(500, "oops"),
            ],
        )
        .await;

        let err = h.engine.dispatch(chat_call()).await.unwrap_err();
        match err {
            crate::Error::Exhausted {
                attempts,
                status,
                body,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(status, Some(500));
                assert_eq!(body, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Non-credential upstream errors never deactivate.
        assert_eq!(h.repo.list_active(100).await.unwrap().len(), 2);
        assert_eq!(h.repo.stats_snapshot().await.unwrap().usage_last_24h, 0);
    }

    #[tokio::test]
    async fn test_transport_error_deactivates_and_retries() {
        let h = harness(
            &["sk-k1", "sk-k2"],
            5,
            vec![
                FakeOutcome::Transport("connection refused"),
                FakeOutcome::Status(200, "{}"),
            ],
        )
        .await;

        h.engine.dispatch(chat_call()).await.unwrap();
        assert_eq!(h.upstream.call_count(), 2);
        assert_eq!(h.repo.list_active(100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_single_key_fault_empties_ring_then_exhausts() {
        let h = harness(
            &["sk-k1"],
            3,
            vec![FakeOutcome::Transport("reset by peer")],
        )
        .await;

        let err = h.engine.dispatch(chat_call()).await.unwrap_err();
        match err {
            crate::Error::Exhausted { status, body, .. } => {
                assert_eq!(status, None);
                assert_eq!(body, "reset by peer");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Only one upstream call was possible; later attempts saw an empty ring.
        assert_eq!(h.upstream.call_count(), 1);
        assert_eq!(h.selector.ring_len(), 0);
    }

    #[tokio::test]
    async fn test_max_retries_zero_clamps_to_one_attempt() {
        let h = harness(
            &["sk-k1", "sk-k2"],
            0,
            vec![FakeOutcome::Status(500, "oops")],
        )
        .await;

        let err = h.engine.dispatch(chat_call()).await.unwrap_err();
        assert!(matches!(err, crate::Error::Exhausted { attempts: 1, .. }));
        assert_eq!(h.upstream.call_count(), 1);
    }

    #[tokio::test]
    async fn test_models_call_logs_models_label() {
        let h = harness(&["sk-k1"], 5, vec![FakeOutcome::Status(200, "{}")]).await;
        h.engine.dispatch(UpstreamCall::Models).await.unwrap();
        let key = h.repo.get_by_secret("sk-k1").await.unwrap().unwrap();
        assert_eq!(key.total_requests, 1);
    }
}
