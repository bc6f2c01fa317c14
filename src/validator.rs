//! On-demand key health probe.
//!
//! Re-activates previously disabled keys by issuing a minimal upstream
//! chat-completion call. Revoked keys are never touched.

use crate::mask_key;
use crate::repository::{KeyRepository, KeyStatus, UpstreamKey};
use crate::response::ValidationOutcome;
use crate::selector::KeySelector;
use crate::upstream::UpstreamApi;
use std::sync::Arc;
use tracing::{info, warn};

pub struct KeyValidator {
    repo: Arc<dyn KeyRepository>,
    selector: Arc<KeySelector>,
    upstream: Arc<dyn UpstreamApi>,
    model: String,
}

impl KeyValidator {
    pub fn new(
        repo: Arc<dyn KeyRepository>,
        selector: Arc<KeySelector>,
        upstream: Arc<dyn UpstreamApi>,
        model: String,
    ) -> Self {
        Self {
            repo,
            selector,
            upstream,
            model,
        }
    }

    /// Probe one key by id. `None` when the id is unknown.
    pub async fn validate_one(
        &self,
        id: &str,
    ) -> Result<Option<ValidationOutcome>, crate::Error> {
        let Some(key) = self.repo.get_by_id(id).await? else {
            return Ok(None);
        };
        Ok(Some(self.probe_key(&key).await?))
    }

    /// Probe every Inactive key, re-activating the ones that answer 200.
    pub async fn validate_all_inactive(&self) -> Result<Vec<ValidationOutcome>, crate::Error> {
        let inactive: Vec<UpstreamKey> = self
            .repo
            .list_all()
            .await?
            .into_iter()
            .filter(|k| k.status == KeyStatus::Inactive)
            .collect();
        info!(count = inactive.len(), "Validating inactive keys");

        let mut results = Vec::with_capacity(inactive.len());
        for key in &inactive {
            results.push(self.probe_key(key).await?);
        }
        Ok(results)
    }

    async fn probe_key(&self, key: &UpstreamKey) -> Result<ValidationOutcome, crate::Error> {
        let masked = mask_key(&key.secret);

        if key.status == KeyStatus::Revoked {
            return Ok(ValidationOutcome {
                key_id: key.id.clone(),
                secret_masked: masked,
                status_before: key.status.to_string(),
                status_after: key.status.to_string(),
                success: false,
                detail: Some("revoked keys are never re-activated by validation".into()),
            });
        }

        match self.upstream.probe(&key.secret, &self.model).await {
            Ok((200, _)) => {
                self.repo.set_status(&key.id, KeyStatus::Active).await?;
                self.selector.rebuild().await?;
                info!(key_id = %key.id, key = %masked, "Key validated, back in rotation");
                Ok(ValidationOutcome {
                    key_id: key.id.clone(),
                    secret_masked: masked,
                    status_before: key.status.to_string(),
                    status_after: KeyStatus::Active.to_string(),
                    success: true,
                    detail: None,
                })
            }
            Ok((status, body)) => {
                self.repo.set_status(&key.id, KeyStatus::Inactive).await?;
                warn!(key_id = %key.id, key = %masked, status, "Key validation failed");
                Ok(ValidationOutcome {
                    key_id: key.id.clone(),
                    secret_masked: masked,
                    status_before: key.status.to_string(),
                    status_after: KeyStatus::Inactive.to_string(),
                    success: false,
                    detail: Some(format!("upstream responded {status}: {body}")),
                })
            }
            Err(crate::Error::Transport(cause)) => {
                self.repo.set_status(&key.id, KeyStatus::Inactive).await?;
                warn!(key_id = %key.id, key = %masked, error = %cause, "Key validation probe failed");
                Ok(ValidationOutcome {
                    key_id: key.id.clone(),
                    secret_masked: masked,
                    status_before: key.status.to_string(),
                    status_after: KeyStatus::Inactive.to_string(),
                    success: false,
                    detail: Some(cause),
                })
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteRepository;
    use crate::upstream::testing::{FakeOutcome, FakeUpstream};

    struct Harness {
        repo: Arc<SqliteRepository>,
        selector: Arc<KeySelector>,
        validator: KeyValidator,
    }

    async fn harness(outcomes: Vec<FakeOutcome>) -> Harness {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        let selector = Arc::new(KeySelector::new(repo.clone(), 100));
        let upstream = Arc::new(FakeUpstream::scripted(outcomes));
        let validator = KeyValidator::new(
            repo.clone(),
            selector.clone(),
            upstream,
            "gpt-3.5-turbo".into(),
        );
        Harness {
            repo,
            selector,
            validator,
        }
    }

    #[tokio::test]
    async fn test_probe_200_reactivates_and_rebuilds_ring() {
        let h = harness(vec![FakeOutcome::Status(200, "{}")]).await;
        let id = h.repo.add("sk-inactive", None).await.unwrap();
        h.repo.set_status(&id, KeyStatus::Inactive).await.unwrap();

        let outcome = h.validator.validate_one(&id).await.unwrap().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.status_before, "inactive");
        assert_eq!(outcome.status_after, "active");

        let key = h.repo.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(key.status, KeyStatus::Active);
        // Ring rebuild picked the key up again.
        assert_eq!(h.selector.ring_len(), 1);
    }

    #[tokio::test]
    async fn test_probe_failure_keeps_key_inactive() {
        let h = harness(vec![FakeOutcome::Status(401, "bad key")]).await;
        let id = h.repo.add("sk-bad", None).await.unwrap();
        h.repo.set_status(&id, KeyStatus::Inactive).await.unwrap();

        let outcome = h.validator.validate_one(&id).await.unwrap().unwrap();
        assert!(!outcome.success);
        assert!(outcome.detail.unwrap().contains("401"));
        let key = h.repo.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(key.status, KeyStatus::Inactive);
    }

    #[tokio::test]
    async fn test_revoked_key_is_never_reactivated() {
        let h = harness(vec![FakeOutcome::Status(200, "{}")]).await;
        let id = h.repo.add("sk-revoked", None).await.unwrap();
        h.repo.set_status(&id, KeyStatus::Revoked).await.unwrap();

        let outcome = h.validator.validate_one(&id).await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status_after, "revoked");
        let key = h.repo.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(key.status, KeyStatus::Revoked);
    }

    #[tokio::test]
    async fn test_transport_failure_reports_detail() {
        let h = harness(vec![FakeOutcome::Transport("timed out")]).await;
        let id = h.repo.add("sk-flaky", None).await.unwrap();
        h.repo.set_status(&id, KeyStatus::Inactive).await.unwrap();

        let outcome = h.validator.validate_one(&id).await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.detail.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_validate_all_probes_only_inactive() {
        let h = harness(vec![FakeOutcome::Status(200, "{}")]).await;
        h.repo.add("sk-active", None).await.unwrap();
        let inactive = h.repo.add("sk-down", None).await.unwrap();
        h.repo
            .set_status(&inactive, KeyStatus::Inactive)
            .await
            .unwrap();

        let results = h.validator.validate_all_inactive().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key_id, inactive);
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn test_validate_one_unknown_id() {
        let h = harness(vec![]).await;
        assert!(h.validator.validate_one("missing").await.unwrap().is_none());
    }
}
