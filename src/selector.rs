//! Round-robin key selection over an immutable ring snapshot.

use crate::metrics::METRICS;
use crate::repository::{KeyRepository, UpstreamKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Hands out the next active key under concurrency.
///
/// The ring is an immutable snapshot swapped atomically on rebuild; the
/// cursor is a fetch-add index into it, so concurrent callers never see a
/// torn ring and N calls against one snapshot cover N distinct positions.
/// Callers may still receive a key that a parallel request just deactivated;
/// the dispatch retry loop absorbs that.
pub struct KeySelector {
    repo: Arc<dyn KeyRepository>,
    ring: RwLock<Arc<Vec<UpstreamKey>>>,
    next: AtomicU64,
    limit: u32,
}

impl KeySelector {
    pub fn new(repo: Arc<dyn KeyRepository>, limit: u32) -> Self {
        Self {
            repo,
            ring: RwLock::new(Arc::new(Vec::new())),
            next: AtomicU64::new(0),
            limit,
        }
    }

    /// Next candidate in strict round-robin order. An empty ring triggers
    /// one rebuild and one retry; `None` means the pool has no active keys.
    pub async fn next(&self) -> Result<Option<UpstreamKey>, crate::Error> {
        if let Some(key) = self.advance() {
            return Ok(Some(key));
        }
        self.rebuild().await?;
        Ok(self.advance())
    }

    fn advance(&self) -> Option<UpstreamKey> {
        let ring = self.snapshot();
        if ring.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) as usize % ring.len();
        Some(ring[idx].clone())
    }

    /// Refresh the ring from the repository, coldest keys first, and swap it
    /// in atomically. Returns the new ring size.
    pub async fn rebuild(&self) -> Result<usize, crate::Error> {
        let keys = self.repo.list_active(self.limit).await?;
        let count = keys.len();
        *self.ring.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(keys);
        METRICS.ring_rebuilds_total.fetch_add(1, Ordering::Relaxed);
        info!(active_keys = count, "Key ring rebuilt");
        Ok(count)
    }

    pub fn snapshot(&self) -> Arc<Vec<UpstreamKey>> {
        Arc::clone(&self.ring.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn ring_len(&self) -> usize {
        self.snapshot().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{KeyStatus, SqliteRepository};
    use std::collections::HashSet;

    async fn selector_with_keys(n: usize) -> (Arc<SqliteRepository>, KeySelector) {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        for i in 0..n {
            repo.add(&format!("sk-ring-{i}"), None).await.unwrap();
        }
        let selector = KeySelector::new(repo.clone(), 100);
        (repo, selector)
    }

    #[tokio::test]
    async fn test_next_rebuilds_lazily_from_empty_ring() {
        let (_repo, selector) = selector_with_keys(2).await;
        assert_eq!(selector.ring_len(), 0);

        let key = selector.next().await.unwrap();
        assert!(key.is_some());
        assert_eq!(selector.ring_len(), 2);
    }

    #[tokio::test]
    async fn test_next_empty_pool_returns_none() {
        let (_repo, selector) = selector_with_keys(0).await;
        assert!(selector.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_robin_is_fair_per_snapshot() {
        let (_repo, selector) = selector_with_keys(4).await;
        selector.rebuild().await.unwrap();

        let mut seen = HashSet::new();
        for _ in 0..4 {
            let key = selector.next().await.unwrap().unwrap();
            seen.insert(key.id);
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_rotation_wraps_around() {
        let (_repo, selector) = selector_with_keys(2).await;
        selector.rebuild().await.unwrap();

        let first = selector.next().await.unwrap().unwrap();
        let second = selector.next().await.unwrap().unwrap();
        let third = selector.next().await.unwrap().unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.id, third.id);
    }

    #[tokio::test]
    async fn test_single_key_ring_always_returns_it() {
        let (_repo, selector) = selector_with_keys(1).await;
        for _ in 0..3 {
            let key = selector.next().await.unwrap().unwrap();
            assert_eq!(key.secret, "sk-ring-0");
        }
    }

    #[tokio::test]
    async fn test_deactivated_key_gone_after_rebuild() {
        let (repo, selector) = selector_with_keys(2).await;
        selector.rebuild().await.unwrap();

        let victim = selector.next().await.unwrap().unwrap();
        repo.set_status(&victim.id, KeyStatus::Inactive)
            .await
            .unwrap();
        selector.rebuild().await.unwrap();

        assert_eq!(selector.ring_len(), 1);
        for _ in 0..3 {
            let key = selector.next().await.unwrap().unwrap();
            assert_ne!(key.id, victim.id);
        }
    }

    #[tokio::test]
    async fn test_rebuild_preserves_coldest_first_order() {
        let (repo, selector) = selector_with_keys(3).await;
        let warm = repo.get_by_secret("sk-ring-1").await.unwrap().unwrap();
        repo.touch_last_used(&warm.id).await.unwrap();

        selector.rebuild().await.unwrap();
        let ring = selector.snapshot();
        assert_eq!(ring.last().unwrap().id, warm.id);
    }
}
