//! Application state shared across all handlers, plus the background
//! housekeeping loop.

use crate::config::Config;
use crate::dispatch::Engine;
use crate::repository::{KeyRepository, SqliteRepository};
use crate::selector::KeySelector;
use crate::upstream::{UpstreamApi, UpstreamClient};
use crate::usage::UsageAccountant;
use crate::validator::KeyValidator;
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub repo: Arc<dyn KeyRepository>,
    pub selector: Arc<KeySelector>,
    pub accountant: Arc<UsageAccountant>,
    pub engine: Engine,
    pub validator: KeyValidator,
    pub start_time: Instant,
    pub request_count: AtomicU64,
    /// False until the ring has active keys. `/ready` returns 503 until then.
    pub ready: AtomicBool,
}

impl AppState {
    /// Initialize from config: open the repository, build the shared
    /// upstream client and load the initial key ring.
    pub async fn new(config: Config) -> Result<Self, crate::Error> {
        let repo: Arc<dyn KeyRepository> =
            Arc::new(SqliteRepository::open(Path::new(&config.database_path))?);
        let upstream: Arc<dyn UpstreamApi> = Arc::new(UpstreamClient::new(&config)?);
        let selector = Arc::new(KeySelector::new(
            Arc::clone(&repo),
            config.max_active_keys_limit,
        ));
        let accountant = Arc::new(UsageAccountant::new(config.usage_window_seconds));

        let active = selector.rebuild().await?;
        info!(active_keys = active, "Key pool loaded");

        let engine = Engine::new(
            Arc::clone(&repo),
            Arc::clone(&selector),
            Arc::clone(&accountant),
            Arc::clone(&upstream),
            config.max_retries,
        );
        let validator = KeyValidator::new(
            Arc::clone(&repo),
            Arc::clone(&selector),
            Arc::clone(&upstream),
            config.validation_model.clone(),
        );

        Ok(Self {
            ready: AtomicBool::new(active > 0),
            config,
            repo,
            selector,
            accountant,
            engine,
            validator,
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
        })
    }
}

/// Periodic maintenance: prune aged request-log rows and drop usage windows
/// for deleted keys. Returns when `cancel` is triggered.
pub async fn run_housekeeping(state: Arc<AppState>, cancel: CancellationToken) {
    let interval = Duration::from_secs(state.config.housekeeping_interval_seconds);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = cancel.cancelled() => {
                info!("Housekeeping shutting down");
                return;
            }
        }

        if let Err(e) = housekeeping_tick(&state).await {
            error!(error = %e, "Housekeeping tick failed");
        }
    }
}

async fn housekeeping_tick(state: &AppState) -> Result<(), crate::Error> {
    let cutoff = Utc::now() - chrono::Duration::seconds(state.config.log_retention_seconds as i64);
    let pruned = state.repo.prune_logs(cutoff).await?;
    if pruned > 0 {
        info!(pruned, "Pruned aged request log entries");
    }

    let valid: HashSet<String> = state
        .repo
        .list_all()
        .await?
        .into_iter()
        .map(|k| k.id)
        .collect();
    let removed = state.accountant.gc(&valid);
    if removed > 0 {
        info!(removed, "Dropped usage windows for deleted keys");
    }

    Ok(())
}
