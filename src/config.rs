//! Application configuration.
//!
//! Loaded by the binary from `relay.toml` (optional) layered under
//! `RELAY_`-prefixed environment variables.

use serde::Deserialize;
use tracing::warn;

/// Default OpenAI v1 endpoints; overridable for compatible providers.
pub const DEFAULT_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODELS_URL: &str = "https://api.openai.com/v1/models";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    /// Downstream bearer tokens accepted on `/v1/*` and `/api/*`. At least
    /// one is required; the binary refuses to start with an empty list.
    pub proxy_api_keys: Vec<String>,
    pub upstream_chat_url: String,
    pub upstream_models_url: String,
    /// Dispatch attempts per request. Clamped to >= 1.
    pub max_retries: u32,
    /// Advisory only; not consulted for rotation or admission.
    pub max_calls_per_key_per_window: u32,
    /// Retention of per-key usage timestamps in memory.
    pub usage_window_seconds: u64,
    /// Caps the active ring size per rebuild.
    pub max_active_keys_limit: u32,
    pub database_path: String,
    /// Model used by the key validator's minimal probe call.
    pub validation_model: String,
    pub log_retention_seconds: u64,
    pub housekeeping_interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
            proxy_api_keys: Vec::new(),
            upstream_chat_url: DEFAULT_CHAT_URL.into(),
            upstream_models_url: DEFAULT_MODELS_URL.into(),
            max_retries: 5,
            max_calls_per_key_per_window: 1000,
            usage_window_seconds: 86_400,
            max_active_keys_limit: 100,
            database_path: "data/chat-relay.db".into(),
            validation_model: "gpt-3.5-turbo".into(),
            log_retention_seconds: 604_800,
            housekeeping_interval_seconds: 300,
        }
    }
}

impl Config {
    /// Clamp out-of-range values, warning about each correction.
    pub fn normalized(mut self) -> Self {
        if self.max_retries == 0 {
            warn!("max_retries=0 is invalid, clamping to 1");
            self.max_retries = 1;
        }
        if self.max_active_keys_limit == 0 {
            warn!("max_active_keys_limit=0 would empty the ring, clamping to 1");
            self.max_active_keys_limit = 1;
        }
        if self.housekeeping_interval_seconds == 0 {
            warn!("housekeeping_interval_seconds=0 is invalid, clamping to 1");
            self.housekeeping_interval_seconds = 1;
        }
        self
    }
}
