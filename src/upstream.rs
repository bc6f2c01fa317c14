//! Outbound calls to the upstream provider.
//!
//! One long-lived `reqwest` client with connection pooling; per-request
//! timeouts. Streaming calls only bound the time to the initial response —
//! never the body.

use crate::config::Config;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::time::Duration;

/// Timeout for the initial upstream response on the dispatch path.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for the validator's probe call.
pub const VALIDATOR_TIMEOUT: Duration = Duration::from_secs(15);

/// One upstream request as seen by the dispatch engine.
#[derive(Debug, Clone)]
pub enum UpstreamCall {
    /// `POST` to the chat-completions endpoint, body forwarded verbatim.
    Chat { payload: Value, stream: bool },
    /// `GET` to the model-list endpoint.
    Models,
}

impl UpstreamCall {
    pub fn is_stream(&self) -> bool {
        matches!(self, UpstreamCall::Chat { stream: true, .. })
    }

    /// Model label recorded in the request log.
    pub fn model_label(&self) -> Option<String> {
        match self {
            UpstreamCall::Chat { payload, .. } => payload
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            UpstreamCall::Models => Some("models".to_string()),
        }
    }
}

/// Upstream reply body. Buffered for non-streaming calls; for streaming
/// calls the response is handed over unread so the relay can forward chunks.
#[derive(Debug)]
pub enum UpstreamBody {
    Buffered(Bytes),
    Streaming(reqwest::Response),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    /// Drain the body to text, for error classification and reporting.
    pub async fn into_text(self) -> String {
        match self.body {
            UpstreamBody::Buffered(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            UpstreamBody::Streaming(response) => response
                .text()
                .await
                .unwrap_or_else(|e| format!("failed to read upstream error body: {e}")),
        }
    }
}

/// Provider-facing API. Implementations report transport failures as
/// [`crate::Error::Transport`]; HTTP status classification is the dispatch
/// engine's job.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn call(
        &self,
        call: &UpstreamCall,
        secret: &str,
    ) -> Result<UpstreamResponse, crate::Error>;

    /// Minimal chat-completion probe used by the key validator. Returns the
    /// upstream status and a body snippet.
    async fn probe(&self, secret: &str, model: &str) -> Result<(u16, String), crate::Error>;
}

/// Production client backed by `reqwest`.
pub struct UpstreamClient {
    http: reqwest::Client,
    chat_url: String,
    models_url: String,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> Result<Self, crate::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| crate::Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            chat_url: config.upstream_chat_url.clone(),
            models_url: config.upstream_models_url.clone(),
        })
    }
}

fn transport_err(e: reqwest::Error) -> crate::Error {
    crate::Error::Transport(e.to_string())
}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    async fn call(
        &self,
        call: &UpstreamCall,
        secret: &str,
    ) -> Result<UpstreamResponse, crate::Error> {
        match call {
            UpstreamCall::Chat {
                payload,
                stream: false,
            } => {
                let response = self
                    .http
                    .post(&self.chat_url)
                    .bearer_auth(secret)
                    .json(payload)
                    .timeout(DISPATCH_TIMEOUT)
                    .send()
                    .await
                    .map_err(transport_err)?;
                let status = response.status().as_u16();
                let bytes = response.bytes().await.map_err(transport_err)?;
                Ok(UpstreamResponse {
                    status,
                    body: UpstreamBody::Buffered(bytes),
                })
            }
            UpstreamCall::Chat {
                payload,
                stream: true,
            } => {
                // Bound only the time to headers; the body may stream for
                // much longer than the dispatch timeout.
                let send = self
                    .http
                    .post(&self.chat_url)
                    .bearer_auth(secret)
                    .json(payload)
                    .send();
                let response = tokio::time::timeout(DISPATCH_TIMEOUT, send)
                    .await
                    .map_err(|_| {
                        crate::Error::Transport(format!(
                            "upstream did not respond within {}s",
                            DISPATCH_TIMEOUT.as_secs()
                        ))
                    })?
                    .map_err(transport_err)?;
                Ok(UpstreamResponse {
                    status: response.status().as_u16(),
                    body: UpstreamBody::Streaming(response),
                })
            }
            UpstreamCall::Models => {
                let response = self
                    .http
                    .get(&self.models_url)
                    .bearer_auth(secret)
                    .timeout(DISPATCH_TIMEOUT)
                    .send()
                    .await
                    .map_err(transport_err)?;
                let status = response.status().as_u16();
                let bytes = response.bytes().await.map_err(transport_err)?;
                Ok(UpstreamResponse {
                    status,
                    body: UpstreamBody::Buffered(bytes),
                })
            }
        }
    }

    async fn probe(&self, secret: &str, model: &str) -> Result<(u16, String), crate::Error> {
        let payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 10,
        });
        let response = self
            .http
            .post(&self.chat_url)
            .bearer_auth(secret)
            .json(&payload)
            .timeout(VALIDATOR_TIMEOUT)
            .send()
            .await
            .map_err(transport_err)?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let snippet = body.chars().take(200).collect();
        Ok((status, snippet))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted upstream fake shared by dispatch and validator tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// One scripted outcome for the next upstream call.
    #[derive(Debug, Clone)]
    pub enum FakeOutcome {
        Status(u16, &'static str),
        Transport(&'static str),
    }

    pub struct FakeUpstream {
        script: Mutex<VecDeque<FakeOutcome>>,
        pub calls: AtomicU64,
    }

    impl FakeUpstream {
        pub fn scripted(outcomes: impl IntoIterator<Item = FakeOutcome>) -> Self {
            Self {
                script: Mutex::new(outcomes.into_iter().collect()),
                calls: AtomicU64::new(0),
            }
        }

        pub fn call_count(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }

        fn next_outcome(&self) -> FakeOutcome {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.script
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or(FakeOutcome::Status(200, "{}"))
        }
    }

    #[async_trait]
    impl UpstreamApi for FakeUpstream {
        async fn call(
            &self,
            _call: &UpstreamCall,
            _secret: &str,
        ) -> Result<UpstreamResponse, crate::Error> {
            match self.next_outcome() {
                FakeOutcome::Status(status, body) => Ok(UpstreamResponse {
                    status,
                    body: UpstreamBody::Buffered(Bytes::from_static(body.as_bytes())),
                }),
                FakeOutcome::Transport(msg) => Err(crate::Error::Transport(msg.to_string())),
            }
        }

        async fn probe(&self, _secret: &str, _model: &str) -> Result<(u16, String), crate::Error> {
            match self.next_outcome() {
                FakeOutcome::Status(status, body) => Ok((status, body.to_string())),
                FakeOutcome::Transport(msg) => Err(crate::Error::Transport(msg.to_string())),
            }
        }
    }
}
