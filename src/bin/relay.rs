//! chat-relay binary.

use chat_relay::state::run_housekeeping;
use chat_relay::{create_router, AppState, Config};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting chat-relay");

    let config: Config = config::Config::builder()
        .add_source(config::File::with_name("relay").required(false))
        .add_source(
            config::Environment::with_prefix("RELAY")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("proxy_api_keys"),
        )
        .build()
        .and_then(|c| c.try_deserialize())
        .unwrap_or_else(|e| {
            // Fall back only when no config exists; parsing errors fail hard.
            let err_str = format!("{e}");
            if err_str.contains("not found") || err_str.contains("missing field") {
                warn!(error = %e, "No config file found, using defaults");
                Config::default()
            } else {
                error!(error = %e, "FATAL: Config error — fix env vars or relay.toml");
                std::process::exit(1);
            }
        });
    let config = config.normalized();

    if config.proxy_api_keys.is_empty() {
        error!(
            "FATAL: no proxy tokens configured — set RELAY_PROXY_API_KEYS \
             or proxy_api_keys in relay.toml"
        );
        std::process::exit(1);
    }
    info!(
        proxy_tokens = config.proxy_api_keys.len(),
        chat_url = %config.upstream_chat_url,
        models_url = %config.upstream_models_url,
        max_retries = config.max_retries,
        "Configuration loaded"
    );

    let bind_address = config.bind_address.clone();
    let state = Arc::new(AppState::new(config).await?);

    let cancel = CancellationToken::new();
    let housekeeping_state = Arc::clone(&state);
    let housekeeping_cancel = cancel.clone();
    tokio::spawn(async move {
        run_housekeeping(housekeeping_state, housekeeping_cancel).await;
    });

    let app = create_router(state.clone());

    info!(address = %bind_address, "Listening");

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped");
    cancel.cancel();

    info!("chat-relay shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
