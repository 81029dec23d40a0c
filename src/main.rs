use std::sync::Arc;

use chat_relay::storage::{InMemoryStore, TaggedCipher};
use chat_relay::{AppState, ChatError, load_config, start_server};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[tokio::main]
async fn main() -> Result<(), ChatError> {
    init_tracing()?;

    tracing::info!("chat-relay starting up");

    let config = load_config()
        .map_err(|e| ChatError::Config(format!("failed to load configuration: {e}")))?;

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        "configuration loaded"
    );

    // The relational store and key-encryption service are separate
    // deployments; the standalone binary runs against the in-memory
    // reference implementations.
    let store = Arc::new(InMemoryStore::new());
    tracing::warn!("running with in-memory persistence; chats do not survive restarts");

    let state = AppState::new(config, store.clone(), store, Arc::new(TaggedCipher))?;
    start_server(state).await?;

    Ok(())
}

/// Structured logging: JSON output, level controlled by `RUST_LOG`.
fn init_tracing() -> Result<(), ChatError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chat_relay=info,tower_http=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ChatError::Config(format!("Failed to initialize tracing: {e}")))?;

    Ok(())
}
