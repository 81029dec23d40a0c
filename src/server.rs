use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, header},
    response::{Json, Response},
    routing::{get, post},
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    config::Config,
    credentials::CredentialResolver,
    dispatch::{ChatDispatcher, DispatchRequest},
    errors::{ChatError, ChatResult},
    models::{ModelRegistry, Provider},
    providers::AdapterRegistry,
    storage::{ChatStore, CredentialStore, SecretCipher},
};

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<ChatDispatcher>,
}

impl AppState {
    /// Wire the pipeline from configuration plus the injected persistence
    /// collaborators.
    pub fn new(
        config: Config,
        chat_store: Arc<dyn ChatStore>,
        credential_store: Arc<dyn CredentialStore>,
        cipher: Arc<dyn SecretCipher>,
    ) -> ChatResult<Self> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.providers.groq.timeout_seconds,
            ))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to create HTTP client: {e}")))?;

        let adapters = AdapterRegistry::from_config(&config, http_client)?;
        let dispatcher = ChatDispatcher::new(
            ModelRegistry::builtin(),
            CredentialResolver::new(credential_store, cipher),
            adapters,
            chat_store,
        );

        Ok(Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
        })
    }
}

/// Create the application router with all routes and middleware.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/v1/chats/{chat_id}/messages", post(send_message_handler))
        .route("/v1/models", get(list_models_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Bind and serve until the process is stopped.
pub async fn start_server(state: AppState) -> ChatResult<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ChatError::Config(format!("Failed to bind to {addr}: {e}")))?;

    tracing::info!("chat-relay listening on {addr}");
    tracing::info!("  POST /v1/chats/{{chat_id}}/messages - send a message, stream the reply");
    tracing::info!("  GET  /v1/models - model catalog");
    tracing::info!("  GET  /health - health check");

    let app = create_app(state);
    axum::serve(listener, app)
        .await
        .map_err(|e| ChatError::internal(format!("Server error: {e}")))?;

    Ok(())
}

#[derive(Deserialize, Debug)]
pub struct SendMessageBody {
    pub message: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// User identity is established by auth middleware upstream of this service;
/// here it arrives as a trusted header.
fn require_user(headers: &HeaderMap) -> ChatResult<String> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ChatError::BadRequest("missing x-user-id header".to_string()))
}

/// Send a message and relay the assistant's reply as chunked plain text.
///
/// Validation errors surface as JSON with a proper status code; once the
/// first byte is out, a failure just truncates the stream.
async fn send_message_handler(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> ChatResult<Response> {
    let user_id = require_user(&headers)?;
    if body.message.is_empty() {
        return Err(ChatError::BadRequest("message cannot be empty".to_string()));
    }

    let request = DispatchRequest {
        user_id,
        chat_id,
        message: body.message,
        model_id: body.model,
        temperature: body.temperature,
        max_tokens: body.max_tokens,
        cancel: CancellationToken::new(),
    };

    let stream = state.dispatcher.dispatch(request).await?;

    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| ChatError::internal(format!("failed to build response: {e}")))
}

/// Model catalog grouped by provider, for the model picker.
async fn list_models_handler(State(state): State<AppState>) -> ChatResult<Json<Value>> {
    let registry = state.dispatcher.models();
    let groups = registry.by_provider();
    Ok(Json(json!({
        "default_model": crate::models::DEFAULT_MODEL,
        "providers": groups,
    })))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let mut providers: Vec<&'static str> = state
        .dispatcher
        .adapters()
        .providers()
        .into_iter()
        .map(Provider::as_str)
        .collect();
    providers.sort_unstable();
    Json(json!({
        "status": "healthy",
        "service": "chat-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "models": state.dispatcher.models().all().count(),
        "providers": providers,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
