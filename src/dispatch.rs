//! Dispatch façade: the single entry point that wires registry, credentials,
//! context assembly, the provider adapter, and the relay together for one
//! request.
//!
//! A session moves through `VALIDATING → STREAMING → {COMPLETED | CANCELLED |
//! FAILED}`. Everything in the validating phase is synchronous with respect
//! to the response: any failure there surfaces as a typed error before a
//! single byte is written. After streaming begins, failures only terminate
//! the stream.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::credentials::CredentialResolver;
use crate::errors::{ChatError, ChatResult};
use crate::models::ModelRegistry;
use crate::providers::{AdapterRegistry, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, StreamOptions, TextStream};
use crate::relay::{self, StreamSession};
use crate::storage::{ChatStore, NewMessage, Role};
use crate::{context, models::DEFAULT_MODEL};

/// One inbound chat-send request.
pub struct DispatchRequest {
    pub user_id: String,
    pub chat_id: String,
    pub message: String,
    /// Falls back to [`DEFAULT_MODEL`] when absent.
    pub model_id: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub cancel: CancellationToken,
}

impl DispatchRequest {
    pub fn new(
        user_id: impl Into<String>,
        chat_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id: chat_id.into(),
            message: message.into(),
            model_id: None,
            temperature: None,
            max_tokens: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

pub struct ChatDispatcher {
    models: ModelRegistry,
    credentials: CredentialResolver,
    adapters: AdapterRegistry,
    store: Arc<dyn ChatStore>,
}

impl ChatDispatcher {
    pub fn new(
        models: ModelRegistry,
        credentials: CredentialResolver,
        adapters: AdapterRegistry,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        Self {
            models,
            credentials,
            adapters,
            store,
        }
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Run one request through the pipeline and return the relayed text
    /// stream.
    ///
    /// Exactly one user message is persisted per call, and at most one
    /// assistant message regardless of how the stream ends. Concurrent
    /// sessions share nothing but the store, so cancelling one has no effect
    /// on others.
    pub async fn dispatch(&self, request: DispatchRequest) -> ChatResult<TextStream> {
        let model_id = request
            .model_id
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let span = tracing::info_span!(
            "dispatch",
            chat_id = %request.chat_id,
            model = %model_id,
        );

        // The span is attached with Instrument rather than entered, so it
        // follows this future across await points.
        async move {
            tracing::debug!("validating request");

            let model = self
                .models
                .get(&model_id)
                .ok_or_else(|| ChatError::ModelNotFound(model_id.clone()))?
                .clone();

            let (chat, history) = self
                .store
                .find_chat_with_history(&request.chat_id, &request.user_id)
                .await?
                .ok_or_else(|| ChatError::ChatNotFound(request.chat_id.clone()))?;

            let api_key = self.credentials.resolve(&model, &request.user_id).await?;
            let prompt = context::assemble(&model, &history, &request.message)?;
            let adapter = self.adapters.get(model.provider)?;

            // Validation passed; record the inbound user message. A failure
            // past this point leaves the user turn in place with no assistant
            // reply.
            self.store
                .create_message(NewMessage {
                    chat_id: chat.id.clone(),
                    role: Role::User,
                    content: request.message.clone(),
                    model: None,
                })
                .await?;

            tracing::info!(provider = %model.provider, "opening provider stream");
            let upstream = adapter
                .open_stream(StreamOptions {
                    messages: prompt,
                    model: model.clone(),
                    temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                    max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                    api_key,
                    cancel: request.cancel.clone(),
                })
                .await?;

            let session = StreamSession::new(chat.id, model.id, Arc::clone(&self.store));
            Ok(relay::tee(upstream, session))
        }
        .instrument(span)
        .await
    }
}
