use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::models::Provider;

// Use anyhow::Result for internal plumbing (config loading), ChatError for
// everything a caller needs to handle specifically.

/// Errors the chat pipeline can surface to callers.
///
/// Validation-phase errors (everything except `Provider`) are raised before a
/// single byte of the response stream is written, so the HTTP layer can still
/// pick a status code. Once streaming has begun, failures only terminate the
/// stream.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unknown model: {0}")]
    ModelNotFound(String),

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    /// Names the provider so the UI can deep-link to the credentials page.
    #[error("No API key on file for {provider}. Add a {provider} key in your credential settings to use this model.")]
    NoCredential { provider: Provider },

    #[error("Stored {provider} API key could not be decrypted. Re-save the key in your credential settings.")]
    InvalidCredential { provider: Provider },

    #[error("Message is too long for {model} (maximum {limit} characters)")]
    MessageTooLong { model: String, limit: usize },

    #[error("This conversation no longer fits the context window of {model}. Please start a new conversation.")]
    ContextTooLong { model: String },

    #[error("{provider} request failed: {message}")]
    Provider {
        provider: Provider,
        status: u16,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn provider_error(provider: Provider, status: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            provider,
            status,
            message: message.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable identifier for the error kind, used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_request",
            Self::ModelNotFound(_) => "model_not_found",
            Self::ChatNotFound(_) => "chat_not_found",
            Self::NoCredential { .. } => "no_credential",
            Self::InvalidCredential { .. } => "invalid_credential",
            Self::MessageTooLong { .. } => "message_too_long",
            Self::ContextTooLong { .. } => "context_too_long",
            Self::Provider { .. } => "provider_error",
            Self::Storage(_) => "storage_error",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Provider associated with the error, when there is one.
    pub fn provider(&self) -> Option<Provider> {
        match self {
            Self::NoCredential { provider }
            | Self::InvalidCredential { provider }
            | Self::Provider { provider, .. } => Some(*provider),
            _ => None,
        }
    }
}

/// Convert ChatError to an HTTP response with a JSON error body.
impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::ModelNotFound(_) | ChatError::ChatNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::BadRequest(_)
            | ChatError::NoCredential { .. }
            | ChatError::MessageTooLong { .. }
            | ChatError::ContextTooLong { .. } => StatusCode::BAD_REQUEST,
            ChatError::Provider { .. } => StatusCode::BAD_GATEWAY,
            ChatError::InvalidCredential { .. }
            | ChatError::Storage(_)
            | ChatError::Config(_)
            | ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut error = json!({
            "type": self.kind(),
            "message": self.to_string(),
        });
        if let Some(provider) = self.provider() {
            error["provider"] = json!(provider.as_str());
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Application error: {:?}", err);
        ChatError::Internal(err.to_string())
    }
}

/// Helper type for results throughout the pipeline.
pub type ChatResult<T> = Result<T, ChatError>;
