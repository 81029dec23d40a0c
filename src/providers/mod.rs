pub mod anthropic;
pub mod google;
pub mod groq;
pub mod openai;
pub mod registry;
pub mod sse;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::errors::{ChatError, ChatResult};
use crate::models::{ModelSpec, Provider};
use crate::storage::ConversationMessage;

pub use registry::AdapterRegistry;

/// Streaming response type every adapter produces: raw UTF-8 text chunks in
/// provider arrival order, terminated by either clean close or one error.
pub type TextStream = BoxStream<'static, Result<Bytes, ChatError>>;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4_000;

/// Unified input for one provider streaming call.
pub struct StreamOptions {
    pub messages: Vec<ConversationMessage>,
    pub model: ModelSpec,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Decrypted per-user key; `None` for the service-keyed free provider.
    pub api_key: Option<String>,
    pub cancel: CancellationToken,
}

impl StreamOptions {
    pub fn new(messages: Vec<ConversationMessage>, model: ModelSpec) -> Self {
        Self {
            messages,
            model,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            api_key: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Output cap actually sent to the provider.
    pub fn capped_max_tokens(&self) -> u32 {
        self.max_tokens.min(self.model.max_output_tokens)
    }
}

/// One streaming backend. Each implementation owns its wire format, its
/// cancellation wiring, and its error wrapping; none of them retry.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Open a provider streaming call and emit text deltas as they arrive.
    ///
    /// If the cancellation token has already fired, the returned stream is
    /// empty and no network call is made. During iteration the token is
    /// observed at chunk boundaries; tripping it closes the stream cleanly
    /// with everything already emitted left intact.
    async fn open_stream(&self, options: StreamOptions) -> ChatResult<TextStream>;
}

/// Model/provider mismatch is a routing bug, not a user-facing failure.
pub(crate) fn ensure_provider(model: &ModelSpec, expected: Provider) -> ChatResult<()> {
    if model.provider != expected {
        return Err(ChatError::internal(format!(
            "model {} belongs to {}, not {}",
            model.id, model.provider, expected
        )));
    }
    Ok(())
}

pub(crate) fn empty_stream() -> TextStream {
    futures::stream::empty().boxed()
}

/// Map a send-phase reqwest failure, treating an abort-triggered error as a
/// clean no-op rather than a provider failure.
pub(crate) fn send_error(
    provider: Provider,
    cancel: &CancellationToken,
    err: reqwest::Error,
) -> Option<ChatError> {
    if cancel.is_cancelled() {
        return None;
    }
    Some(ChatError::provider_error(
        provider,
        err.status().map_or(502, |s| s.as_u16()),
        format!("request failed: {err}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelRegistry;

    #[test]
    fn max_tokens_is_capped_by_the_model() {
        let registry = ModelRegistry::builtin();
        let model = registry.get("claude-3-5-haiku-20241022").unwrap().clone();
        let mut options = StreamOptions::new(vec![], model);
        options.max_tokens = 1_000_000;
        assert_eq!(options.capped_max_tokens(), 8_192);
        options.max_tokens = 16;
        assert_eq!(options.capped_max_tokens(), 16);
    }

    #[test]
    fn mismatched_model_is_an_internal_error() {
        let registry = ModelRegistry::builtin();
        let model = registry.get("gpt-4o").unwrap();
        let err = ensure_provider(model, Provider::Anthropic).unwrap_err();
        assert_eq!(err.kind(), "internal_error");
    }
}
