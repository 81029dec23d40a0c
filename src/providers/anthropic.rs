//! Anthropic adapter: the Messages API wants system text in a top-level
//! field and typed SSE events rather than bare deltas.

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    ProviderAdapter, StreamOptions, TextStream, empty_stream, ensure_provider, send_error,
    sse::SseBuffer,
};
use crate::errors::{ChatError, ChatResult};
use crate::models::Provider;
use crate::storage::{ConversationMessage, Role};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    api_base: String,
}

impl AnthropicAdapter {
    pub fn new(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

#[derive(Serialize, Debug)]
struct AnthropicRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

/// Split the unified list: system turns join into the `system` field, the
/// rest become user/assistant messages.
fn to_wire(messages: &[ConversationMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };

    let turns = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| AnthropicMessage {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => unreachable!(),
            },
            content: m.content.clone(),
        })
        .collect();

    (system, turns)
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    ContentBlockDelta { delta: AnthropicDelta },
    MessageStop,
    Error { error: AnthropicApiError },
    #[serde(other)]
    Ignored,
}

#[derive(Deserialize, Debug, Default)]
struct AnthropicDelta {
    /// Present for `text_delta` payloads; other delta kinds are skipped.
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct AnthropicApiError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

enum EventOutcome {
    Text(String),
    Stop,
    Fail(ChatError),
    Skip,
}

fn classify_event(data: &str) -> EventOutcome {
    match serde_json::from_str::<AnthropicEvent>(data) {
        Ok(AnthropicEvent::ContentBlockDelta { delta }) => match delta.text {
            Some(text) if !text.is_empty() => EventOutcome::Text(text),
            _ => EventOutcome::Skip,
        },
        Ok(AnthropicEvent::MessageStop) => EventOutcome::Stop,
        Ok(AnthropicEvent::Error { error }) => EventOutcome::Fail(ChatError::provider_error(
            Provider::Anthropic,
            502,
            format!("{}: {}", error.kind, error.message),
        )),
        Ok(AnthropicEvent::Ignored) => EventOutcome::Skip,
        Err(err) => {
            tracing::warn!(error = %err, "unparseable Anthropic stream event");
            EventOutcome::Skip
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn open_stream(&self, options: StreamOptions) -> ChatResult<TextStream> {
        ensure_provider(&options.model, Provider::Anthropic)?;
        if options.cancel.is_cancelled() {
            return Ok(empty_stream());
        }

        let api_key = options
            .api_key
            .clone()
            .ok_or_else(|| ChatError::internal("Anthropic adapter invoked without an API key"))?;

        let (system, messages) = to_wire(&options.messages);
        let body = AnthropicRequest {
            model: options.model.id.to_string(),
            system,
            messages,
            temperature: options.temperature,
            max_tokens: options.capped_max_tokens(),
            stream: true,
        };

        let url = format!("{}/messages", self.api_base.trim_end_matches('/'));
        let response = match self
            .client
            .post(&url)
            .header("x-api-key", &api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return match send_error(Provider::Anthropic, &options.cancel, err) {
                    Some(err) => Err(err),
                    None => Ok(empty_stream()),
                };
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_body = response.text().await.unwrap_or_default();
            return Err(ChatError::provider_error(
                Provider::Anthropic,
                status,
                format!("Anthropic API error: {error_body}"),
            ));
        }

        let cancel = options.cancel;
        let stream = try_stream! {
            let mut body = response.bytes_stream();
            let mut sse = SseBuffer::new();
            'read: loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break 'read,
                    next = body.next() => next,
                };
                let Some(chunk) = next else {
                    // Upstream closed without message_stop; drain an
                    // unterminated tail event before giving up.
                    if let Some(data) = sse.finish() {
                        match classify_event(&data) {
                            EventOutcome::Text(text) => yield Bytes::from(text),
                            EventOutcome::Fail(err) => Err(err)?,
                            EventOutcome::Stop | EventOutcome::Skip => {}
                        }
                    }
                    break 'read;
                };
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        if !cancel.is_cancelled() {
                            Err(ChatError::provider_error(
                                Provider::Anthropic,
                                502,
                                format!("stream read failed: {err}"),
                            ))?;
                        }
                        break 'read;
                    }
                };
                sse.push(&chunk);
                while let Some(data) = sse.next_data() {
                    match classify_event(&data) {
                        EventOutcome::Text(text) => yield Bytes::from(text),
                        EventOutcome::Stop => break 'read,
                        EventOutcome::Fail(err) => Err(err)?,
                        EventOutcome::Skip => {}
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}
