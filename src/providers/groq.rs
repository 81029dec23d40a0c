//! Groq adapter. Groq serves the free tier, so calls are authenticated with
//! the relay's own service key rather than a per-user credential. The wire
//! protocol is OpenAI-compatible chat completions over SSE.

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

pub struct GroqAdapter {
    client: Client,
    api_base: String,
    service_key: String,
}

impl GroqAdapter {
    pub fn new(client: Client, api_base: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            service_key: service_key.into(),
        }
    }
}

#[derive(Serialize, Debug)]
struct GroqRequest {
    model: String,
    messages: Vec<GroqMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct GroqMessage {
    role: &'static str,
    content: String,
}

fn to_wire(messages: &[ConversationMessage]) -> Vec<GroqMessage> {
    messages
        .iter()
        .map(|m| GroqMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content.clone(),
        })
        .collect()
}

#[derive(Deserialize, Debug)]
struct GroqStreamChunk {
    #[serde(default)]
    choices: Vec<GroqStreamChoice>,
}

#[derive(Deserialize, Debug)]
struct GroqStreamChoice {
    delta: GroqStreamDelta,
}

#[derive(Deserialize, Debug, Default)]
struct GroqStreamDelta {
    content: Option<String>,
}

/// Delta text carried by one stream event.
fn delta_texts(data: &str) -> Vec<String> {
    match serde_json::from_str::<GroqStreamChunk>(data) {
        Ok(parsed) => parsed
            .choices
            .into_iter()
            .filter_map(|choice| choice.delta.content)
            .filter(|text| !text.is_empty())
            .collect(),
        Err(err) => {
            tracing::warn!(error = %err, "unparseable Groq stream event");
            Vec::new()
        }
    }
}

#[async_trait]
impl ProviderAdapter for GroqAdapter {
    fn provider(&self) -> Provider {
        Provider::Groq
    }

    async fn open_stream(&self, options: StreamOptions) -> ChatResult<TextStream> {
        ensure_provider(&options.model, Provider::Groq)?;
        if options.cancel.is_cancelled() {
            return Ok(empty_stream());
        }

        let body = GroqRequest {
            model: options.model.id.to_string(),
            messages: to_wire(&options.messages),
            temperature: options.temperature,
            max_tokens: options.capped_max_tokens(),
            stream: true,
        };

        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let response = match self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return match send_error(Provider::Groq, &options.cancel, err) {
                    Some(err) => Err(err),
                    None => Ok(empty_stream()),
                };
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_body = response.text().await.unwrap_or_default();
            return Err(ChatError::provider_error(
                Provider::Groq,
                status,
                format!("Groq API error: {error_body}"),
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
                    // Upstream closed without [DONE]; drain an unterminated
                    // tail event before giving up.
                    if let Some(data) = sse.finish()
                        && data != "[DONE]"
                    {
                        for text in delta_texts(&data) {
                            yield Bytes::from(text);
                        }
                    }
                    break 'read;
                };
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        if !cancel.is_cancelled() {
                            Err(ChatError::provider_error(
                                Provider::Groq,
                                502,
                                format!("stream read failed: {err}"),
                            ))?;
                        }
                        break 'read;
                    }
                };
                sse.push(&chunk);
                while let Some(data) = sse.next_data() {
                    if data == "[DONE]" {
                        break 'read;
                    }
                    for text in delta_texts(&data) {
                        yield Bytes::from(text);
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roles_are_lowercase() {
        let wire = to_wire(&[
            ConversationMessage::system("be brief"),
            ConversationMessage::user("hi"),
            ConversationMessage::assistant("hello"),
        ]);
        let roles: Vec<&str> = wire.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
    }

    #[test]
    fn delta_chunk_parses() {
        let data = r#"{"id":"cmpl-1","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        let chunk: GroqStreamChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
    }

    #[test]
    fn role_only_delta_parses_without_content() {
        let data = r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        let chunk: GroqStreamChunk = serde_json::from_str(data).unwrap();
        assert!(chunk.choices[0].delta.content.is_none());
    }

    #[test]
    fn delta_texts_drops_empty_and_unparseable_events() {
        let data = r#"{"choices":[{"index":0,"delta":{"content":"Hi"}}]}"#;
        assert_eq!(delta_texts(data), vec!["Hi".to_string()]);
        assert!(delta_texts(r#"{"choices":[{"index":0,"delta":{"content":""}}]}"#).is_empty());
        assert!(delta_texts("not json").is_empty());
    }
}
