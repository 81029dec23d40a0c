//! OpenAI adapter: chat completions over SSE, authenticated with the user's
//! stored key.

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

pub struct OpenAiAdapter {
    client: Client,
    api_base: String,
}

impl OpenAiAdapter {
    pub fn new(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

#[derive(Serialize, Debug)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    max_completion_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

fn to_wire(messages: &[ConversationMessage]) -> Vec<OpenAiMessage> {
    messages
        .iter()
        .map(|m| OpenAiMessage {
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
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize, Debug, Default)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

/// Delta text carried by one stream event.
fn delta_texts(data: &str) -> Vec<String> {
    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(parsed) => parsed
            .choices
            .into_iter()
            .filter_map(|choice| choice.delta.content)
            .filter(|text| !text.is_empty())
            .collect(),
        Err(err) => {
            tracing::warn!(error = %err, "unparseable OpenAI stream event");
            Vec::new()
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn open_stream(&self, options: StreamOptions) -> ChatResult<TextStream> {
        ensure_provider(&options.model, Provider::OpenAi)?;
        if options.cancel.is_cancelled() {
            return Ok(empty_stream());
        }

        let api_key = options
            .api_key
            .as_deref()
            .ok_or_else(|| ChatError::internal("OpenAI adapter invoked without an API key"))?;

        let body = OpenAiRequest {
            model: options.model.id.to_string(),
            messages: to_wire(&options.messages),
            temperature: options.temperature,
            max_completion_tokens: options.capped_max_tokens(),
            stream: true,
        };

        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let response = match self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return match send_error(Provider::OpenAi, &options.cancel, err) {
                    Some(err) => Err(err),
                    None => Ok(empty_stream()),
                };
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_body = response.text().await.unwrap_or_default();
            return Err(ChatError::provider_error(
                Provider::OpenAi,
                status,
                format!("OpenAI API error: {error_body}"),
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
                                Provider::OpenAi,
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
    use crate::models::ModelRegistry;

    #[test]
    fn request_serializes_stream_flag_and_cap() {
        let registry = ModelRegistry::builtin();
        let model = registry.get("gpt-4o").unwrap().clone();
        let mut options = StreamOptions::new(vec![ConversationMessage::user("hi")], model);
        options.max_tokens = 64;
        let body = OpenAiRequest {
            model: options.model.id.to_string(),
            messages: to_wire(&options.messages),
            temperature: options.temperature,
            max_completion_tokens: options.capped_max_tokens(),
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], serde_json::json!(true));
        assert_eq!(json["max_completion_tokens"], serde_json::json!(64));
        assert_eq!(json["messages"][0]["role"], serde_json::json!("user"));
    }

    #[test]
    fn final_chunk_without_delta_content_parses() {
        let data = r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        let chunk: OpenAiStreamChunk = serde_json::from_str(data).unwrap();
        assert!(chunk.choices[0].delta.content.is_none());
    }
}
