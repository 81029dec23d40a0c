//! Google Gemini adapter: `streamGenerateContent` with `alt=sse`. Gemini
//! speaks `user`/`model` roles and carries system text in a separate
//! `systemInstruction` block.

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

pub struct GoogleAdapter {
    client: Client,
    api_base: String,
}

impl GoogleAdapter {
    pub fn new(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize, Debug)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize, Debug)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize, Debug)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

fn to_wire(messages: &[ConversationMessage]) -> (Option<GeminiSystemInstruction>, Vec<GeminiContent>) {
    let system_parts: Vec<GeminiPart> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| GeminiPart {
            text: m.content.clone(),
        })
        .collect();
    let system_instruction = if system_parts.is_empty() {
        None
    } else {
        Some(GeminiSystemInstruction {
            parts: system_parts,
        })
    };

    let contents = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| GeminiContent {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "model",
                Role::System => unreachable!(),
            },
            parts: vec![GeminiPart {
                text: m.content.clone(),
            }],
        })
        .collect();

    (system_instruction, contents)
}

#[derive(Deserialize, Debug)]
struct GeminiStreamResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    error: Option<GeminiApiError>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize, Debug)]
struct GeminiApiError {
    code: u16,
    message: String,
}

/// Candidate text carried by one stream event, or the error it reports.
fn chunk_texts(data: &str) -> Result<Vec<String>, ChatError> {
    match serde_json::from_str::<GeminiStreamResponse>(data) {
        Ok(parsed) => {
            if let Some(error) = parsed.error {
                return Err(ChatError::provider_error(
                    Provider::Google,
                    error.code,
                    error.message,
                ));
            }
            Ok(parsed
                .candidates
                .into_iter()
                .filter_map(|candidate| candidate.content)
                .flat_map(|content| content.parts)
                .map(|part| part.text)
                .filter(|text| !text.is_empty())
                .collect())
        }
        Err(err) => {
            tracing::warn!(error = %err, "unparseable Gemini stream event");
            Ok(Vec::new())
        }
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn open_stream(&self, options: StreamOptions) -> ChatResult<TextStream> {
        ensure_provider(&options.model, Provider::Google)?;
        if options.cancel.is_cancelled() {
            return Ok(empty_stream());
        }

        let api_key = options
            .api_key
            .clone()
            .ok_or_else(|| ChatError::internal("Google adapter invoked without an API key"))?;

        let (system_instruction, contents) = to_wire(&options.messages);
        let body = GeminiRequest {
            contents,
            system_instruction,
            generation_config: GeminiGenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.capped_max_tokens(),
            },
        };

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.api_base.trim_end_matches('/'),
            options.model.id
        );
        let response = match self
            .client
            .post(&url)
            .header("x-goog-api-key", &api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return match send_error(Provider::Google, &options.cancel, err) {
                    Some(err) => Err(err),
                    None => Ok(empty_stream()),
                };
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_body = response.text().await.unwrap_or_default();
            return Err(ChatError::provider_error(
                Provider::Google,
                status,
                format!("Gemini API error: {error_body}"),
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
                    // Upstream closed mid-event; drain the unterminated tail
                    // before giving up.
                    if let Some(data) = sse.finish() {
                        for text in chunk_texts(&data)? {
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
                                Provider::Google,
                                502,
                                format!("stream read failed: {err}"),
                            ))?;
                        }
                        break 'read;
                    }
                };
                sse.push(&chunk);
                while let Some(data) = sse.next_data() {
                    for text in chunk_texts(&data)? {
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
    fn assistant_turns_use_the_model_role() {
        let (system, contents) = to_wire(&[
            ConversationMessage::system("be brief"),
            ConversationMessage::user("hi"),
            ConversationMessage::assistant("hello"),
        ]);
        assert!(system.is_some());
        let roles: Vec<&str> = contents.iter().map(|c| c.role).collect();
        assert_eq!(roles, vec!["user", "model"]);
    }

    #[test]
    fn request_serializes_camel_case() {
        let (system_instruction, contents) = to_wire(&[ConversationMessage::user("hi")]);
        let body = GeminiRequest {
            contents,
            system_instruction,
            generation_config: GeminiGenerationConfig {
                temperature: 0.7,
                max_output_tokens: 256,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json["generationConfig"]["maxOutputTokens"],
            serde_json::json!(256)
        );
        assert!(json.get("systemInstruction").is_none());
    }

    #[test]
    fn candidate_text_parses() {
        let data = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi"}]}}]}"#;
        let parsed: GeminiStreamResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.candidates[0].content.as_ref().unwrap().parts[0].text, "Hi");
    }

    #[test]
    fn inline_error_object_parses() {
        let data = r#"{"error":{"code":429,"message":"quota exhausted","status":"RESOURCE_EXHAUSTED"}}"#;
        let parsed: GeminiStreamResponse = serde_json::from_str(data).unwrap();
        let error = parsed.error.unwrap();
        assert_eq!(error.code, 429);
        assert_eq!(error.message, "quota exhausted");
    }
}
