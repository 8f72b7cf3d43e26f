//! Upstream chat completions client (OpenAI-compatible).
//!
//! Two calling modes: `complete` blocks for the full response with retry
//! and exponential backoff; `stream` opens an incremental SSE response
//! and yields text fragments in arrival order.

use async_trait::async_trait;
use base64::Engine;
use eventsource_stream::Eventsource;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parley_common::config::UpstreamConfig;
use parley_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::session::{Role, Turn, TurnContent};

/// A single message on the upstream wire.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: MessageContent,
}

/// Message content: a plain string, or an array of typed parts for
/// multimodal turns.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Convert domain turns to wire messages.
///
/// System turns get the `{lang}` placeholder replaced with the detected
/// language tag; images are embedded as base64 data URLs.
pub fn wire_messages(turns: &[Turn], lang: &str) -> Vec<ChatMessage> {
    turns
        .iter()
        .map(|turn| {
            let content = match &turn.content {
                TurnContent::Text(text) => {
                    if turn.role == Role::System {
                        MessageContent::Text(text.replace("{lang}", lang))
                    } else {
                        MessageContent::Text(text.clone())
                    }
                }
                TurnContent::Multimodal { text, image } => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&image.data);
                    MessageContent::Parts(vec![
                        ContentPart::Text { text: text.clone() },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: format!("data:{};base64,{}", image.content_type, encoded),
                            },
                        },
                    ])
                }
            };
            ChatMessage {
                role: turn.role.as_str(),
                content,
            }
        })
        .collect()
}

/// Abstraction over the upstream model API, for orchestration and tests.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Block for the complete response text.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
    ) -> Result<String>;

    /// Open an incremental response; each item is one text fragment in
    /// upstream order.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
    ) -> Result<BoxStream<'static, Result<String>>>;
}

/// Reqwest-based client for an OpenAI-compatible chat completions API.
pub struct ChatClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl ChatClient {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            // Bounds total time per upstream call, including a streamed
            // body read.
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn complete_once(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let request = CompletionRequest {
            model,
            messages,
            stream: false,
            max_tokens: Some(max_tokens),
        };

        let response = self
            .http
            .post(self.url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!("API returned {status}: {body}")));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("bad response body: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::Upstream("response contained no choices".to_string()))
    }
}

#[async_trait]
impl CompletionBackend for ChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let mut last_error = Error::Upstream("no attempts made".to_string());

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(250 * 2u64.saturating_pow(attempt - 1));
                tokio::time::sleep(delay).await;
            }
            match self.complete_once(messages, model, max_tokens).await {
                Ok(text) => return Ok(text),
                Err(e @ (Error::Upstream(_) | Error::Timeout)) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.config.max_retries + 1,
                        error = %e,
                        "Upstream completion attempt failed"
                    );
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let request = CompletionRequest {
            model,
            messages,
            stream: true,
            max_tokens: Some(max_tokens),
        };

        let response = self
            .http
            .post(self.url())
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!("API returned {status}: {body}")));
        }

        let fragments = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) => {
                        let data = event.data.trim();
                        if data.is_empty() || data == "[DONE]" {
                            return None;
                        }
                        match serde_json::from_str::<StreamChunk>(data) {
                            Ok(chunk) => chunk
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|choice| choice.delta.content)
                                .filter(|text| !text.is_empty())
                                .map(Ok),
                            Err(e) => {
                                tracing::warn!(error = %e, "Skipping malformed stream chunk");
                                None
                            }
                        }
                    }
                    Err(e) => Some(Err(Error::Upstream(format!("stream error: {e}")))),
                }
            });

        Ok(fragments.boxed())
    }
}

fn map_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Upstream(format!("request failed: {e}"))
    }
}

// ────────────────────────────────────────────────────────────────────────
// Wire types
// ────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ImageAttachment;

    #[test]
    fn test_text_message_serializes_as_string_content() {
        let turns = vec![Turn::text(Role::User, "Hello")];
        let messages = wire_messages(&turns, "en");
        let json = serde_json::to_string(&messages).unwrap();
        assert_eq!(json, r#"[{"role":"user","content":"Hello"}]"#);
    }

    #[test]
    fn test_system_prompt_language_substitution() {
        let turns = vec![Turn::text(Role::System, "Respond in {lang}.")];
        let messages = wire_messages(&turns, "ar");
        let json = serde_json::to_string(&messages).unwrap();
        assert!(json.contains("Respond in ar."));
    }

    #[test]
    fn test_multimodal_message_serializes_as_parts_with_data_url() {
        let turns = vec![Turn::multimodal(
            "What is this?",
            ImageAttachment {
                content_type: "image/png".to_string(),
                data: vec![1, 2, 3],
            },
        )];
        let messages = wire_messages(&turns, "en");
        let json = serde_json::to_string(&messages).unwrap();
        assert!(json.contains(r#""type":"text"#));
        assert!(json.contains(r#""type":"image_url"#));
        assert!(json.contains("data:image/png;base64,AQID"));
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));

        // Final chunks often carry an empty delta.
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert!(chunk.choices[0].delta.content.is_none());
    }

    #[test]
    fn test_request_omits_max_tokens_when_absent() {
        let request = CompletionRequest {
            model: "gpt-4o-mini",
            messages: &[],
            stream: true,
            max_tokens: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("max_tokens"));
        assert!(json.contains(r#""stream":true"#));
    }
}
