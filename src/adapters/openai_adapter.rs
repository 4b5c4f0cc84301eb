//! OpenAI-compatible chat completions client (OpenRouter by default).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::error::GenerationError;
use crate::ports::text_generation_port::TextGenerator;

const SYSTEM_PROMPT: &str =
    "You are a trading strategy assistant. Answer with a single JSON object and nothing else.";

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub temperature: f64,
    pub timeout: Duration,
}

pub struct OpenAiAdapter {
    client: reqwest::Client,
    settings: OpenAiSettings,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f64,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiAdapter {
    pub fn new(settings: OpenAiSettings) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GenerationError::Request {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, settings })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.settings.model,
            temperature: self.settings.temperature,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Request {
                reason: format!("request to {url} failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Request {
                reason: format!("HTTP {status}: {}", truncate(&text, 300)),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| GenerationError::Request {
            reason: format!("unreadable completion response: {e}"),
        })?;
        first_content(parsed)
    }
}

fn first_content(response: ChatResponse) -> Result<String, GenerationError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or(GenerationError::EmptyResponse)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl TextGenerator for OpenAiAdapter {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        tracing::info!(
            "Calling LLM at {} with model {}",
            self.settings.base_url,
            self.settings.model
        );
        let timeout = self.settings.timeout;
        match tokio::time::timeout(timeout, self.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout {
                seconds: timeout.as_secs(),
            }),
        }
    }
}
