//! Hugging Face inference endpoint. Tries the chat route first and falls back
//! to raw text generation with the single-string prompt.

use std::time::Duration;

use async_trait::async_trait;
use governor::DefaultDirectRateLimiter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::hosted::{http_client, rate_limiter, request_error, ChatMessage, ChatRequest, ChatResponse};
use super::{Completion, Llm};
use crate::error::{HarnessError, Result};
use crate::extraction::Prompt;

#[derive(Debug, Clone)]
pub struct HfSettings {
    pub name: String,
    pub endpoint: String,
    pub token: String,
    pub temperature: f32,
    pub max_new_tokens: u32,
    pub timeout: Duration,
    pub requests_per_second: u32,
}

pub struct HfEndpointClient {
    http: Client,
    limiter: DefaultDirectRateLimiter,
    settings: HfSettings,
}

#[derive(Debug, Serialize)]
struct GenerationParameters {
    max_new_tokens: u32,
    temperature: f32,
    return_full_text: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GenerationResponse {
    Many(Vec<Generated>),
    One(Generated),
}

#[derive(Debug, Deserialize)]
struct Generated {
    generated_text: String,
}

impl GenerationResponse {
    fn into_text(self) -> String {
        match self {
            GenerationResponse::Many(items) => items.into_iter().next().map(|g| g.generated_text).unwrap_or_default(),
            GenerationResponse::One(g) => g.generated_text,
        }
    }
}

impl HfEndpointClient {
    pub fn new(settings: HfSettings) -> Result<Self> {
        let http = http_client(settings.timeout)?;
        let limiter = rate_limiter(settings.requests_per_second);
        Ok(Self { http, limiter, settings })
    }

    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.settings.endpoint.trim_end_matches('/'))
    }

    async fn chat(&self, prompt: &Prompt) -> Result<Completion> {
        let s = &self.settings;
        let body = ChatRequest {
            model: "tgi",
            messages: vec![ChatMessage { role: "user", content: &prompt.single }],
            temperature: s.temperature,
            max_tokens: s.max_new_tokens,
        };
        let resp = self
            .http
            .post(self.chat_url())
            .bearer_auth(&s.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(&s.name, s.timeout, e))?
            .error_for_status()
            .map_err(|e| request_error(&s.name, s.timeout, e))?
            .json::<ChatResponse>()
            .await
            .map_err(|e| request_error(&s.name, s.timeout, e))?;
        Ok(resp.into_completion())
    }

    async fn generate(&self, prompt: &Prompt) -> Result<Completion> {
        let s = &self.settings;
        let body = json!({
            "inputs": prompt.single,
            "parameters": GenerationParameters {
                max_new_tokens: s.max_new_tokens,
                temperature: s.temperature,
                return_full_text: false,
            },
        });
        let resp = self
            .http
            .post(&s.endpoint)
            .bearer_auth(&s.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(&s.name, s.timeout, e))?
            .error_for_status()
            .map_err(|e| request_error(&s.name, s.timeout, e))?
            .json::<GenerationResponse>()
            .await
            .map_err(|e| request_error(&s.name, s.timeout, e))?;
        Ok(Completion::text(resp.into_text()))
    }
}

#[async_trait]
impl Llm for HfEndpointClient {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        self.limiter.until_ready().await;
        match self.chat(prompt).await {
            Ok(completion) => Ok(completion),
            Err(HarnessError::Timeout { model, secs }) => Err(HarnessError::Timeout { model, secs }),
            Err(e) => {
                debug!(model = %self.settings.name, error = %e, "Chat route failed, falling back to text generation");
                self.generate(prompt).await
            }
        }
    }
}
