//! OpenAI-compatible hosted chat endpoints (Swisscom's Apertus deployment and
//! any other server speaking `/chat/completions`).

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Completion, Llm};
use crate::error::{HarnessError, Result};
use crate::extraction::Prompt;
use crate::types::TokenUsage;

pub const SWISSCOM_ENDPOINT: &str = "https://api.swisscom.ch/llm/inference/v1/chat/completions";
pub const SWISSCOM_MODEL: &str = "apertus-1.0";

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

impl ChatResponse {
    pub(crate) fn into_completion(self) -> Completion {
        let text = self
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = self.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        });
        Completion { text, usage }
    }
}

pub(crate) fn rate_limiter(requests_per_second: u32) -> DefaultDirectRateLimiter {
    let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
    RateLimiter::direct(Quota::per_second(rps))
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| HarnessError::Configuration(format!("cannot build HTTP client: {e}")))
}

pub(crate) fn request_error(name: &str, timeout: Duration, e: reqwest::Error) -> HarnessError {
    if e.is_timeout() {
        HarnessError::Timeout { model: name.to_string(), secs: timeout.as_secs() }
    } else {
        HarnessError::backend(name, e)
    }
}

#[derive(Debug, Clone)]
pub struct HostedChatSettings {
    pub name: String,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub requests_per_second: u32,
}

pub struct HostedChatClient {
    http: Client,
    limiter: DefaultDirectRateLimiter,
    settings: HostedChatSettings,
}

impl HostedChatClient {
    pub fn new(settings: HostedChatSettings) -> Result<Self> {
        let http = http_client(settings.timeout)?;
        let limiter = rate_limiter(settings.requests_per_second);
        Ok(Self { http, limiter, settings })
    }
}

#[async_trait]
impl Llm for HostedChatClient {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        self.limiter.until_ready().await;
        let s = &self.settings;
        let body = ChatRequest {
            model: &s.model,
            messages: vec![
                ChatMessage { role: "system", content: &prompt.system },
                ChatMessage { role: "user", content: &prompt.user },
            ],
            temperature: s.temperature,
            max_tokens: s.max_tokens,
        };
        let resp = self
            .http
            .post(&s.endpoint)
            .bearer_auth(&s.api_key)
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
}
