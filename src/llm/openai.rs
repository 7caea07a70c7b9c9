use async_openai::{
    config::AzureConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;

use super::{Completion, Llm};
use crate::error::{HarnessError, Result};
use crate::extraction::Prompt;
use crate::types::TokenUsage;

pub const DEFAULT_API_VERSION: &str = "2025-01-01-preview";
pub const DEFAULT_DEPLOYMENT: &str = "gpt-4o";

#[derive(Debug, Clone)]
pub struct AzureOpenAiSettings {
    pub api_key: String,
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Clone)]
pub struct AzureOpenAiClient {
    client: Client<AzureConfig>,
    settings: AzureOpenAiSettings,
}

impl AzureOpenAiClient {
    pub fn new(settings: AzureOpenAiSettings) -> Self {
        let cfg = AzureConfig::new()
            .with_api_base(settings.endpoint.clone())
            .with_api_key(settings.api_key.clone())
            .with_deployment_id(settings.deployment.clone())
            .with_api_version(settings.api_version.clone());
        Self { client: Client::with_config(cfg), settings }
    }

    fn messages(&self, prompt: &Prompt) -> Result<Vec<ChatCompletionRequestMessage>> {
        let sys = ChatCompletionRequestSystemMessageArgs::default()
            .content(prompt.system.clone())
            .build()
            .map_err(|e| self.error(e))?
            .into();
        let usr = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.user.clone())
            .build()
            .map_err(|e| self.error(e))?
            .into();
        Ok(vec![sys, usr])
    }

    fn error(&self, e: impl ToString) -> HarnessError {
        HarnessError::backend(format!("azure-openai/{}", self.settings.deployment), e)
    }
}

#[async_trait]
impl Llm for AzureOpenAiClient {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        let req = CreateChatCompletionRequestArgs::default()
            .model(self.settings.deployment.clone())
            .messages(self.messages(prompt)?)
            .temperature(self.settings.temperature)
            .max_tokens(self.settings.max_tokens)
            .build()
            .map_err(|e| self.error(e))?;

        let resp = self.client.chat().create(req).await.map_err(|e| self.error(e))?;
        let text = resp
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let usage = resp.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        });
        Ok(Completion { text, usage })
    }
}
