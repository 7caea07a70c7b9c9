//! Provider clients. Each turns a [`Prompt`] into raw completion text.

pub mod hf;
pub mod hosted;
pub mod openai;
pub mod registry;

use async_trait::async_trait;

use crate::error::Result;
use crate::extraction::Prompt;
use crate::types::TokenUsage;

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), usage: None }
    }
}

#[async_trait]
pub trait Llm: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion>;
}

pub use registry::{build_backend, BackendKind};
