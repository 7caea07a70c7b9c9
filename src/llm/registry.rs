//! Maps model names to backend constructors.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::hf::{HfEndpointClient, HfSettings};
use super::hosted::{HostedChatClient, HostedChatSettings, SWISSCOM_ENDPOINT, SWISSCOM_MODEL};
use super::openai::{AzureOpenAiClient, AzureOpenAiSettings, DEFAULT_API_VERSION, DEFAULT_DEPLOYMENT};
use crate::config::RunConfig;
use crate::error::{HarnessError, Result};
use crate::extraction::{Backend, CostModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    AzureOpenAi,
    ApertusHf,
    ApertusSwisscom,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] =
        [BackendKind::AzureOpenAi, BackendKind::ApertusHf, BackendKind::ApertusSwisscom];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::AzureOpenAi => "azure-openai",
            BackendKind::ApertusHf => "apertus-hf",
            BackendKind::ApertusSwisscom => "apertus-swisscom",
        }
    }

    pub fn default_cost(&self) -> CostModel {
        match self {
            BackendKind::AzureOpenAi => CostModel::PerToken { input_per_1k: 0.0025, output_per_1k: 0.01 },
            BackendKind::ApertusSwisscom => CostModel::PerToken { input_per_1k: 0.0005, output_per_1k: 0.0015 },
            // Dedicated endpoint billed by the hour, amortised per call.
            BackendKind::ApertusHf => CostModel::PerCall { usd: 0.002 },
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "azure-openai" | "azure_openai" | "gpt-4o" | "gpt4o" | "openai" => Ok(BackendKind::AzureOpenAi),
            "apertus-hf" | "apertus" | "hf" | "huggingface" => Ok(BackendKind::ApertusHf),
            "apertus-swisscom" | "swisscom-apertus" | "swisscom" => Ok(BackendKind::ApertusSwisscom),
            other => Err(HarnessError::UnknownBackend(other.to_string())),
        }
    }
}

fn required(env: &dyn Fn(&str) -> Option<String>, var: &str) -> Result<String> {
    env(var)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| HarnessError::Configuration(format!("{var} is not set")))
}

/// Builds one backend from environment lookups. Missing credentials are a
/// `Configuration` error for this backend only.
pub fn build_backend(kind: BackendKind, cfg: &RunConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<Backend> {
    let b = &cfg.backend;
    let timeout = b.timeout();
    let llm: Arc<dyn super::Llm> = match kind {
        BackendKind::AzureOpenAi => Arc::new(AzureOpenAiClient::new(AzureOpenAiSettings {
            api_key: required(env, "AZURE_OPENAI_API_KEY")?,
            endpoint: required(env, "AZURE_OPENAI_API_ENDPOINT")?,
            deployment: env("AZURE_OPENAI_DEPLOYMENT").unwrap_or_else(|| DEFAULT_DEPLOYMENT.to_string()),
            api_version: env("AZURE_OPENAI_API_VERSION").unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            temperature: b.temperature,
            max_tokens: b.max_tokens,
        })),
        BackendKind::ApertusHf => Arc::new(HfEndpointClient::new(HfSettings {
            name: kind.name().to_string(),
            endpoint: required(env, "HUGGINGFACE_ENDPOINT_URL")?,
            token: required(env, "HUGGINGFACE_TOKEN")?,
            temperature: b.temperature,
            max_new_tokens: b.max_tokens,
            timeout,
            requests_per_second: b.requests_per_second,
        })?),
        BackendKind::ApertusSwisscom => Arc::new(HostedChatClient::new(HostedChatSettings {
            name: kind.name().to_string(),
            endpoint: env("SWISSCOM_ENDPOINT_URL").unwrap_or_else(|| SWISSCOM_ENDPOINT.to_string()),
            api_key: required(env, "SWISSCOM_API_KEY")?,
            model: SWISSCOM_MODEL.to_string(),
            temperature: b.temperature,
            max_tokens: b.max_tokens,
            timeout,
            requests_per_second: b.requests_per_second,
        })?),
    };
    let cost = cfg.pricing.get(kind.name()).copied().unwrap_or_else(|| kind.default_cost());
    Ok(Backend::new(kind.name(), kind, llm, cost, b.max_parallel, timeout))
}

/// A backend the operator asked for that could not be constructed.
#[derive(Debug, Clone, Serialize)]
pub struct UnavailableBackend {
    pub name: String,
    pub reason: String,
}

/// Builds every requested backend, reporting the ones that fail instead of aborting.
/// Aliases of an already requested kind are skipped, so each kind runs once.
pub fn build_backends(
    names: &[String],
    cfg: &RunConfig,
    env: &dyn Fn(&str) -> Option<String>,
) -> (Vec<Backend>, Vec<UnavailableBackend>) {
    let mut ready = Vec::new();
    let mut unavailable = Vec::new();
    let mut seen: HashSet<BackendKind> = HashSet::new();
    for name in names {
        let kind = match name.parse::<BackendKind>() {
            Ok(kind) => kind,
            Err(e) => {
                error!(model = %name, error = %e, "Backend unavailable, continuing without it");
                unavailable.push(UnavailableBackend { name: name.clone(), reason: e.to_string() });
                continue;
            }
        };
        if !seen.insert(kind) {
            warn!(model = %name, kind = %kind, "Backend requested more than once, ignoring repeat");
            continue;
        }
        match build_backend(kind, cfg, env) {
            Ok(backend) => {
                info!(model = %backend.name, "Backend ready");
                ready.push(backend);
            }
            Err(e) => {
                error!(model = %kind, error = %e, "Backend unavailable, continuing without it");
                unavailable.push(UnavailableBackend { name: kind.name().to_string(), reason: e.to_string() });
            }
        }
    }
    (ready, unavailable)
}
