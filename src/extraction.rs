//! Prompt construction and the per-backend `predict` contract.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::HarnessError;
use crate::llm::{BackendKind, Completion, Llm};
use crate::parse::parse_task_response;
use crate::types::{FailureKind, PredictionRecord, TaskType, TokenUsage};

/// The same request in the two shapes providers accept.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    /// System and user text joined, for endpoints without a system role.
    pub single: String,
}

pub fn instruction_preamble() -> String {
    let mut lines = vec![
        "You are an expert AI assistant specialized in analyzing bank client conversations to extract actionable tasks.".to_string(),
        String::new(),
        "ALLOWED TASK TYPES (use these exact labels):".to_string(),
    ];
    for t in TaskType::ALL {
        lines.push(format!("- {}: {}", t, t.description()));
    }
    lines.extend(
        [
            "",
            "INSTRUCTIONS:",
            "1. Read the conversation transcript carefully. It may be in English, French, German or Italian.",
            "2. Identify actionable tasks that the client advisor needs to complete.",
            "3. Map each task to one of the allowed task types above.",
            "4. Return ONLY a JSON array of objects: [{\"task_type\": \"<label>\", \"parameters\": {...}}]",
            "5. Put any details you find (dates, amounts, addresses, contact data) in \"parameters\".",
            "6. If no tasks are identified, return an empty array: []",
            "7. Do not include any explanation, just the JSON array.",
        ]
        .map(String::from),
    );
    lines.join("\n")
}

pub fn build_prompt(context_block: &str, transcript: &str, language_hint: Option<&str>) -> Prompt {
    let mut system = instruction_preamble();
    if !context_block.is_empty() {
        system.push_str("\n\nTraining Examples:\n");
        system.push_str(context_block);
    }
    let user = format!(
        "Language hint: {}\n\nAnalyze this bank client conversation transcript and extract all actionable tasks:\n\n{}",
        language_hint.unwrap_or("auto"),
        transcript
    );
    let single = format!("{system}\n\n{user}\n\nTasks (JSON array):");
    Prompt { system, user, single }
}

/// How a backend is billed, supplied per backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostModel {
    PerToken { input_per_1k: f64, output_per_1k: f64 },
    PerCall { usd: f64 },
}

impl CostModel {
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        match *self {
            CostModel::PerToken { input_per_1k, output_per_1k } => {
                usage.prompt_tokens as f64 / 1000.0 * input_per_1k
                    + usage.completion_tokens as f64 / 1000.0 * output_per_1k
            }
            CostModel::PerCall { usd } => usd,
        }
    }
}

/// Rough token count for providers that do not report usage.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// One model behind the uniform `predict` contract.
#[derive(Clone)]
pub struct Backend {
    pub name: String,
    pub kind: BackendKind,
    pub cost: CostModel,
    pub max_parallel: usize,
    pub timeout: Duration,
    llm: Arc<dyn Llm>,
}

#[derive(Debug, Clone)]
pub struct Prediction {
    pub record: PredictionRecord,
    pub error: Option<String>,
}

impl Backend {
    pub fn new(
        name: impl Into<String>,
        kind: BackendKind,
        llm: Arc<dyn Llm>,
        cost: CostModel,
        max_parallel: usize,
        timeout: Duration,
    ) -> Self {
        Self { name: name.into(), kind, cost, max_parallel: max_parallel.max(1), timeout, llm }
    }

    /// Never fails: call errors, timeouts and unparseable output all come back
    /// as a record with `parse_succeeded == false` and no tasks.
    pub async fn predict(
        &self,
        transcript_id: &str,
        transcript: &str,
        context_block: &str,
        language_hint: Option<&str>,
    ) -> Prediction {
        let prompt = build_prompt(context_block, transcript, language_hint);
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, self.llm.complete(&prompt)).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::Timeout { model: self.name.clone(), secs: self.timeout.as_secs() }),
        };
        let latency_seconds = started.elapsed().as_secs_f64();

        let mut record = PredictionRecord {
            transcript_id: transcript_id.to_string(),
            model_name: self.name.clone(),
            predicted_tasks: Vec::new(),
            raw_response: String::new(),
            latency_seconds,
            parse_succeeded: false,
            failure: None,
            malformed_items: 0,
            usage: None,
            cost_usd: 0.0,
        };

        let Completion { text, usage } = match outcome {
            Ok(completion) => completion,
            Err(e) => {
                warn!(model = %self.name, transcript_id, error = %e, "Backend call failed");
                record.failure = Some(match e {
                    HarnessError::Timeout { .. } => FailureKind::Timeout,
                    _ => FailureKind::BackendCall,
                });
                return Prediction { record, error: Some(e.to_string()) };
            }
        };

        let usage = usage.unwrap_or_else(|| TokenUsage {
            prompt_tokens: estimate_tokens(&prompt.single),
            completion_tokens: estimate_tokens(&text),
        });
        record.usage = Some(usage);
        record.cost_usd = self.cost.cost(usage);

        let error = match parse_task_response(&text) {
            Ok(parsed) => {
                debug!(model = %self.name, transcript_id, tasks = parsed.tasks.len(), "Parsed response");
                record.predicted_tasks = parsed.tasks;
                record.malformed_items = parsed.malformed_items;
                record.parse_succeeded = true;
                None
            }
            Err(e) => {
                warn!(model = %self.name, transcript_id, error = %e, "Could not parse response");
                record.failure = Some(FailureKind::Parse);
                Some(HarnessError::Parse(e.to_string()).to_string())
            }
        };
        record.raw_response = text;
        Prediction { record, error }
    }
}
