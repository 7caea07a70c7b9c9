//! Few-shot context selection.
//!
//! Every backend receives the same block, so score differences come from the
//! models and not from the prompt.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::ContextConfig;
use crate::parse::render_tasks;
use crate::segments::{strip_disclaimer, truncate_graphemes};
use crate::types::{TaskType, TranscriptExample};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "task_type", rename_all = "snake_case")]
pub enum SelectionReason {
    Covers(TaskType),
    NoTask,
    MultiTask,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionReason::Covers(t) => write!(f, "Representative of: {t}"),
            SelectionReason::NoTask => f.write_str("No tasks example"),
            SelectionReason::MultiTask => f.write_str("Multi-task example"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextExample {
    pub transcript_id: String,
    pub reason: SelectionReason,
    pub task_types: BTreeSet<TaskType>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FewShotContext {
    pub examples: Vec<ContextExample>,
    pub block: String,
}

impl FewShotContext {
    pub fn covered_types(&self) -> BTreeSet<TaskType> {
        self.examples.iter().flat_map(|e| e.task_types.iter().copied()).collect()
    }

    pub fn has_no_task_example(&self) -> bool {
        self.examples.iter().any(|e| e.reason == SelectionReason::NoTask)
    }
}

fn length(example: &TranscriptExample) -> usize {
    example.text.chars().count()
}

/// Shortest untaken example matching `pred`; ties go to corpus order.
fn shortest<'a>(
    train: &'a [TranscriptExample],
    taken: &BTreeSet<&str>,
    pred: impl Fn(&TranscriptExample) -> bool,
) -> Option<&'a TranscriptExample> {
    train
        .iter()
        .filter(|e| !taken.contains(e.id.as_str()) && pred(e))
        .min_by_key(|e| length(e))
}

/// Picks at most `cfg.k` training examples: one per task type in canonical
/// order (shortest single-type transcript first), then the shortest no-task
/// transcript, then multi-task transcripts if budget remains.
pub fn select_examples<'a>(
    train: &'a [TranscriptExample],
    cfg: &ContextConfig,
) -> Vec<(&'a TranscriptExample, SelectionReason)> {
    let budget = cfg.k;
    let has_no_task = train.iter().any(TranscriptExample::is_no_task);
    let coverage_budget = if has_no_task { budget.saturating_sub(1).max(1) } else { budget };

    let mut selected: Vec<(&TranscriptExample, SelectionReason)> = Vec::new();
    let mut taken: BTreeSet<&str> = BTreeSet::new();
    let mut covered: BTreeSet<TaskType> = BTreeSet::new();

    for task_type in TaskType::ALL {
        if covered.contains(&task_type) {
            continue;
        }
        if selected.len() >= coverage_budget.min(budget) {
            debug!(task_type = %task_type, "Context budget exhausted before coverage");
            break;
        }
        let pick = shortest(train, &taken, |e| {
            let types = e.task_types();
            types.len() == 1 && types.contains(&task_type)
        })
        .or_else(|| shortest(train, &taken, |e| e.task_types().contains(&task_type)));
        if let Some(example) = pick {
            covered.extend(example.task_types());
            taken.insert(example.id.as_str());
            selected.push((example, SelectionReason::Covers(task_type)));
        }
    }

    if selected.len() < budget {
        if let Some(example) = shortest(train, &taken, TranscriptExample::is_no_task) {
            taken.insert(example.id.as_str());
            selected.push((example, SelectionReason::NoTask));
        }
    }

    if cfg.fill_remaining && selected.len() < budget {
        let mut multi: Vec<&TranscriptExample> = train
            .iter()
            .filter(|e| e.task_types().len() > 1 && !taken.contains(e.id.as_str()))
            .collect();
        multi.sort_by_key(|e| length(e));
        for example in multi.into_iter().take(budget - selected.len()) {
            selected.push((example, SelectionReason::MultiTask));
        }
    }

    selected
}

pub fn render_context(selected: &[(&TranscriptExample, SelectionReason)], cfg: &ContextConfig) -> String {
    let mut parts = vec!["TRAINING EXAMPLES FOR TASK EXTRACTION:".to_string(), String::new()];
    for (i, (example, reason)) in selected.iter().enumerate() {
        let conversation = truncate_graphemes(&strip_disclaimer(&example.text), cfg.max_example_chars);
        parts.push(format!("Example {}: {}", i + 1, reason));
        parts.push(format!("Conversation: {conversation}"));
        parts.push(format!("Tasks: {}", render_tasks(&example.expected_tasks)));
        parts.push(String::new());
    }
    parts.join("\n")
}

pub fn build_context(train: &[TranscriptExample], cfg: &ContextConfig) -> FewShotContext {
    let selected = select_examples(train, cfg);
    let block = render_context(&selected, cfg);
    let examples: Vec<ContextExample> = selected
        .iter()
        .map(|(e, reason)| ContextExample {
            transcript_id: e.id.clone(),
            reason: reason.clone(),
            task_types: e.task_types(),
        })
        .collect();
    let context = FewShotContext { examples, block };
    info!(
        examples = context.examples.len(),
        covered = context.covered_types().len(),
        chars = context.block.len(),
        "Built few-shot context"
    );
    context
}
