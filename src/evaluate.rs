//! Runs every backend over the test transcripts and folds the results into
//! per-model aggregates.
//!
//! Each (backend, transcript) pair is independent. Pairs for one backend are
//! dispatched through `buffer_unordered(max_parallel)`; backends run side by
//! side. Nothing is written until the whole run has been assembled.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{self, join_all};
use futures::{stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::extraction::Backend;
use crate::llm::registry::UnavailableBackend;
use crate::report::DatasetStats;
use crate::scoring::{accuracy, challenge_score, score_prediction};
use crate::segments::strip_disclaimer;
use crate::types::{FailureKind, PredictionRecord, ScoreRecord, TaskAssertion, TaskType, TranscriptExample};

/// Stops new (backend, transcript) pairs from being dispatched. Calls already
/// in flight finish or time out on their own.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeErrorStats {
    /// Expected occurrences of this type.
    pub support: usize,
    /// Predicted occurrences of this type after de-duplication.
    pub predicted: usize,
    pub false_negatives: usize,
    pub false_positives: usize,
    /// False negatives over support.
    pub fn_rate: f64,
    /// False positives over scored transcripts.
    pub fp_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelAggregate {
    pub model: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
    pub transcripts: usize,
    pub successful_calls: usize,
    pub failed_calls: usize,
    pub timeouts: usize,
    pub parse_failures: usize,
    pub mean_penalty: f64,
    pub accuracy: f64,
    pub challenge_score: f64,
    pub per_task_type: BTreeMap<TaskType, TypeErrorStats>,
    pub total_predicted_tasks: usize,
    pub duplicates_removed: usize,
    pub malformed_items: usize,
    pub mean_latency_seconds: f64,
    pub cost_per_call_usd: f64,
    pub total_cost_usd: f64,
}

impl ModelAggregate {
    /// A requested backend that never ran.
    pub fn unavailable(backend: &UnavailableBackend) -> Self {
        Self {
            model: backend.name.clone(),
            available: false,
            unavailable_reason: Some(backend.reason.clone()),
            per_task_type: TaskType::ALL.iter().map(|t| (*t, TypeErrorStats::default())).collect(),
            ..Self::default()
        }
    }

    /// Models with nothing to rank are left out of best/worst comparisons.
    pub fn is_ranked(&self) -> bool {
        self.available && self.successful_calls > 0
    }
}

fn mean(total: f64, n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        total / n as f64
    }
}

fn expected_side(s: &ScoreRecord) -> Vec<TaskAssertion> {
    s.matched.iter().map(|(e, _)| e.clone()).chain(s.false_negatives.iter().cloned()).collect()
}

fn predicted_side(s: &ScoreRecord) -> Vec<TaskAssertion> {
    s.matched.iter().map(|(_, p)| p.clone()).chain(s.false_positives.iter().cloned()).collect()
}

pub fn aggregate(model: &str, predictions: &[PredictionRecord], scores: &[ScoreRecord], cfg: &RunConfig) -> ModelAggregate {
    let n = scores.len();
    let mut per_task_type: BTreeMap<TaskType, TypeErrorStats> =
        TaskType::ALL.iter().map(|t| (*t, TypeErrorStats::default())).collect();

    for s in scores {
        for (e, _) in &s.matched {
            per_task_type.entry(e.task_type).or_default().support += 1;
        }
        for e in &s.false_negatives {
            let stats = per_task_type.entry(e.task_type).or_default();
            stats.support += 1;
            stats.false_negatives += 1;
        }
        for p in &s.false_positives {
            per_task_type.entry(p.task_type).or_default().false_positives += 1;
        }
        for p in predicted_side(s) {
            per_task_type.entry(p.task_type).or_default().predicted += 1;
        }
    }
    for stats in per_task_type.values_mut() {
        stats.fn_rate = mean(stats.false_negatives as f64, stats.support);
        stats.fp_rate = mean(stats.false_positives as f64, n);
    }

    let mean_penalty = mean(scores.iter().map(|s| s.penalty).sum(), n);
    let challenge = mean(
        scores.iter().map(|s| challenge_score(&expected_side(s), &predicted_side(s), &cfg.scoring)).sum(),
        n,
    );
    let calls = predictions.len();
    let total_cost_usd: f64 = predictions.iter().map(|p| p.cost_usd).sum();
    let failed_calls = predictions.iter().filter(|p| !p.parse_succeeded).count();

    ModelAggregate {
        model: model.to_string(),
        available: true,
        unavailable_reason: None,
        transcripts: n,
        successful_calls: calls - failed_calls,
        failed_calls,
        timeouts: predictions.iter().filter(|p| p.failure == Some(FailureKind::Timeout)).count(),
        parse_failures: predictions.iter().filter(|p| p.failure == Some(FailureKind::Parse)).count(),
        mean_penalty,
        accuracy: accuracy(mean_penalty, &cfg.scoring),
        challenge_score: challenge,
        per_task_type,
        total_predicted_tasks: predictions.iter().map(|p| p.predicted_tasks.len()).sum(),
        duplicates_removed: scores.iter().map(|s| s.duplicates_removed).sum(),
        malformed_items: predictions.iter().map(|p| p.malformed_items).sum(),
        mean_latency_seconds: mean(predictions.iter().map(|p| p.latency_seconds).sum(), calls),
        cost_per_call_usd: mean(total_cost_usd, calls),
        total_cost_usd,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationOutcome {
    pub aggregates: BTreeMap<String, ModelAggregate>,
    pub predictions: Vec<PredictionRecord>,
    pub scores: Vec<ScoreRecord>,
    pub dataset: DatasetStats,
    pub cancelled: bool,
    pub elapsed_seconds: f64,
}

/// The slice of the test split this run covers.
pub fn select_test_subset<'a>(test: &'a [TranscriptExample], cfg: &RunConfig) -> &'a [TranscriptExample] {
    match cfg.test_subset {
        Some(n) if n < test.len() => &test[..n],
        _ => test,
    }
}

async fn run_backend(
    backend: &Backend,
    examples: &[TranscriptExample],
    context_block: &str,
    cfg: &RunConfig,
    cancel: &CancellationToken,
) -> (Vec<PredictionRecord>, Vec<ScoreRecord>) {
    info!(model = %backend.name, transcripts = examples.len(), max_parallel = backend.max_parallel, "Evaluating backend");
    let started = Instant::now();

    let mut pairs: Vec<(PredictionRecord, ScoreRecord)> = stream::iter(examples)
        .take_while(|_| future::ready(!cancel.is_cancelled()))
        .map(|example| async move {
            let transcript = strip_disclaimer(&example.text);
            let prediction = backend.predict(&example.id, &transcript, context_block, None).await;
            let score = score_prediction(example, &prediction.record, &cfg.scoring);
            (prediction.record, score)
        })
        .buffer_unordered(backend.max_parallel)
        .collect()
        .await;
    pairs.sort_by(|a, b| a.0.transcript_id.cmp(&b.0.transcript_id));

    let failed = pairs.iter().filter(|(p, _)| !p.parse_succeeded).count();
    if pairs.len() < examples.len() {
        warn!(model = %backend.name, done = pairs.len(), total = examples.len(), "Dispatch stopped by cancellation");
    }
    info!(
        model = %backend.name,
        done = pairs.len(),
        failed,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Backend finished"
    );
    pairs.into_iter().unzip()
}

/// Runs the full cross product. Never fails: per-pair problems end up in the
/// records and unavailable backends are reported with zeroed aggregates.
pub async fn evaluate(
    backends: &[Backend],
    unavailable: &[UnavailableBackend],
    test: &[TranscriptExample],
    context_block: &str,
    cfg: &RunConfig,
    cancel: &CancellationToken,
) -> EvaluationOutcome {
    let started = Instant::now();
    let examples = select_test_subset(test, cfg);

    let mut names = HashSet::new();
    let backends: Vec<&Backend> = backends
        .iter()
        .filter(|b| {
            let first = names.insert(b.name.as_str());
            if !first {
                warn!(model = %b.name, "Duplicate backend name, running it once");
            }
            first
        })
        .collect();

    let runs = join_all(backends.iter().map(|b| run_backend(b, examples, context_block, cfg, cancel))).await;

    let mut aggregates = BTreeMap::new();
    let mut predictions = Vec::new();
    let mut scores = Vec::new();
    for (backend, (preds, scs)) in backends.into_iter().zip(runs) {
        aggregates.insert(backend.name.clone(), aggregate(&backend.name, &preds, &scs, cfg));
        predictions.extend(preds);
        scores.extend(scs);
    }
    for missing in unavailable {
        aggregates.entry(missing.name.clone()).or_insert_with(|| ModelAggregate::unavailable(missing));
    }

    EvaluationOutcome {
        aggregates,
        predictions,
        scores,
        dataset: DatasetStats::from_examples(examples),
        cancelled: cancel.is_cancelled(),
        elapsed_seconds: started.elapsed().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HarnessError, Result};
    use crate::extraction::{CostModel, Prompt};
    use crate::llm::{BackendKind, Completion, Llm};
    use crate::types::Split;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Answers with the label named on the transcript's first line.
    struct Echo;

    #[async_trait]
    impl Llm for Echo {
        async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
            let transcript = prompt.user.rsplit("\n\n").next().unwrap_or_default();
            if transcript.contains("boom") {
                return Err(HarnessError::backend("echo", "connection reset"));
            }
            let label = transcript.lines().next().unwrap_or_default().trim();
            match label.parse::<TaskType>() {
                Ok(t) => Ok(Completion::text(format!(r#"[{{"task_type": "{t}"}}]"#))),
                Err(_) => Ok(Completion::text("[]")),
            }
        }
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl Llm for Counting {
        async fn complete(&self, _prompt: &Prompt) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            Ok(Completion::text("[]"))
        }
    }

    fn backend(name: &str, llm: Arc<dyn Llm>, max_parallel: usize) -> Backend {
        Backend::new(name, BackendKind::AzureOpenAi, llm, CostModel::PerCall { usd: 0.01 }, max_parallel, Duration::from_secs(5))
    }

    fn example(id: &str, text: &str, tasks: &[TaskType]) -> TranscriptExample {
        TranscriptExample::new(id, text, Split::Test, tasks.iter().map(|t| TaskAssertion::new(*t)).collect())
    }

    fn test_split() -> Vec<TranscriptExample> {
        vec![
            example("a", "schedule_meeting\nAdvisor: see you Tuesday.", &[TaskType::ScheduleMeeting]),
            example("b", "plan_contact\nAdvisor: I'll call you.", &[TaskType::PlanContact, TaskType::UpdateKycActivity]),
            example("c", "\nAdvisor: Have a nice day.", &[]),
            example("d", "boom", &[TaskType::UpdateKycTotalAssets]),
        ]
    }

    #[tokio::test]
    async fn failures_become_sentinel_records_and_run_completes() {
        let cfg = RunConfig::default();
        let backends = vec![backend("echo", Arc::new(Echo), 2)];
        let out = evaluate(&backends, &[], &test_split(), "", &cfg, &CancellationToken::new()).await;

        assert_eq!(out.predictions.len(), 4);
        let failed = out.scores.iter().find(|s| s.transcript_id == "d").unwrap();
        assert!(failed.prediction_failed);
        assert_eq!(failed.penalty, 2.0);

        let agg = &out.aggregates["echo"];
        assert_eq!(agg.successful_calls, 3);
        assert_eq!(agg.failed_calls, 1);
        // a: 0, b: one FN, c: 0, d: one FN; the failed call is not billed
        assert_eq!(agg.mean_penalty, 1.0);
        assert_eq!(agg.accuracy, 0.75);
        assert_eq!(agg.per_task_type[&TaskType::UpdateKycActivity].fn_rate, 1.0);
        assert_eq!(agg.per_task_type[&TaskType::ScheduleMeeting].false_negatives, 0);
        assert!((agg.total_cost_usd - 0.03).abs() < 1e-12);
    }

    #[tokio::test]
    async fn unavailable_backends_are_listed_with_zeros() {
        let cfg = RunConfig::default();
        let missing = vec![UnavailableBackend { name: "apertus-hf".into(), reason: "HUGGINGFACE_TOKEN is not set".into() }];
        let out = evaluate(&[], &missing, &test_split(), "", &cfg, &CancellationToken::new()).await;
        let agg = &out.aggregates["apertus-hf"];
        assert!(!agg.available);
        assert_eq!(agg.successful_calls, 0);
        assert!(!agg.is_ranked());
        assert_eq!(agg.per_task_type.len(), TaskType::ALL.len());
    }

    #[tokio::test]
    async fn subset_caps_transcripts() {
        let cfg = RunConfig { test_subset: Some(2), ..RunConfig::default() };
        let backends = vec![backend("echo", Arc::new(Echo), 4)];
        let out = evaluate(&backends, &[], &test_split(), "", &cfg, &CancellationToken::new()).await;
        assert_eq!(out.aggregates["echo"].transcripts, 2);
        assert_eq!(out.dataset.conversations, 2);
    }

    #[tokio::test]
    async fn cancellation_stops_new_dispatch() {
        let cfg = RunConfig::default();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let llm = Arc::new(Counting { calls: calls.clone(), cancel: cancel.clone() });
        let out = evaluate(&[backend("slow", llm, 1)], &[], &test_split(), "", &cfg, &cancel).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.predictions.len(), 1);
        assert!(out.cancelled);
    }

    /// Always answers with the same task listed twice.
    struct Doubled;

    #[async_trait]
    impl Llm for Doubled {
        async fn complete(&self, _prompt: &Prompt) -> Result<Completion> {
            Ok(Completion::text(r#"[{"task_type": "plan_contact"}, {"task_type": "plan_contact"}]"#))
        }
    }

    #[tokio::test]
    async fn predicted_counts_exclude_duplicates() {
        let cfg = RunConfig::default();
        let split = test_split()[..2].to_vec();
        let out = evaluate(&[backend("doubled", Arc::new(Doubled), 2)], &[], &split, "", &cfg, &CancellationToken::new()).await;
        let agg = &out.aggregates["doubled"];
        assert_eq!(agg.duplicates_removed, 2);
        let plan = &agg.per_task_type[&TaskType::PlanContact];
        assert_eq!(plan.predicted, 2);
        // a: spurious plan_contact, b: matched
        assert_eq!(plan.false_positives, 1);
        assert_eq!(plan.predicted, plan.false_positives + plan.support - plan.false_negatives);
    }

    #[tokio::test]
    async fn backends_sharing_a_name_run_once() {
        let cfg = RunConfig::default();
        let backends = vec![backend("echo", Arc::new(Echo), 2), backend("echo", Arc::new(Echo), 2)];
        let out = evaluate(&backends, &[], &test_split(), "", &cfg, &CancellationToken::new()).await;
        assert_eq!(out.aggregates.len(), 1);
        assert_eq!(out.predictions.len(), 4);
        assert_eq!(out.scores.len(), 4);
    }

    #[test]
    fn challenge_score_is_averaged_from_records() {
        let cfg = RunConfig::default();
        let t = |x| TaskAssertion::new(x);
        let s = ScoreRecord {
            transcript_id: "x".into(),
            model_name: "m".into(),
            penalty: 1.0,
            false_negatives: vec![],
            false_positives: vec![t(TaskType::ScheduleMeeting)],
            matched: vec![(t(TaskType::PlanContact), t(TaskType::PlanContact))],
            duplicates_removed: 0,
            prediction_failed: false,
        };
        let agg = aggregate("m", &[], &[s], &cfg);
        assert!((agg.challenge_score - 0.5).abs() < 1e-12);
    }
}
