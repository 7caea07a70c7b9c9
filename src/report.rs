//! Report files written once at the end of a run.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::evaluate::{EvaluationOutcome, ModelAggregate};
use crate::types::{TaskType, TranscriptExample};

pub const RESULTS_FILE: &str = "analysis_results.json";
pub const REPORT_FILE: &str = "analysis_report.txt";
pub const CHART_FILE: &str = "chart_data.json";
pub const PREDICTIONS_FILE: &str = "predictions.jsonl";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetStats {
    pub conversations: usize,
    pub ground_truth_tasks: usize,
    pub no_task_conversations: usize,
    pub mean_tasks_per_conversation: f64,
    pub distribution: BTreeMap<TaskType, usize>,
}

impl DatasetStats {
    pub fn from_examples(examples: &[TranscriptExample]) -> Self {
        let mut distribution: BTreeMap<TaskType, usize> = TaskType::ALL.iter().map(|t| (*t, 0)).collect();
        for t in examples.iter().flat_map(|e| &e.expected_tasks) {
            *distribution.entry(t.task_type).or_default() += 1;
        }
        let ground_truth_tasks = distribution.values().sum();
        let conversations = examples.len();
        Self {
            conversations,
            ground_truth_tasks,
            no_task_conversations: examples.iter().filter(|e| e.is_no_task()).count(),
            mean_tasks_per_conversation: if conversations == 0 {
                0.0
            } else {
                ground_truth_tasks as f64 / conversations as f64
            },
            distribution,
        }
    }
}

/// Ranked models, lowest mean penalty first. Ties go to the name.
pub fn ranking(aggregates: &BTreeMap<String, ModelAggregate>) -> Vec<&ModelAggregate> {
    let mut ranked: Vec<_> = aggregates.values().filter(|a| a.is_ranked()).collect();
    ranked.sort_by(|a, b| a.mean_penalty.total_cmp(&b.mean_penalty).then_with(|| a.model.cmp(&b.model)));
    ranked
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartRow {
    pub model: String,
    pub mean_penalty: f64,
    pub accuracy: f64,
    pub challenge_score: f64,
    pub mean_latency_seconds: f64,
    pub cost_per_call_usd: f64,
    pub successful_calls: usize,
    pub failed_calls: usize,
}

/// What a chart renderer needs, with no rendering done here.
#[derive(Debug, Clone, Serialize)]
pub struct ChartData {
    pub model_scores: BTreeMap<String, f64>,
    pub ground_truth_distribution: BTreeMap<TaskType, usize>,
    /// Predicted tasks per type for every model plus a `ground_truth` column.
    pub prediction_volume: BTreeMap<String, BTreeMap<TaskType, usize>>,
    pub table: Vec<ChartRow>,
}

pub fn chart_data(outcome: &EvaluationOutcome) -> ChartData {
    let mut prediction_volume: BTreeMap<String, BTreeMap<TaskType, usize>> = outcome
        .aggregates
        .values()
        .map(|a| (a.model.clone(), a.per_task_type.iter().map(|(t, s)| (*t, s.predicted)).collect()))
        .collect();
    prediction_volume.insert("ground_truth".to_string(), outcome.dataset.distribution.clone());

    ChartData {
        model_scores: outcome.aggregates.values().map(|a| (a.model.clone(), a.challenge_score)).collect(),
        ground_truth_distribution: outcome.dataset.distribution.clone(),
        prediction_volume,
        table: outcome
            .aggregates
            .values()
            .map(|a| ChartRow {
                model: a.model.clone(),
                mean_penalty: a.mean_penalty,
                accuracy: a.accuracy,
                challenge_score: a.challenge_score,
                mean_latency_seconds: a.mean_latency_seconds,
                cost_per_call_usd: a.cost_per_call_usd,
                successful_calls: a.successful_calls,
                failed_calls: a.failed_calls,
            })
            .collect(),
    }
}

pub fn render_text_report(outcome: &EvaluationOutcome, generated_at: DateTime<Utc>) -> String {
    let mut out = String::new();
    let rule = "=".repeat(80);
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "TASK EXTRACTION MODEL EVALUATION REPORT");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Generated: {}", generated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if outcome.cancelled {
        let _ = writeln!(out, "NOTE: run was cancelled, results cover only dispatched transcripts");
    }
    let _ = writeln!(out);

    let ranked = ranking(&outcome.aggregates);
    let best = ranked.first().map(|a| a.model.as_str());
    let _ = writeln!(out, "PERFORMANCE SUMMARY");
    let _ = writeln!(out, "{}", "-".repeat(40));
    for a in outcome.aggregates.values() {
        let marker = if Some(a.model.as_str()) == best { " (BEST)" } else { "" };
        if a.available {
            let _ = writeln!(
                out,
                "{}{}: penalty {:.3}, accuracy {:.1}%, challenge score {:.4}",
                a.model,
                marker,
                a.mean_penalty,
                a.accuracy * 100.0,
                a.challenge_score
            );
        } else {
            let _ = writeln!(
                out,
                "{}: unavailable ({}), 0 successful predictions",
                a.model,
                a.unavailable_reason.as_deref().unwrap_or("unknown reason")
            );
        }
    }
    if let (Some(first), Some(last)) = (ranked.first(), ranked.last()) {
        if ranked.len() > 1 {
            let _ = writeln!(
                out,
                "\nSpread: {} beats {} by {:.3} mean penalty ({:.1} accuracy points)",
                first.model,
                last.model,
                last.mean_penalty - first.mean_penalty,
                (first.accuracy - last.accuracy) * 100.0
            );
        }
    }

    let d = &outcome.dataset;
    let _ = writeln!(out, "\nDATASET STATISTICS");
    let _ = writeln!(out, "{}", "-".repeat(40));
    let _ = writeln!(out, "Conversations evaluated: {}", d.conversations);
    let _ = writeln!(out, "Ground-truth tasks: {}", d.ground_truth_tasks);
    let _ = writeln!(out, "Conversations without tasks: {}", d.no_task_conversations);
    let _ = writeln!(out, "Mean tasks per conversation: {:.2}", d.mean_tasks_per_conversation);
    let _ = writeln!(out, "\nTask distribution:");
    for (t, count) in &d.distribution {
        let _ = writeln!(out, "  {t}: {count}");
    }

    let _ = writeln!(out, "\nDETAILED MODEL ANALYSIS");
    let _ = writeln!(out, "{}", "-".repeat(40));
    for a in outcome.aggregates.values().filter(|a| a.available) {
        let _ = writeln!(out, "\n{}:", a.model.to_uppercase());
        let _ = writeln!(out, "  Transcripts scored: {}", a.transcripts);
        let _ = writeln!(
            out,
            "  Calls: {} ok, {} failed ({} timeouts, {} parse failures)",
            a.successful_calls, a.failed_calls, a.timeouts, a.parse_failures
        );
        let _ = writeln!(out, "  Predicted tasks: {}", a.total_predicted_tasks);
        let _ = writeln!(out, "  Duplicates removed: {}", a.duplicates_removed);
        let _ = writeln!(out, "  Malformed items dropped: {}", a.malformed_items);
        let _ = writeln!(out, "  Mean latency: {:.2}s", a.mean_latency_seconds);
        let _ = writeln!(out, "  Cost: ${:.4} per call, ${:.4} total", a.cost_per_call_usd, a.total_cost_usd);
        let _ = writeln!(out, "  Per task type (FN/support, FP):");
        for (t, s) in &a.per_task_type {
            let _ = writeln!(
                out,
                "    {t}: {}/{} missed ({:.0}%), {} spurious",
                s.false_negatives,
                s.support,
                s.fn_rate * 100.0,
                s.false_positives
            );
        }
    }
    out
}

/// Flat model name → metrics mapping.
pub fn results_json(outcome: &EvaluationOutcome) -> Result<String> {
    Ok(serde_json::to_string_pretty(&outcome.aggregates)?)
}

pub fn predictions_jsonl(outcome: &EvaluationOutcome) -> Result<String> {
    let mut out = String::new();
    for p in &outcome.predictions {
        out.push_str(&serde_json::to_string(p)?);
        out.push('\n');
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub files: Vec<PathBuf>,
}

pub async fn write_report(dir: &Path, outcome: &EvaluationOutcome, write_predictions: bool) -> Result<WrittenReport> {
    tokio::fs::create_dir_all(dir).await?;
    let mut contents = vec![
        (RESULTS_FILE, results_json(outcome)?),
        (REPORT_FILE, render_text_report(outcome, Utc::now())),
        (CHART_FILE, serde_json::to_string_pretty(&chart_data(outcome))?),
    ];
    if write_predictions {
        contents.push((PREDICTIONS_FILE, predictions_jsonl(outcome)?));
    }

    let mut files = Vec::with_capacity(contents.len());
    for (name, body) in contents {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await?;
        info!(path = %path.display(), "Wrote report file");
        files.push(path);
    }
    Ok(WrittenReport { files })
}
