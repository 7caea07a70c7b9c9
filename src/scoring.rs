//! Order-independent weighted-penalty scoring of predicted task lists.
//!
//! Both sides are de-duplicated and put in canonical order before matching, so
//! neither duplicates nor input order can change a [`ScoreRecord`]. Matching is
//! on `task_type`; parameters only decide which same-typed candidates pair up
//! and never enter the penalty.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::config::ScoringConfig;
use crate::types::{dedup_assertions, PredictionRecord, ScoreRecord, TaskAssertion, TaskType, TranscriptExample};

#[derive(Debug, Clone, PartialEq)]
pub struct TaskScore {
    pub penalty: f64,
    pub false_negatives: Vec<TaskAssertion>,
    pub false_positives: Vec<TaskAssertion>,
    pub matched: Vec<(TaskAssertion, TaskAssertion)>,
    pub duplicates_removed: usize,
}

fn values_agree(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.trim().eq_ignore_ascii_case(y.trim()),
        _ => a == b,
    }
}

/// Number of expected parameters the prediction reproduces.
pub fn parameter_agreement(expected: &TaskAssertion, predicted: &TaskAssertion) -> usize {
    expected
        .parameters
        .iter()
        .filter(|&(k, v)| predicted.parameters.get(k).is_some_and(|p| values_agree(v, p)))
        .count()
}

pub fn score_tasks(expected: &[TaskAssertion], predicted: &[TaskAssertion], weights: &ScoringConfig) -> TaskScore {
    let (expected, _) = dedup_assertions(expected.to_vec());
    let (predicted, duplicates_removed) = dedup_assertions(predicted.to_vec());

    // Candidate pairs of equal type, best parameter agreement first; ties keep
    // canonical (expected, predicted) order.
    let mut candidates: Vec<(usize, usize, usize)> = Vec::new();
    for (i, e) in expected.iter().enumerate() {
        for (j, p) in predicted.iter().enumerate() {
            if e.task_type == p.task_type {
                candidates.push((i, j, parameter_agreement(e, p)));
            }
        }
    }
    candidates.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)).then(a.1.cmp(&b.1)));

    let mut expected_used = vec![false; expected.len()];
    let mut predicted_used = vec![false; predicted.len()];
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for (i, j, _) in candidates {
        if !expected_used[i] && !predicted_used[j] {
            expected_used[i] = true;
            predicted_used[j] = true;
            pairs.push((i, j));
        }
    }
    pairs.sort_unstable();

    let matched = pairs.iter().map(|&(i, j)| (expected[i].clone(), predicted[j].clone())).collect();
    let false_negatives: Vec<_> = expected
        .iter()
        .zip(&expected_used)
        .filter(|(_, used)| !**used)
        .map(|(t, _)| t.clone())
        .collect();
    let false_positives: Vec<_> = predicted
        .iter()
        .zip(&predicted_used)
        .filter(|(_, used)| !**used)
        .map(|(t, _)| t.clone())
        .collect();

    let penalty = weights.fn_weight * false_negatives.len() as f64 + weights.fp_weight * false_positives.len() as f64;
    TaskScore { penalty, false_negatives, false_positives, matched, duplicates_removed }
}

/// Scores one prediction against its transcript. Failed predictions carry no
/// tasks, so every expected task becomes a false negative.
pub fn score_prediction(example: &TranscriptExample, prediction: &PredictionRecord, weights: &ScoringConfig) -> ScoreRecord {
    let s = score_tasks(&example.expected_tasks, &prediction.predicted_tasks, weights);
    ScoreRecord {
        transcript_id: example.id.clone(),
        model_name: prediction.model_name.clone(),
        penalty: s.penalty,
        false_negatives: s.false_negatives,
        false_positives: s.false_positives,
        matched: s.matched,
        duplicates_removed: s.duplicates_removed,
        prediction_failed: !prediction.parse_succeeded,
    }
}

/// The challenge metric on task-type sets: `tp / (tp + w_fn·fn + w_fp·fp)`,
/// 1.0 when both sets are empty.
pub fn challenge_score(expected: &[TaskAssertion], predicted: &[TaskAssertion], weights: &ScoringConfig) -> f64 {
    let truth: BTreeSet<TaskType> = expected.iter().map(|t| t.task_type).collect();
    let pred: BTreeSet<TaskType> = predicted.iter().map(|t| t.task_type).collect();
    let tp = truth.intersection(&pred).count() as f64;
    let fp = pred.difference(&truth).count() as f64;
    let fn_ = truth.difference(&pred).count() as f64;
    if tp + fp + fn_ == 0.0 {
        return 1.0;
    }
    tp / (tp + weights.fn_weight * fn_ + weights.fp_weight * fp)
}

/// Accuracy-like view of a mean penalty: `max(0, 1 - mean / normalization)`.
pub fn accuracy(mean_penalty: f64, weights: &ScoringConfig) -> f64 {
    (1.0 - mean_penalty / weights.normalization).max(0.0)
}
