mod support;

use std::sync::atomic::Ordering;

use support::{fake_backend, topic_oracle, write_dataset, FakeLlm};
use taskscore_rs::context::{build_context, SelectionReason};
use taskscore_rs::corpus::load_corpus;
use taskscore_rs::llm::registry::build_backends;
use taskscore_rs::report::{write_report, CHART_FILE, PREDICTIONS_FILE, REPORT_FILE, RESULTS_FILE};
use taskscore_rs::types::FailureKind;
use taskscore_rs::*;

#[tokio::test]
async fn dataset_loads_and_context_covers_every_type() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let corpus = load_corpus(dir.path()).await.unwrap();
    assert_eq!(corpus.train.len(), 11);
    assert_eq!(corpus.validation.len(), 1);
    assert_eq!(corpus.test.len(), 4);

    let cfg = RunConfig::default();
    let context = build_context(&corpus.train, &cfg.context);
    assert_eq!(context.covered_types().len(), TaskType::ALL.len());
    assert!(context.has_no_task_example());
    assert_eq!(context.examples.len(), cfg.context.k);
    assert_eq!(context.examples.last().unwrap().reason, SelectionReason::MultiTask);
    assert!(!context.block.contains("DISCLAIMER"));

    for k in [9, 5] {
        let mut small = cfg.context.clone();
        small.k = k;
        assert!(build_context(&corpus.train, &small).examples.len() <= k);
    }
}

#[tokio::test]
async fn full_run_scores_every_pair_and_writes_reports() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let out_dir = dir.path().join("out");
    let cfg = RunConfig {
        data_dir: dir.path().to_path_buf(),
        output_dir: out_dir.clone(),
        write_predictions: true,
        ..RunConfig::default()
    };

    let corpus = load_corpus(&cfg.data_dir).await.unwrap();
    let context = build_context(&corpus.train, &cfg.context);
    let oracle = FakeLlm::new(topic_oracle);
    let calls = oracle.calls.clone();
    let backends = vec![fake_backend("oracle", oracle)];
    let (_, unavailable) = build_backends(&["apertus-hf".to_string()], &cfg, &|_: &str| None);

    let outcome = evaluate(&backends, &unavailable, &corpus.test, &context.block, &cfg, &CancellationToken::new()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(!outcome.cancelled);

    let oracle = &outcome.aggregates["oracle"];
    // test_01 has one spurious task, test_03 fails and misses its only task
    assert_eq!(oracle.mean_penalty, 0.75);
    assert_eq!(oracle.accuracy, 0.8125);
    assert_eq!(oracle.successful_calls, 3);
    assert_eq!(oracle.failed_calls, 1);
    assert_eq!(oracle.per_task_type[&TaskType::UpdateKycTotalAssets].false_positives, 1);
    assert_eq!(oracle.per_task_type[&TaskType::UpdateKycTotalAssets].false_negatives, 1);
    assert!(oracle.total_cost_usd > 0.0);

    let failed = outcome.predictions.iter().find(|p| p.transcript_id == "test_03").unwrap();
    assert_eq!(failed.failure, Some(FailureKind::BackendCall));
    let sentinel = outcome.scores.iter().find(|s| s.transcript_id == "test_03").unwrap();
    assert!(sentinel.prediction_failed);

    let hf = &outcome.aggregates["apertus-hf"];
    assert!(!hf.available);
    assert_eq!(hf.successful_calls, 0);

    write_report(&cfg.output_dir, &outcome, cfg.write_predictions).await.unwrap();
    for name in [RESULTS_FILE, REPORT_FILE, CHART_FILE, PREDICTIONS_FILE] {
        assert!(out_dir.join(name).exists(), "{name} missing");
    }

    let results: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out_dir.join(RESULTS_FILE)).unwrap()).unwrap();
    assert_eq!(results["oracle"]["mean_penalty"], 0.75);
    assert_eq!(results["apertus-hf"]["successful_calls"], 0);

    let report = std::fs::read_to_string(out_dir.join(REPORT_FILE)).unwrap();
    assert!(report.contains("oracle (BEST)"));
    assert!(report.contains("apertus-hf: unavailable"));

    let lines = std::fs::read_to_string(out_dir.join(PREDICTIONS_FILE)).unwrap();
    assert_eq!(lines.lines().count(), 4);
}

#[tokio::test]
async fn duplicate_predictions_cost_nothing_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    support::write_example(dir.path(), "test", "dup", "Client: I moved.", &["update_contact_info_postal_address"]);
    let corpus = load_corpus(dir.path()).await.unwrap();

    let echo_twice = FakeLlm::new(|_| {
        Ok(r#"[{"task_type": "update_contact_info_postal_address"}, {"task_type": "update_contact_info_postal_address"}]"#
            .to_string())
    });
    let cfg = RunConfig::default();
    let outcome = evaluate(
        &[fake_backend("dup", echo_twice)],
        &[],
        &corpus.test,
        "",
        &cfg,
        &CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome.scores[0].penalty, 0.0);
    assert_eq!(outcome.aggregates["dup"].duplicates_removed, 1);
}
