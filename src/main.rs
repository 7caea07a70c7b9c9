use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use taskscore_rs::context::build_context;
use taskscore_rs::corpus::{load_corpus, parse_label_file};
use taskscore_rs::llm::registry::build_backends;
use taskscore_rs::report::{ranking, write_report};
use taskscore_rs::scoring::{challenge_score, score_tasks};
use taskscore_rs::server::{run_server, Engine};
use taskscore_rs::*;

#[derive(Parser)]
#[command(name = "taskscore", version, about = "Score LLM task extraction on client-call transcripts")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
    /// TOML run configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct DataArgs {
    /// Dataset root holding train/, validation/ and test/
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Args)]
struct ModelArgs {
    /// Backends to run
    #[arg(long, value_delimiter = ',', default_value = "azure-openai,apertus-hf,apertus-swisscom")]
    models: Vec<String>,
    /// Send no few-shot examples
    #[arg(long)]
    no_context: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run every backend over the test split and write the report files
    Evaluate {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        models: ModelArgs,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Only evaluate the first N test transcripts
        #[arg(long)]
        test_subset: Option<usize>,
        /// Also write predictions.jsonl
        #[arg(long)]
        write_predictions: bool,
    },
    /// Print the few-shot context block built from the training split
    Context {
        #[command(flatten)]
        data: DataArgs,
    },
    /// Score one predicted label file against an expected one
    Score {
        #[arg(long)]
        expected: PathBuf,
        #[arg(long)]
        predicted: PathBuf,
    },
    /// Serve task extraction over HTTP
    Serve {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        models: ModelArgs,
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("taskscore_rs={level},taskscore={level}")));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

async fn context_block(cfg: &RunConfig, data_dir: &Path) -> Result<String> {
    if !cfg.use_context {
        return Ok(String::new());
    }
    let corpus = load_corpus(data_dir).await?;
    let train = corpus.require(Split::Train, data_dir)?;
    Ok(build_context(train, &cfg.context).block)
}

async fn run_evaluate(cfg: RunConfig, models: &[String]) -> Result<()> {
    let corpus = load_corpus(&cfg.data_dir).await?;
    let test = corpus.require(Split::Test, &cfg.data_dir)?;
    let block = if cfg.use_context {
        build_context(corpus.require(Split::Train, &cfg.data_dir)?, &cfg.context).block
    } else {
        String::new()
    };

    let (backends, unavailable) = build_backends(models, &cfg, &env_var);
    if backends.is_empty() {
        warn!("No backend could be configured; the report will list every model as unavailable");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, no new transcripts will be dispatched");
            on_signal.cancel();
        }
    });

    let outcome = evaluate(&backends, &unavailable, test, &block, &cfg, &cancel).await;
    let written = write_report(&cfg.output_dir, &outcome, cfg.write_predictions)
        .await
        .with_context(|| format!("writing report to {}", cfg.output_dir.display()))?;

    for a in ranking(&outcome.aggregates) {
        println!(
            "{:<20} penalty {:>6.3}  accuracy {:>5.1}%  challenge {:.4}",
            a.model,
            a.mean_penalty,
            a.accuracy * 100.0,
            a.challenge_score
        );
    }
    info!(files = written.files.len(), elapsed_secs = outcome.elapsed_seconds, "Evaluation complete");
    Ok(())
}

async fn run_score(expected: &Path, predicted: &Path, cfg: &RunConfig) -> Result<()> {
    let read = |path: &Path| {
        let path = path.to_path_buf();
        async move {
            let content = tokio::fs::read_to_string(&path).await.with_context(|| format!("reading {}", path.display()))?;
            parse_label_file(&content).with_context(|| format!("parsing {}", path.display()))
        }
    };
    let expected = read(expected).await?;
    let predicted = read(predicted).await?;
    let s = score_tasks(&expected, &predicted, &cfg.scoring);
    let out = serde_json::json!({
        "penalty": s.penalty,
        "false_negatives": s.false_negatives,
        "false_positives": s.false_positives,
        "matched": s.matched.len(),
        "duplicates_removed": s.duplicates_removed,
        "challenge_score": challenge_score(&expected, &predicted, &cfg.scoring),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let mut cfg = RunConfig::load(cli.config.as_deref()).await?;

    match cli.cmd {
        Cmd::Evaluate { data, models, output_dir, test_subset, write_predictions } => {
            if let Some(dir) = data.data_dir {
                cfg.data_dir = dir;
            }
            if let Some(dir) = output_dir {
                cfg.output_dir = dir;
            }
            if test_subset.is_some() {
                cfg.test_subset = test_subset;
            }
            cfg.use_context &= !models.no_context;
            cfg.write_predictions |= write_predictions;
            cfg.validate()?;
            run_evaluate(cfg, &models.models).await
        }
        Cmd::Context { data } => {
            let dir = data.data_dir.unwrap_or_else(|| cfg.data_dir.clone());
            cfg.use_context = true;
            println!("{}", context_block(&cfg, &dir).await?);
            Ok(())
        }
        Cmd::Score { expected, predicted } => run_score(&expected, &predicted, &cfg).await,
        Cmd::Serve { data, models, addr } => {
            let dir = data.data_dir.unwrap_or_else(|| cfg.data_dir.clone());
            cfg.use_context &= !models.no_context;
            let block = context_block(&cfg, &dir).await?;
            let (backends, unavailable) = build_backends(&models.models, &cfg, &env_var);
            for u in &unavailable {
                warn!(model = %u.name, reason = %u.reason, "Not serving backend");
            }
            let engine = Engine::new(backends, block)?;
            run_server(engine, &addr, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
        }
    }
}
