pub mod config;
pub mod context;
pub mod corpus;
pub mod error;
pub mod evaluate;
pub mod extraction;
pub mod llm;
pub mod parse;
pub mod report;
pub mod scoring;
pub mod segments;
pub mod server;
pub mod tasks;
pub mod types;

pub use config::RunConfig;
pub use error::{HarnessError, Result};
pub use evaluate::{evaluate, CancellationToken, EvaluationOutcome, ModelAggregate};
pub use extraction::{Backend, CostModel, Prompt};
pub use scoring::{score_prediction, score_tasks};
pub use types::{PredictionRecord, ScoreRecord, Split, TaskAssertion, TaskType, TranscriptExample};
