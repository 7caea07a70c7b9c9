//! Run configuration.
//!
//! One immutable [`RunConfig`] is loaded at startup (optionally from TOML) and
//! threaded by reference into the context selector, the backends, the scorer
//! and the orchestrator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};
use crate::extraction::CostModel;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub scoring: ScoringConfig,
    pub context: ContextConfig,
    pub backend: BackendConfig,
    /// Per-backend price overrides keyed by backend name.
    pub pricing: BTreeMap<String, CostModel>,
    /// Cap on the number of test transcripts, for fast iteration.
    pub test_subset: Option<usize>,
    pub use_context: bool,
    pub write_predictions: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/ubs_synthetic_call_transcripts_dataset"),
            output_dir: PathBuf::from("analysis_results"),
            scoring: ScoringConfig::default(),
            context: ContextConfig::default(),
            backend: BackendConfig::default(),
            pricing: BTreeMap::new(),
            test_subset: None,
            use_context: true,
            write_predictions: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub fn_weight: f64,
    pub fp_weight: f64,
    /// Mean penalty at which the accuracy-like score reaches zero.
    pub normalization: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            fn_weight: 2.0,
            fp_weight: 1.0,
            normalization: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Example budget for the few-shot block.
    pub k: usize,
    pub max_example_chars: usize,
    pub fill_remaining: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            k: 10,
            max_example_chars: 500,
            fill_remaining: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub max_parallel: usize,
    pub timeout_secs: u64,
    pub requests_per_second: u32,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            timeout_secs: 60,
            requests_per_second: 2,
            temperature: 0.1,
            max_tokens: 500,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RunConfig {
    /// Reads `path` when given, defaults otherwise. The result is validated.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = tokio::fs::read_to_string(path).await?;
                toml::from_str(&content)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.scoring.fn_weight <= 0.0 {
            errors.push("scoring.fn_weight must be positive");
        }
        if self.scoring.fp_weight <= 0.0 {
            errors.push("scoring.fp_weight must be positive");
        }
        if self.scoring.normalization <= 0.0 {
            errors.push("scoring.normalization must be positive");
        }
        if self.context.k == 0 {
            errors.push("context.k must be greater than 0");
        }
        if self.backend.max_parallel == 0 {
            errors.push("backend.max_parallel must be greater than 0");
        }
        if self.backend.timeout_secs == 0 {
            errors.push("backend.timeout_secs must be greater than 0");
        }
        if self.backend.requests_per_second == 0 {
            errors.push("backend.requests_per_second must be greater than 0");
        }
        if self.test_subset == Some(0) {
            errors.push("test_subset must be greater than 0 when set");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Configuration(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_rubric() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.scoring.fn_weight, 2.0);
        assert_eq!(cfg.scoring.fp_weight, 1.0);
        assert_eq!(cfg.context.k, 10);
        assert_eq!(cfg.backend.max_parallel, 4);
        assert_eq!(cfg.backend.timeout(), Duration::from_secs(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: RunConfig = toml::from_str(
            r#"
            test_subset = 50
            [context]
            k = 12
            "#,
        )
        .unwrap();
        assert_eq!(cfg.test_subset, Some(50));
        assert_eq!(cfg.context.k, 12);
        assert_eq!(cfg.context.max_example_chars, 500);
        assert_eq!(cfg.scoring.fn_weight, 2.0);
    }

    #[test]
    fn pricing_table_parses() {
        let cfg: RunConfig = toml::from_str(
            r#"
            [pricing.azure-openai]
            kind = "per_token"
            input_per_1k = 0.005
            output_per_1k = 0.015

            [pricing.apertus-hf]
            kind = "per_call"
            usd = 0.001
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pricing["apertus-hf"], CostModel::PerCall { usd: 0.001 });
        assert!(matches!(cfg.pricing["azure-openai"], CostModel::PerToken { .. }));
    }

    #[test]
    fn validate_collects_every_problem() {
        let mut cfg = RunConfig::default();
        cfg.context.k = 0;
        cfg.backend.max_parallel = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("context.k"));
        assert!(err.contains("backend.max_parallel"));
    }
}
