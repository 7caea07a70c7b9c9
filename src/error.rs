use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Dataset error at {path}: {message}")]
    Dataset { path: PathBuf, message: String },

    #[error("Backend call failed for {model}: {message}")]
    BackendCall { model: String, message: String },

    #[error("Backend {model} timed out after {secs}s")]
    Timeout { model: String, secs: u64 },

    #[error("Could not parse response: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl HarnessError {
    pub fn dataset(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Dataset {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn backend(model: impl Into<String>, message: impl ToString) -> Self {
        Self::BackendCall {
            model: model.into(),
            message: message.to_string(),
        }
    }

    /// Errors the evaluation loop absorbs into a failed record instead of
    /// aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Dataset { .. } | Self::BackendCall { .. } | Self::Timeout { .. } | Self::Parse(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
