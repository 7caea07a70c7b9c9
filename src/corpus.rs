//! Loads the labelled transcript corpus.
//!
//! Layout: `<root>/{train,validation,test}/<id>.txt` with an optional
//! `<id>.json` label file beside each transcript. A missing or empty label file
//! means the conversation carries no task.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::error::{HarnessError, Result};
use crate::parse::assertion_from_value;
use crate::types::{Split, TaskAssertion, TranscriptExample};

#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub train: Vec<TranscriptExample>,
    pub validation: Vec<TranscriptExample>,
    pub test: Vec<TranscriptExample>,
}

impl Corpus {
    pub fn split(&self, split: Split) -> &[TranscriptExample] {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }

    /// A split the run cannot proceed without; empty is fatal.
    pub fn require(&self, split: Split, root: &Path) -> Result<&[TranscriptExample]> {
        let examples = self.split(split);
        if examples.is_empty() {
            return Err(HarnessError::dataset(
                root.join(split.dir_name()),
                format!("no examples loaded for required split '{split}'"),
            ));
        }
        Ok(examples)
    }
}

pub async fn load_corpus(root: &Path) -> Result<Corpus> {
    if !tokio::fs::try_exists(root).await.unwrap_or(false) {
        return Err(HarnessError::dataset(root, "dataset root does not exist"));
    }

    let mut corpus = Corpus::default();
    for split in Split::ALL {
        let examples = match load_split(root, split).await {
            Ok(examples) => examples,
            Err(e) => {
                warn!(split = %split, error = %e, "Skipping split");
                Vec::new()
            }
        };
        match split {
            Split::Train => corpus.train = examples,
            Split::Validation => corpus.validation = examples,
            Split::Test => corpus.test = examples,
        }
    }

    info!(
        train = corpus.train.len(),
        validation = corpus.validation.len(),
        test = corpus.test.len(),
        "Loaded dataset splits"
    );
    Ok(corpus)
}

/// Loads one split in file-name order. Unreadable entries are skipped with a warning.
pub async fn load_split(root: &Path, split: Split) -> Result<Vec<TranscriptExample>> {
    let dir = root.join(split.dir_name());
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| HarnessError::dataset(&dir, format!("cannot read split directory: {e}")))?;

    let mut transcripts: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut labels: BTreeMap<String, PathBuf> = BTreeMap::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        match path.extension().and_then(|e| e.to_str()) {
            Some("txt") => {
                transcripts.insert(stem, path);
            }
            Some("json") => {
                labels.insert(stem, path);
            }
            _ => {}
        }
    }

    for (stem, path) in &labels {
        if !transcripts.contains_key(stem) {
            warn!(path = %path.display(), "Label file has no transcript");
        }
    }

    let mut examples = Vec::with_capacity(transcripts.len());
    for (id, path) in transcripts {
        match load_example(&id, &path, labels.get(&id).map(PathBuf::as_path), split).await {
            Ok(example) => examples.push(example),
            Err(e) => warn!(transcript_id = %id, error = %e, "Skipping example"),
        }
    }
    Ok(examples)
}

async fn load_example(
    id: &str,
    transcript: &Path,
    label: Option<&Path>,
    split: Split,
) -> Result<TranscriptExample> {
    let bytes = tokio::fs::read(transcript).await?;
    let text = String::from_utf8(bytes)
        .map_err(|_| HarnessError::dataset(transcript, "transcript is not valid UTF-8"))?;

    let tasks = match label {
        Some(path) => {
            let content = tokio::fs::read_to_string(path).await?;
            parse_label_file(&content).map_err(|e| HarnessError::dataset(path, e.to_string()))?
        }
        None => Vec::new(),
    };
    Ok(TranscriptExample::new(id, text, split, tasks))
}

/// Parses a label file body. Blank content is the "no task" case; entries naming
/// an unknown task type are dropped with a warning.
pub fn parse_label_file(content: &str) -> Result<Vec<TaskAssertion>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(content)?;
    let items = match &value {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        Value::Object(map) => match map.get("tasks") {
            Some(Value::Array(items)) => items.iter().collect(),
            _ => vec![&value],
        },
        Value::Null => Vec::new(),
        other => {
            return Err(HarnessError::Parse(format!("unexpected label payload: {other}")));
        }
    };

    let mut tasks = Vec::with_capacity(items.len());
    for item in items {
        match assertion_from_value(item) {
            Some(task) => tasks.push(task),
            None => warn!(item = %item, "Dropping label with unknown task type"),
        }
    }
    Ok(tasks)
}
