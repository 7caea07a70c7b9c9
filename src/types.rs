use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// The closed set of actionable outcomes an advisor can take from a call.
/// Declaration order is the canonical order used by context selection and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PlanContact,
    ScheduleMeeting,
    UpdateContactInfoNonPostal,
    UpdateContactInfoPostalAddress,
    UpdateKycActivity,
    UpdateKycOriginOfAssets,
    UpdateKycPurposeOfBusinessrelation,
    UpdateKycTotalAssets,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        TaskType::PlanContact,
        TaskType::ScheduleMeeting,
        TaskType::UpdateContactInfoNonPostal,
        TaskType::UpdateContactInfoPostalAddress,
        TaskType::UpdateKycActivity,
        TaskType::UpdateKycOriginOfAssets,
        TaskType::UpdateKycPurposeOfBusinessrelation,
        TaskType::UpdateKycTotalAssets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::PlanContact => "plan_contact",
            TaskType::ScheduleMeeting => "schedule_meeting",
            TaskType::UpdateContactInfoNonPostal => "update_contact_info_non_postal",
            TaskType::UpdateContactInfoPostalAddress => "update_contact_info_postal_address",
            TaskType::UpdateKycActivity => "update_kyc_activity",
            TaskType::UpdateKycOriginOfAssets => "update_kyc_origin_of_assets",
            TaskType::UpdateKycPurposeOfBusinessrelation => "update_kyc_purpose_of_businessrelation",
            TaskType::UpdateKycTotalAssets => "update_kyc_total_assets",
        }
    }

    /// One-line meaning shown to the models in the instruction preamble.
    pub fn description(&self) -> &'static str {
        match self {
            TaskType::PlanContact => {
                "Planning future contact or communication (no specific time is set, might only be a date)"
            }
            TaskType::ScheduleMeeting => "Scheduling meetings or appointments",
            TaskType::UpdateContactInfoNonPostal => {
                "Updating email, phone, or other non-address contact info"
            }
            TaskType::UpdateContactInfoPostalAddress => "Updating postal/mailing address",
            TaskType::UpdateKycActivity => "Updating Know Your Customer activity information",
            TaskType::UpdateKycOriginOfAssets => "Updating information about origin of assets",
            TaskType::UpdateKycPurposeOfBusinessrelation => {
                "Updating purpose of business relationship"
            }
            TaskType::UpdateKycTotalAssets => "Updating total assets information",
        }
    }

    pub fn category(&self) -> TaskCategory {
        match self {
            TaskType::PlanContact | TaskType::ScheduleMeeting => TaskCategory::Scheduling,
            TaskType::UpdateContactInfoNonPostal | TaskType::UpdateContactInfoPostalAddress => {
                TaskCategory::ContactInfo
            }
            _ => TaskCategory::Kyc,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = HarnessError;

    /// Accepts the canonical label in any casing, with spaces or hyphens in
    /// place of underscores.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| HarnessError::Parse(format!("unknown task type: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Scheduling,
    ContactInfo,
    Kyc,
}

/// One expected or predicted task. Parameters are kept verbatim; the scorer only
/// looks at them to choose between same-typed candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssertion {
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl TaskAssertion {
    pub fn new(task_type: TaskType) -> Self {
        Self { task_type, parameters: BTreeMap::new() }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Stable textual key; equal assertions produce equal keys.
    pub fn canonical_key(&self) -> String {
        let params = serde_json::to_string(&self.parameters).unwrap_or_default();
        format!("{}{}", self.task_type.as_str(), params)
    }
}

/// Collapses structurally identical assertions and sorts the survivors by
/// canonical key. Returns the survivors and how many duplicates were dropped.
pub fn dedup_assertions(tasks: Vec<TaskAssertion>) -> (Vec<TaskAssertion>, usize) {
    let before = tasks.len();
    let mut keyed: BTreeMap<String, TaskAssertion> = BTreeMap::new();
    for task in tasks {
        keyed.entry(task.canonical_key()).or_insert(task);
    }
    let out: Vec<_> = keyed.into_values().collect();
    let removed = before - out.len();
    (out, removed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Test];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptExample {
    pub id: String,
    pub text: String,
    pub split: Split,
    pub expected_tasks: Vec<TaskAssertion>,
}

impl TranscriptExample {
    /// Expected tasks are de-duplicated on construction.
    pub fn new(id: impl Into<String>, text: impl Into<String>, split: Split, tasks: Vec<TaskAssertion>) -> Self {
        let (expected_tasks, _) = dedup_assertions(tasks);
        Self { id: id.into(), text: text.into(), split, expected_tasks }
    }

    pub fn task_types(&self) -> BTreeSet<TaskType> {
        self.expected_tasks.iter().map(|t| t.task_type).collect()
    }

    pub fn is_no_task(&self) -> bool {
        self.expected_tasks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BackendCall,
    Timeout,
    Parse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub transcript_id: String,
    pub model_name: String,
    pub predicted_tasks: Vec<TaskAssertion>,
    pub raw_response: String,
    pub latency_seconds: f64,
    pub parse_succeeded: bool,
    pub failure: Option<FailureKind>,
    /// Items in an otherwise valid payload that named no known task type.
    pub malformed_items: usize,
    pub usage: Option<TokenUsage>,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub transcript_id: String,
    pub model_name: String,
    pub penalty: f64,
    pub false_negatives: Vec<TaskAssertion>,
    pub false_positives: Vec<TaskAssertion>,
    pub matched: Vec<(TaskAssertion, TaskAssertion)>,
    pub duplicates_removed: usize,
    /// Set when the prediction behind this record failed.
    pub prediction_failed: bool,
}

impl ScoreRecord {
    pub fn true_positives(&self) -> usize {
        self.matched.len()
    }
}
