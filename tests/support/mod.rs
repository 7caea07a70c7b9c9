#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskscore_rs::extraction::{Backend, CostModel, Prompt};
use taskscore_rs::llm::{BackendKind, Completion, Llm};
use taskscore_rs::{HarnessError, Result};

pub type Handler = Box<dyn Fn(&Prompt) -> Result<String> + Send + Sync>;

pub struct FakeLlm {
    // maps each prompt to the raw model text
    pub handler: Handler,
    pub delay_ms: u64,
    pub calls: Arc<AtomicUsize>,
}

impl FakeLlm {
    pub fn new(handler: impl Fn(&Prompt) -> Result<String> + Send + Sync + 'static) -> Self {
        Self { handler: Box::new(handler), delay_ms: 0, calls: Arc::new(AtomicUsize::new(0)) }
    }
}

#[async_trait]
impl Llm for FakeLlm {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        (self.handler)(prompt).map(Completion::text)
    }
}

/// Reads the labels listed after `Topics:` in the transcript part of the prompt.
pub fn topic_oracle(prompt: &Prompt) -> Result<String> {
    if prompt.user.contains("unreachable") {
        return Err(HarnessError::backend("oracle", "503 Service Unavailable"));
    }
    let labels: Vec<String> = prompt
        .user
        .lines()
        .find_map(|l| l.strip_prefix("Topics:"))
        .map(|rest| rest.split_whitespace().map(|t| format!(r#"{{"task_type": "{t}"}}"#)).collect())
        .unwrap_or_default();
    Ok(format!("Sure, here are the tasks:\n```json\n[{}]\n```", labels.join(", ")))
}

pub fn fake_backend(name: &str, llm: FakeLlm) -> Backend {
    Backend::new(
        name,
        BackendKind::AzureOpenAi,
        Arc::new(llm),
        CostModel::PerToken { input_per_1k: 0.0025, output_per_1k: 0.01 },
        4,
        Duration::from_secs(5),
    )
}

pub fn write_example(root: &Path, split: &str, id: &str, transcript: &str, labels: &[&str]) {
    let dir = root.join(split);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{id}.txt")), transcript).unwrap();
    let body: Vec<_> = labels.iter().map(|l| serde_json::json!({ "task_type": l })).collect();
    std::fs::write(dir.join(format!("{id}.json")), serde_json::to_string(&body).unwrap()).unwrap();
}

pub const ALL_LABELS: [&str; 8] = [
    "plan_contact",
    "schedule_meeting",
    "update_contact_info_non_postal",
    "update_contact_info_postal_address",
    "update_kyc_activity",
    "update_kyc_origin_of_assets",
    "update_kyc_purpose_of_businessrelation",
    "update_kyc_total_assets",
];

/// A small dataset: one training example per label, a no-task call, two
/// multi-task calls, and a test split whose transcripts name their own topics.
pub fn write_dataset(root: &Path) {
    for (i, label) in ALL_LABELS.iter().enumerate() {
        let text = format!("DISCLAIMER: synthetic.\nAdvisor: Hello.\nClient: Please handle {label}.");
        write_example(root, "train", &format!("train_{i:02}"), &text, &[label]);
    }
    write_example(root, "train", "train_20", "Advisor: How are you?\nClient: Fine, thanks.", &[]);
    write_example(
        root,
        "train",
        "train_21",
        "Advisor: Let's meet and update your address.",
        &["schedule_meeting", "update_contact_info_postal_address"],
    );
    write_example(
        root,
        "train",
        "train_22",
        "Advisor: I'll call you next week, and I need your new phone number and details on your job.",
        &["plan_contact", "update_contact_info_non_postal", "update_kyc_activity"],
    );

    write_example(root, "validation", "val_00", "Advisor: Hi.", &[]);

    write_example(root, "test", "test_00", "Topics: schedule_meeting\nAdvisor: See you Tuesday.", &["schedule_meeting"]);
    write_example(
        root,
        "test",
        "test_01",
        "Topics: plan_contact update_kyc_total_assets\nAdvisor: I'll call you.",
        &["plan_contact"],
    );
    write_example(root, "test", "test_02", "Topics:\nAdvisor: Goodbye.", &[]);
    write_example(
        root,
        "test",
        "test_03",
        "Topics: unreachable\nClient: My assets grew.",
        &["update_kyc_total_assets"],
    );
}
