//! Display records for extracted tasks, consumed by the review dashboard.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::BackendKind;
use crate::segments::best_matching_sentence;
use crate::types::{TaskAssertion, TaskCategory, TaskType};

const DEFAULT_OWNER: &str = "client_advisor";
const DATE_KEYS: [&str; 4] = ["due_date", "date", "deadline", "meeting_date"];
const OWNER_KEYS: [&str; 2] = ["owner", "assigned_to"];
/// Confidence when no transcript sentence supports the task.
const UNSUPPORTED_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub description: String,
    pub owner: String,
    pub due_date: Option<NaiveDate>,
    pub status: TaskStatus,
    pub confidence_score: f64,
    pub evidence_quote: Option<String>,
    pub category: TaskCategory,
    pub source_meeting_id: String,
}

fn keywords(task_type: TaskType) -> &'static [&'static str] {
    match task_type {
        TaskType::PlanContact => &["call", "contact", "reach", "get back", "anrufen", "melden", "rappeler", "richiamare"],
        TaskType::ScheduleMeeting => &["meeting", "appointment", "meet", "termin", "treffen", "rendez-vous", "appuntamento"],
        TaskType::UpdateContactInfoNonPostal => &["email", "e-mail", "phone", "number", "telefon", "téléphone", "telefono"],
        TaskType::UpdateContactInfoPostalAddress => &["address", "moved", "moving", "adresse", "umzug", "indirizzo", "déménag"],
        TaskType::UpdateKycActivity => &["work", "job", "employ", "profession", "business", "beruf", "métier", "lavoro"],
        TaskType::UpdateKycOriginOfAssets => &["inherit", "origin", "sale", "sold", "erbschaft", "héritage", "eredità"],
        TaskType::UpdateKycPurposeOfBusinessrelation => &["purpose", "invest", "saving", "retire", "zweck", "but", "scopo"],
        TaskType::UpdateKycTotalAssets => &["assets", "wealth", "million", "portfolio", "vermögen", "patrimoine", "patrimonio"],
    }
}

fn string_params(task: &TaskAssertion) -> impl Iterator<Item = (&str, &str)> {
    task.parameters
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.as_str(), s.trim())))
        .filter(|(_, v)| !v.is_empty())
}

fn param<'a>(task: &'a TaskAssertion, keys: &[&str]) -> Option<&'a str> {
    string_params(task).find(|(k, _)| keys.contains(k)).map(|(_, v)| v)
}

fn due_date(task: &TaskAssertion) -> Option<NaiveDate> {
    let raw = param(task, &DATE_KEYS)?;
    // Accept full timestamps by reading only the date part.
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

fn describe(task: &TaskAssertion) -> String {
    let details: Vec<String> = task
        .parameters
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}: {s}"),
            other => format!("{k}: {other}"),
        })
        .collect();
    if details.is_empty() {
        task.task_type.description().to_string()
    } else {
        format!("{} ({})", task.task_type.description(), details.join(", "))
    }
}

/// Prior confidence per provider family.
pub fn base_confidence(kind: BackendKind) -> f64 {
    match kind {
        BackendKind::AzureOpenAi => 0.80,
        BackendKind::ApertusHf | BackendKind::ApertusSwisscom => 0.85,
    }
}

/// Builds one record per task. `transcript` is searched for the sentence that
/// best supports each task.
pub fn task_records(meeting_id: &str, transcript: &str, tasks: &[TaskAssertion], kind: BackendKind) -> Vec<TaskRecord> {
    tasks
        .iter()
        .enumerate()
        .map(|(i, task)| {
            let mut terms: Vec<String> = keywords(task.task_type).iter().map(|k| k.to_string()).collect();
            terms.extend(string_params(task).map(|(_, v)| v.to_string()));
            let evidence_quote = best_matching_sentence(transcript, &terms);
            let confidence_score = if evidence_quote.is_some() { base_confidence(kind) } else { UNSUPPORTED_CONFIDENCE };

            TaskRecord {
                id: format!("{meeting_id}-{}", i + 1),
                description: describe(task),
                owner: param(task, &OWNER_KEYS).unwrap_or(DEFAULT_OWNER).to_string(),
                due_date: due_date(task),
                status: TaskStatus::Pending,
                confidence_score,
                evidence_quote,
                category: task.task_type.category(),
                source_meeting_id: meeting_id.to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = "Advisor: Good morning. Client: I moved last month, my new address is Seestrasse 12 in Zurich. \
        Advisor: Noted. Shall we meet on the 2nd of May? Client: Yes, a meeting then works.";

    #[test]
    fn records_carry_evidence_and_category() {
        let tasks = vec![
            TaskAssertion::new(TaskType::UpdateContactInfoPostalAddress).with_param("street", "Seestrasse 12"),
            TaskAssertion::new(TaskType::ScheduleMeeting).with_param("date", "2025-05-02"),
        ];
        let records = task_records("m-7", TRANSCRIPT, &tasks, BackendKind::ApertusHf);
        assert_eq!(records.len(), 2);

        let address = &records[0];
        assert_eq!(address.id, "m-7-1");
        assert_eq!(address.category, TaskCategory::ContactInfo);
        assert!(address.evidence_quote.as_deref().unwrap().contains("Seestrasse 12"));
        assert_eq!(address.confidence_score, 0.85);
        assert_eq!(address.status, TaskStatus::Pending);
        assert_eq!(address.owner, "client_advisor");

        let meeting = &records[1];
        assert_eq!(meeting.due_date, NaiveDate::from_ymd_opt(2025, 5, 2));
        assert_eq!(meeting.category, TaskCategory::Scheduling);
        assert_eq!(meeting.source_meeting_id, "m-7");
        assert!(meeting.description.starts_with("Scheduling meetings"));
    }

    #[test]
    fn unsupported_tasks_get_low_confidence() {
        let tasks = vec![TaskAssertion::new(TaskType::UpdateKycOriginOfAssets)];
        let records = task_records("m", "Advisor: Hello. Client: Goodbye.", &tasks, BackendKind::AzureOpenAi);
        assert!(records[0].evidence_quote.is_none());
        assert_eq!(records[0].confidence_score, UNSUPPORTED_CONFIDENCE);
        assert_eq!(records[0].category, TaskCategory::Kyc);
    }

    #[test]
    fn owner_and_timestamp_dates_are_read_from_parameters() {
        let task = TaskAssertion::new(TaskType::PlanContact)
            .with_param("assigned_to", "Anna Keller")
            .with_param("due_date", "2025-06-30T09:00:00Z");
        let r = &task_records("m", "", &[task], BackendKind::AzureOpenAi)[0];
        assert_eq!(r.owner, "Anna Keller");
        assert_eq!(r.due_date, NaiveDate::from_ymd_opt(2025, 6, 30));
    }
}
