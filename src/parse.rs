//! Recovery of structured task lists from free-form model output.
//!
//! Models wrap their JSON in prose, code fences, or both. The scanner walks the
//! text once per candidate, tracking bracket nesting and string literals, and
//! hands every balanced span to `serde_json` until one decodes into an
//! acceptable shape.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::types::{TaskAssertion, TaskType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("empty response")]
    Empty,
    #[error("no balanced JSON structure found")]
    NoStructure,
    #[error("balanced span did not decode: {0}")]
    Malformed(String),
    #[error("decoded JSON is not a task list")]
    WrongShape,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTasks {
    pub tasks: Vec<TaskAssertion>,
    /// List items that were neither a known task label nor a task object.
    pub malformed_items: usize,
}

#[derive(Debug, Clone, Copy)]
enum ScanState {
    Seeking,
    Nested,
    InString { escaped: bool },
}

/// Finds the first balanced `[...]` or `{...}` span starting at or after `from`.
fn next_balanced_span(text: &str, mut from: usize) -> Option<(usize, usize)> {
    'candidate: loop {
        let mut state = ScanState::Seeking;
        let mut closers: Vec<char> = Vec::new();
        let mut start = from;

        for (i, c) in text.get(from..)?.char_indices().map(|(i, c)| (i + from, c)) {
            state = match (state, c) {
                (ScanState::Seeking, '[') | (ScanState::Seeking, '{') => {
                    start = i;
                    closers.push(if c == '[' { ']' } else { '}' });
                    ScanState::Nested
                }
                (ScanState::Seeking, _) => ScanState::Seeking,
                (ScanState::InString { escaped: true }, _) => ScanState::InString { escaped: false },
                (ScanState::InString { escaped: false }, '\\') => ScanState::InString { escaped: true },
                (ScanState::InString { escaped: false }, '"') => ScanState::Nested,
                (ScanState::InString { .. }, _) => ScanState::InString { escaped: false },
                (ScanState::Nested, '"') => ScanState::InString { escaped: false },
                (ScanState::Nested, '[') => {
                    closers.push(']');
                    ScanState::Nested
                }
                (ScanState::Nested, '{') => {
                    closers.push('}');
                    ScanState::Nested
                }
                (ScanState::Nested, ']') | (ScanState::Nested, '}') => {
                    if closers.pop() != Some(c) {
                        // Mismatched closer: abandon this candidate and rescan after its opener.
                        from = start + 1;
                        continue 'candidate;
                    }
                    if closers.is_empty() {
                        return Some((start, i + c.len_utf8()));
                    }
                    ScanState::Nested
                }
                (ScanState::Nested, _) => ScanState::Nested,
            };
        }
        return None;
    }
}

/// Extracts the first well-formed task list from a raw model response.
///
/// A list whose items are all unrecognised (a bracketed citation such as `[1]`)
/// is only kept as a fallback; scanning continues for a list that yields a task.
pub fn parse_task_response(raw: &str) -> Result<ParsedTasks, ParseFailure> {
    if raw.trim().is_empty() {
        return Err(ParseFailure::Empty);
    }

    let mut from = 0;
    let mut last = ParseFailure::NoStructure;
    let mut fallback: Option<ParsedTasks> = None;
    while let Some((start, end)) = next_balanced_span(raw, from) {
        match serde_json::from_str::<Value>(&raw[start..end]) {
            Ok(value) => match task_items(&value) {
                Some(items) => {
                    let parsed = assertions_from_items(items);
                    if !parsed.tasks.is_empty() || parsed.malformed_items == 0 {
                        return Ok(parsed);
                    }
                    fallback.get_or_insert(parsed);
                }
                None => last = ParseFailure::WrongShape,
            },
            Err(e) => last = ParseFailure::Malformed(e.to_string()),
        }
        from = start + 1;
    }
    fallback.ok_or(last)
}

/// The list of task items a decoded value stands for, if it has a usable shape.
fn task_items(value: &Value) -> Option<Vec<&Value>> {
    match value {
        Value::Array(items) => Some(items.iter().collect()),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map
                .iter()
                .find(|(k, _)| normalize_key(k) == "tasks")
                .map(|(_, v)| v)
            {
                return Some(items.iter().collect());
            }
            if map.keys().any(|k| is_task_type_key(k)) {
                return Some(vec![value]);
            }
            None
        }
        _ => None,
    }
}

pub(crate) fn assertions_from_items<'a>(items: impl IntoIterator<Item = &'a Value>) -> ParsedTasks {
    let mut tasks = Vec::new();
    let mut malformed_items = 0;
    for item in items {
        match assertion_from_value(item) {
            Some(task) => tasks.push(task),
            None => malformed_items += 1,
        }
    }
    ParsedTasks { tasks, malformed_items }
}

/// Accepts a bare label (`"plan_contact"`) or an object carrying a task-type key.
/// Parameters come from a nested `parameters` object plus any remaining keys.
pub fn assertion_from_value(value: &Value) -> Option<TaskAssertion> {
    match value {
        Value::String(label) => label.parse::<TaskType>().ok().map(TaskAssertion::new),
        Value::Object(map) => {
            let (type_key, task_type) = map
                .iter()
                .filter(|(k, _)| is_task_type_key(k))
                .find_map(|(k, v)| {
                    let parsed = v.as_str()?.parse::<TaskType>().ok()?;
                    Some((k, parsed))
                })?;

            let mut parameters = BTreeMap::new();
            for (key, v) in map {
                if key == type_key {
                    continue;
                }
                match (normalize_key(key).as_str(), v) {
                    ("parameters" | "params", Value::Object(nested)) => {
                        for (pk, pv) in nested {
                            parameters.insert(snake_case(pk), pv.clone());
                        }
                    }
                    ("parameters" | "params", Value::Null) => {}
                    _ => {
                        parameters.entry(snake_case(key)).or_insert_with(|| v.clone());
                    }
                }
            }
            Some(TaskAssertion { task_type, parameters })
        }
        _ => None,
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn is_task_type_key(key: &str) -> bool {
    matches!(normalize_key(key).as_str(), "tasktype" | "type" | "task")
}

/// `newAddress`, `New Address` and `new-address` all become `new_address`.
fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.trim().chars() {
        if c == ' ' || c == '-' || c == '_' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        } else if c.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

/// The structured form models are asked to produce; also used for few-shot examples.
pub fn render_tasks(tasks: &[TaskAssertion]) -> String {
    serde_json::to_string(tasks).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_response_round_trips() {
        let tasks = vec![
            TaskAssertion::new(TaskType::ScheduleMeeting).with_param("date", "2025-03-14"),
            TaskAssertion::new(TaskType::UpdateKycTotalAssets).with_param("amount", 1_500_000),
            TaskAssertion::new(TaskType::PlanContact),
        ];
        let parsed = parse_task_response(&render_tasks(&tasks)).unwrap();
        assert_eq!(parsed.tasks, tasks);
        assert_eq!(parsed.malformed_items, 0);
    }

    #[test]
    fn finds_json_inside_prose_and_fences() {
        let raw = "Sure! Here are the tasks:\n```json\n[\"plan_contact\", \"schedule_meeting\"]\n```\nLet me know.";
        let parsed = parse_task_response(raw).unwrap();
        let types: Vec<_> = parsed.tasks.iter().map(|t| t.task_type).collect();
        assert_eq!(types, vec![TaskType::PlanContact, TaskType::ScheduleMeeting]);
    }

    #[test]
    fn skips_unparseable_brackets_before_payload() {
        let raw = "[note: client was unsure] result: [{\"Task_Type\": \"update_kyc_activity\"}]";
        let parsed = parse_task_response(raw).unwrap();
        assert_eq!(parsed.tasks, vec![TaskAssertion::new(TaskType::UpdateKycActivity)]);
    }

    #[test]
    fn citation_brackets_do_not_hide_the_task_list() {
        let raw = "Per point [1] of the call, the tasks are: [\"plan_contact\"]";
        let parsed = parse_task_response(raw).unwrap();
        assert_eq!(parsed.tasks, vec![TaskAssertion::new(TaskType::PlanContact)]);
        assert_eq!(parsed.malformed_items, 0);
    }

    #[test]
    fn list_of_unknown_items_is_kept_when_nothing_better_follows() {
        let parsed = parse_task_response("See [1] and [2].").unwrap();
        assert!(parsed.tasks.is_empty());
        assert_eq!(parsed.malformed_items, 1);
    }

    #[test]
    fn brackets_inside_strings_do_not_close_spans() {
        let raw = r#"[{"task_type": "schedule_meeting", "parameters": {"note": "call back ] soon"}}]"#;
        let parsed = parse_task_response(raw).unwrap();
        assert_eq!(parsed.tasks[0].parameters["note"], "call back ] soon");
    }

    #[test]
    fn inconsistent_keys_are_normalized() {
        let raw = r#"{"Tasks": [{"taskType": "Update Contact Info Postal Address", "newAddress": "Via Roma 1"}]}"#;
        let parsed = parse_task_response(raw).unwrap();
        assert_eq!(parsed.tasks[0].task_type, TaskType::UpdateContactInfoPostalAddress);
        assert_eq!(parsed.tasks[0].parameters["new_address"], "Via Roma 1");
    }

    #[test]
    fn unknown_labels_count_as_malformed() {
        let parsed = parse_task_response(r#"["plan_contact", "open_account", 42]"#).unwrap();
        assert_eq!(parsed.tasks.len(), 1);
        assert_eq!(parsed.malformed_items, 2);
    }

    #[test]
    fn empty_list_is_a_successful_parse() {
        let parsed = parse_task_response("No tasks were found: []").unwrap();
        assert!(parsed.tasks.is_empty());
    }

    #[test]
    fn failures_are_enumerated() {
        assert_eq!(parse_task_response("   "), Err(ParseFailure::Empty));
        assert_eq!(parse_task_response("no structure here"), Err(ParseFailure::NoStructure));
        assert_eq!(parse_task_response(r#"{"answer": 3}"#), Err(ParseFailure::WrongShape));
        assert!(matches!(
            parse_task_response("[plan_contact, schedule_meeting]"),
            Err(ParseFailure::Malformed(_))
        ));
    }

    #[test]
    fn mismatched_closer_rescans() {
        let raw = "{ broken ] then [\"plan_contact\"]";
        let parsed = parse_task_response(raw).unwrap();
        assert_eq!(parsed.tasks, vec![TaskAssertion::new(TaskType::PlanContact)]);
    }

    #[test]
    fn many_mismatched_closers_are_scanned_iteratively() {
        let raw = format!("{}[\"schedule_meeting\"]", "{]".repeat(50_000));
        let parsed = parse_task_response(&raw).unwrap();
        assert_eq!(parsed.tasks, vec![TaskAssertion::new(TaskType::ScheduleMeeting)]);
    }
}
