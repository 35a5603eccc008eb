//! Normalized DHIS2 import responses
//!
//! DHIS2 answers imports with different shapes depending on the server
//! version: older servers return the import summary at the root, newer ones
//! nest it under `response`, and event or tracker imports carry a list of
//! `importSummaries`. [`ImportResult::from_response`] folds all of them into
//! one canonical value before any handler inspects it.

use crate::domain::{ImportCount, InstanceExportError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One conflict reported by DHIS2
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// Canonical import outcome
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportResult {
    /// SUCCESS, WARNING, ERROR, OK ...; ERROR wins over everything else
    pub status: String,
    pub counts: Option<ImportCount>,
    /// Deduplicated, first-seen order
    pub descriptions: Vec<String>,
    pub conflicts: Vec<Conflict>,
    /// Uids of created or updated objects
    pub references: Vec<String>,
}

impl ImportResult {
    pub fn from_response(response: &Value) -> Self {
        let empty = Map::new();
        let outer = response.as_object().unwrap_or(&empty);
        let root = outer
            .get("response")
            .and_then(Value::as_object)
            .unwrap_or(outer);

        let summaries: Vec<&Map<String, Value>> = root
            .get("importSummaries")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_object).collect())
            .unwrap_or_default();

        let mut statuses: Vec<&str> = Vec::new();
        for object in [outer, root].into_iter().chain(summaries.iter().copied()) {
            if let Some(status) = object.get("status").and_then(Value::as_str) {
                statuses.push(status);
            }
        }
        let status = if statuses.iter().any(|s| s.eq_ignore_ascii_case("ERROR")) {
            "ERROR".to_string()
        } else {
            root.get("status")
                .or_else(|| outer.get("status"))
                .and_then(Value::as_str)
                .unwrap_or("SUCCESS")
                .to_string()
        };

        let counts = read_counts(root).or_else(|| {
            let mut total: Option<ImportCount> = None;
            for summary in &summaries {
                if let Some(count) = read_counts(summary) {
                    total.get_or_insert_with(ImportCount::default).add(&count);
                }
            }
            total
        });

        let mut conflicts = read_conflicts(root);
        let mut descriptions = Vec::new();
        let mut references = Vec::new();

        if let Some(reference) = root.get("reference").and_then(Value::as_str) {
            references.push(reference.to_string());
        }

        for summary in &summaries {
            if let Some(description) = summary.get("description").and_then(Value::as_str) {
                push_unique(&mut descriptions, description);
            }
            conflicts.extend(read_conflicts(summary));
            if let Some(reference) = summary.get("reference").and_then(Value::as_str) {
                references.push(reference.to_string());
            }
        }

        for conflict in &conflicts {
            if let Some(value) = conflict.value.as_deref() {
                push_unique(&mut descriptions, value);
            }
        }

        if descriptions.is_empty() {
            for object in [root, outer] {
                for key in ["description", "message"] {
                    if let Some(text) = object.get(key).and_then(Value::as_str) {
                        if status == "ERROR" || key == "description" {
                            push_unique(&mut descriptions, text);
                        }
                    }
                }
                if !descriptions.is_empty() {
                    break;
                }
            }
        }

        ImportResult {
            status,
            counts,
            descriptions,
            conflicts,
            references,
        }
    }

    /// ERROR status, ignored values, or any conflict
    pub fn is_error(&self) -> bool {
        self.status == "ERROR"
            || self.counts.is_some_and(|c| c.ignored > 0)
            || !self.conflicts.is_empty()
    }

    pub fn first_reference(&self) -> Option<&str> {
        self.references.first().map(String::as_str)
    }

    pub fn into_export_error(self, message: impl Into<String>) -> InstanceExportError {
        InstanceExportError::new(message, self.descriptions).with_counts(self.counts)
    }
}

fn push_unique(descriptions: &mut Vec<String>, text: &str) {
    let text = text.trim();
    if !text.is_empty() && !descriptions.iter().any(|d| d == text) {
        descriptions.push(text.to_string());
    }
}

fn read_counts(object: &Map<String, Value>) -> Option<ImportCount> {
    if let Some(count) = object.get("importCount") {
        return serde_json::from_value(count.clone()).ok();
    }

    let keys = ["imported", "updated", "ignored", "deleted"];
    if !keys.iter().any(|k| object.get(*k).is_some_and(Value::is_u64)) {
        return None;
    }
    let read = |key: &str| object.get(key).and_then(Value::as_u64).unwrap_or(0);
    Some(ImportCount {
        imported: read("imported"),
        updated: read("updated"),
        ignored: read("ignored"),
        deleted: read("deleted"),
    })
}

fn read_conflicts(object: &Map<String, Value>) -> Vec<Conflict> {
    object
        .get("conflicts")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
