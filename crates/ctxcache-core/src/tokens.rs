//! Token estimation and priority-based trimming of payloads.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::types::Payload;

/// Characters per estimated token.
const CHARS_PER_TOKEN: usize = 4;
const SUMMARY_MAX_CHARS: usize = 100;
const SUMMARY_MAX_FIELDS: usize = 5;

/// Default priorities for well-known context keys. Unknown keys get 0.
pub const DEFAULT_PRIORITIES: &[(&str, i32)] = &[
    ("currentTask", 10),
    ("recentChanges", 9),
    ("projectStructure", 8),
    ("dependencies", 7),
    ("completedTasks", 6),
    ("documentation", 5),
    ("history", 4),
    ("metadata", 3),
];

/// Estimate token count as `ceil(serialized_len / 4)`.
pub fn estimate_tokens<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_string(value)
        .map_or(0, |s| s.len())
        .div_ceil(CHARS_PER_TOKEN)
}

/// Tokens avoided by sending `reduced` instead of `full`. Never negative.
pub fn tokens_saved<R, F>(reduced: &R, full: &F) -> usize
where
    R: Serialize + ?Sized,
    F: Serialize + ?Sized,
{
    estimate_tokens(full).saturating_sub(estimate_tokens(reduced))
}

/// Priority lookup for top-level keys.
#[derive(Clone, Debug)]
pub struct PriorityTable {
    priorities: HashMap<String, i32>,
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self::new(DEFAULT_PRIORITIES.iter().map(|(k, p)| (k.to_string(), *p)))
    }
}

impl PriorityTable {
    pub fn new(entries: impl IntoIterator<Item = (String, i32)>) -> Self {
        Self {
            priorities: entries.into_iter().collect(),
        }
    }

    /// Layer `overrides` over this table.
    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = (String, i32)>) -> Self {
        self.priorities.extend(overrides);
        self
    }

    pub fn priority(&self, key: &str) -> i32 {
        self.priorities.get(key).copied().unwrap_or(0)
    }
}

/// Output of [`trim_to_budget`].
#[derive(Clone, Debug)]
pub struct TrimResult {
    pub payload: Payload,
    /// Keys whose values were replaced by reference stubs, in priority order.
    pub stubbed: Vec<String>,
    /// Estimated tokens of the values kept in full.
    pub included_tokens: usize,
}

/// Shrink `payload` to roughly `max_tokens`.
///
/// Keys are visited by descending priority (ties keep insertion order). A key
/// is kept in full while the running total is below the budget, so the last
/// kept key may overshoot it; every later key is replaced by a reference stub.
/// The result has the same keys in the same order as the input.
pub fn trim_to_budget(payload: &Payload, max_tokens: usize, table: &PriorityTable) -> TrimResult {
    let mut order: Vec<(&String, &Value)> = payload.iter().collect();
    // sort_by is stable, so equal priorities stay in insertion order
    order.sort_by(|a, b| table.priority(b.0).cmp(&table.priority(a.0)));

    let mut included_tokens = 0usize;
    let mut replacements: HashMap<&str, Value> = HashMap::new();
    let mut stubbed = Vec::new();

    for (key, value) in order {
        if included_tokens < max_tokens {
            included_tokens += estimate_tokens(value);
        } else {
            replacements.insert(key.as_str(), reference_stub(key, value));
            stubbed.push(key.clone());
        }
    }

    let payload = payload
        .iter()
        .map(|(key, value)| {
            let value = replacements
                .remove(key.as_str())
                .unwrap_or_else(|| value.clone());
            (key.clone(), value)
        })
        .collect();

    TrimResult {
        payload,
        stubbed,
        included_tokens,
    }
}

/// Placeholder left in place of a value that did not fit the budget.
pub fn reference_stub(key: &str, value: &Value) -> Value {
    json!({
        "type": "reference",
        "location": format!("context.{key}"),
        "summary": summarize(value),
    })
}

fn summarize(value: &Value) -> String {
    match value {
        Value::String(s) => s.chars().take(SUMMARY_MAX_CHARS).collect(),
        Value::Array(items) => format!("Array with {} items", items.len()),
        Value::Object(map) => {
            let fields: Vec<&str> = map.keys().take(SUMMARY_MAX_FIELDS).map(String::as_str).collect();
            format!("Object with keys: {}", fields.join(", "))
        }
        other => other.to_string().chars().take(SUMMARY_MAX_CHARS).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(v: Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn estimate_is_ceil_of_quarter_length() {
        assert_eq!(estimate_tokens(&json!(null)), 1); // "null"
        assert_eq!(estimate_tokens(&json!("abc")), 2); // "\"abc\"" = 5 chars
        assert_eq!(estimate_tokens(&json!("ab")), 1); // 4 chars
        assert_eq!(estimate_tokens(&Payload::new()), 1); // "{}"
    }

    #[test]
    fn estimate_is_monotonic_in_length() {
        let mut last = 0;
        for n in 0..50 {
            let t = estimate_tokens(&json!("x".repeat(n)));
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn tokens_saved_never_negative() {
        let small = json!("a");
        let big = json!("a".repeat(100));
        assert_eq!(tokens_saved(&big, &small), 0);
        assert!(tokens_saved(&small, &big) > 0);
    }

    #[test]
    fn high_priority_key_kept_low_priority_stubbed() {
        let p = payload(json!({
            "metadata": "y".repeat(400),
            "currentTask": "x".repeat(400),
        }));
        let result = trim_to_budget(&p, 50, &PriorityTable::default());

        assert_eq!(result.payload["currentTask"], json!("x".repeat(400)));
        assert_eq!(result.payload["metadata"]["type"], "reference");
        assert_eq!(result.payload["metadata"]["location"], "context.metadata");
        assert_eq!(result.payload["metadata"]["summary"], json!("y".repeat(100)));
        assert_eq!(result.stubbed, vec!["metadata".to_string()]);
    }

    #[test]
    fn output_keeps_every_key_in_original_order() {
        let p = payload(json!({
            "zeta": "z".repeat(200),
            "history": [1, 2, 3],
            "currentTask": "x".repeat(200),
            "documentation": {"a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 6},
        }));
        let result = trim_to_budget(&p, 10, &PriorityTable::default());
        let keys: Vec<&String> = result.payload.keys().collect();
        assert_eq!(keys, vec!["zeta", "history", "currentTask", "documentation"]);
    }

    #[test]
    fn stub_summaries_by_type() {
        let p = payload(json!({
            "currentTask": "x".repeat(200),
            "history": [1, 2, 3],
            "documentation": {"a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 6},
            "count": 42,
        }));
        let result = trim_to_budget(&p, 1, &PriorityTable::default());
        assert_eq!(result.payload["history"]["summary"], "Array with 3 items");
        assert_eq!(
            result.payload["documentation"]["summary"],
            "Object with keys: a, b, c, d, e"
        );
        assert_eq!(result.payload["count"]["summary"], "42");
    }

    #[test]
    fn everything_fits_under_large_budget() {
        let p = payload(json!({"a": 1, "currentTask": "t"}));
        let result = trim_to_budget(&p, 10_000, &PriorityTable::default());
        assert_eq!(result.payload, p);
        assert!(result.stubbed.is_empty());
    }

    #[test]
    fn zero_budget_stubs_everything() {
        let p = payload(json!({"a": 1, "b": "two"}));
        let result = trim_to_budget(&p, 0, &PriorityTable::default());
        assert_eq!(result.stubbed.len(), 2);
        assert_eq!(result.included_tokens, 0);
        assert_eq!(result.payload.len(), 2);
    }

    #[test]
    fn included_tokens_bounded_by_budget_plus_last_key() {
        let p = payload(json!({
            "currentTask": "a".repeat(120),
            "recentChanges": "b".repeat(120),
            "projectStructure": "c".repeat(120),
            "dependencies": "d".repeat(120),
        }));
        let max = 70;
        let result = trim_to_budget(&p, max, &PriorityTable::default());
        let largest = p.values().map(estimate_tokens).max().unwrap();
        assert!(result.included_tokens <= max + largest);
        assert_eq!(result.stubbed, vec!["dependencies".to_string()]);
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let p = payload(json!({
            "first": "a".repeat(40),
            "second": "b".repeat(40),
        }));
        let result = trim_to_budget(&p, 5, &PriorityTable::default());
        assert_eq!(result.stubbed, vec!["second".to_string()]);
    }

    #[test]
    fn custom_table_overrides_defaults() {
        let table = PriorityTable::new([("notes".to_string(), 50)]);
        assert_eq!(table.priority("notes"), 50);
        assert_eq!(table.priority("currentTask"), 0);
        assert_eq!(PriorityTable::default().priority("currentTask"), 10);
        assert_eq!(PriorityTable::default().priority("unknown"), 0);

        let merged = PriorityTable::default().with_overrides([("metadata".to_string(), 20)]);
        assert_eq!(merged.priority("metadata"), 20);
        assert_eq!(merged.priority("currentTask"), 10);
    }
}
