//! Top-level-key diffing between two payloads.
//!
//! Values are compared by their serialized form; nested changes are reported
//! as a whole-key `modified` and never recursed into.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Payload;

/// Delta between two payloads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextDiff {
    pub added: Payload,
    pub modified: Payload,
    pub removed: BTreeSet<String>,
    pub unchanged: Vec<String>,
}

impl ContextDiff {
    /// True when applying this diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Diff describing a payload written on top of nothing.
    pub fn full(payload: &Payload) -> Self {
        Self {
            added: payload.clone(),
            ..Self::default()
        }
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (serde_json::to_string(a), serde_json::to_string(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Compute the delta that turns `old` into `new`.
pub fn compute_diff(old: &Payload, new: &Payload) -> ContextDiff {
    let mut diff = ContextDiff::default();

    for (key, value) in new {
        match old.get(key) {
            None => {
                diff.added.insert(key.clone(), value.clone());
            }
            Some(previous) if same_value(previous, value) => diff.unchanged.push(key.clone()),
            Some(_) => {
                diff.modified.insert(key.clone(), value.clone());
            }
        }
    }

    for key in old.keys() {
        if !new.contains_key(key) {
            diff.removed.insert(key.clone());
        }
    }

    diff
}

/// Apply `diff` to a copy of `base`: overlay `added`, then `modified`, then
/// delete `removed`. A key both added and removed ends up deleted.
pub fn apply_diff(base: &Payload, diff: &ContextDiff) -> Payload {
    let mut result = base.clone();
    for (key, value) in &diff.added {
        result.insert(key.clone(), value.clone());
    }
    for (key, value) in &diff.modified {
        result.insert(key.clone(), value.clone());
    }
    for key in &diff.removed {
        result.remove(key);
    }
    result
}

/// Fold consecutive diffs into one delta relative to the span's starting point.
///
/// A key added and later removed inside the span is reported only as removed.
/// A key added and later modified stays in `added` with its latest value.
/// `unchanged` lists the keys of `current` that are not otherwise reported.
pub fn aggregate<'a>(diffs: impl IntoIterator<Item = &'a ContextDiff>, current: &Payload) -> ContextDiff {
    let mut agg = ContextDiff::default();

    for diff in diffs {
        for (key, value) in &diff.added {
            agg.removed.remove(key);
            agg.modified.remove(key);
            agg.added.insert(key.clone(), value.clone());
        }
        for (key, value) in &diff.modified {
            agg.removed.remove(key);
            if let Some(slot) = agg.added.get_mut(key) {
                *slot = value.clone();
            } else {
                agg.modified.insert(key.clone(), value.clone());
            }
        }
        for key in &diff.removed {
            agg.added.remove(key);
            agg.modified.remove(key);
            agg.removed.insert(key.clone());
        }
    }

    agg.unchanged = current
        .keys()
        .filter(|k| !agg.added.contains_key(*k) && !agg.modified.contains_key(*k))
        .cloned()
        .collect();
    agg
}
