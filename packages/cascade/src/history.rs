//! Lineage history: every ancestor's committed output, keyed by step name.
//!
//! Terminal steps (exporters, reporters) need the whole derivation of an
//! item, not only the payload that reached them. [`unroll`] walks a
//! message's ancestry through the ledger, following chain links and merge
//! brackets, and collects each ancestor's committed payload.
//!
//! The exported shape is:
//!
//! ```json
//! {
//!   "cascade_id": "gen:count=0/expand/complete",
//!   "history": { "gen": {...}, "expand": "...", "complete": "..." }
//! }
//! ```
//!
//! with history entries ordered by lineage depth (roots first).

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::ledger::Ledger;
use crate::lineage::LineageId;

/// Append-only mapping from step name to that step's output payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History(IndexMap<String, Value>);

impl History {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `step`'s payload. A later entry for the same step replaces
    /// the value but keeps the original position.
    pub fn insert(&mut self, step: impl Into<String>, payload: Value) {
        self.0.insert(step.into(), payload);
    }

    /// Payload recorded for `step`.
    pub fn get(&self, step: &str) -> Option<&Value> {
        self.0.get(step)
    }

    /// Step names in depth order.
    pub fn steps(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(step, payload)` pairs in depth order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// History export consumed by terminal collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryExport {
    /// Canonical id of the item being exported.
    pub cascade_id: String,
    /// Ancestor payloads ordered by lineage depth.
    pub history: History,
}

impl HistoryExport {
    /// Build an export for `id`.
    pub fn new(id: &LineageId, history: History) -> Self {
        Self {
            cascade_id: id.to_string(),
            history,
        }
    }

    /// Stable hex digest of the cascade id, suitable as a file stem.
    pub fn digest(&self) -> String {
        format!("{:x}", md5::compute(self.cascade_id.as_bytes()))
    }
}

/// Walk `id`'s ancestry and collect every committed ancestor payload.
///
/// `id` itself is included when its producing step has committed. Fan-out
/// links (`:index=K`) select the K-th committed output of their step.
/// Ancestors with no committed record are skipped.
pub async fn unroll(ledger: &dyn Ledger, id: &LineageId) -> Result<History> {
    unroll_all(ledger, std::slice::from_ref(id)).await
}

/// [`unroll`] over several ids at once (the inputs of a fan-in step).
pub async fn unroll_all(ledger: &dyn Ledger, ids: &[LineageId]) -> Result<History> {
    let mut entries: Vec<(usize, String, Value)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut stack: Vec<LineageId> = ids.to_vec();

    while let Some(current) = stack.pop() {
        if !seen.insert(current.to_string()) {
            continue;
        }

        let step = current.producing_step();
        if let Some(record) = ledger.lookup(step, &current.base()).await? {
            let position = current.index().unwrap_or(0) as usize;
            match record.outputs.get(position) {
                Some(payload) if record.is_done() => {
                    entries.push((current.depth(), step.to_string(), payload.clone()));
                }
                _ => {}
            }
        }

        stack.extend(current.parents().iter().cloned());
    }

    entries.sort_by_key(|(depth, _, _)| *depth);

    let mut history = History::new();
    for (_, step, payload) in entries {
        history.insert(step, payload);
    }
    Ok(history)
}
