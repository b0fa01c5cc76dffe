//! Per-request scratch state and the completion records that leave the core.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Mutex, PoisonError};

use crate::providers::openai_compatible::ThinkTagSplitter;
use crate::providers::Provider;
use crate::usage::LLMUsage;

/// Metadata key holding the comma-separated Vertex regions that rate limited.
pub const VERTEX_EXCLUDED_REGIONS: &str = "vertex_excluded_regions";

/// Accumulator owned by a single request.
///
/// Parsers append the raw provider text and merge usage into it; it is moved
/// into the [`LLMCompletion`] once the attempt ends.
#[derive(Debug, Default)]
pub struct RawCompletion {
    /// Raw response text, kept for diagnostics.
    pub response: String,
    pub usage: LLMUsage,
    /// Splits `<think>` sections out of inline content.
    pub(crate) think: ThinkTagSplitter,
    /// Next index for providers that send whole tool calls without one.
    pub(crate) next_tool_idx: u32,
}

impl RawCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one raw payload, newline separated.
    pub fn push_raw(&mut self, payload: &str) {
        if !self.response.is_empty() {
            self.response.push('\n');
        }
        self.response.push_str(payload);
    }

    pub fn merge_usage(&mut self, usage: &LLMUsage) {
        self.usage = std::mem::take(&mut self.usage).merge(usage.clone());
    }
}

/// One attempt against one provider, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct LLMCompletion {
    pub provider: Provider,
    pub model: String,
    pub wire_model: String,
    /// Request messages as sent, in the domain representation.
    pub messages: Value,
    pub response: Option<String>,
    pub usage: LLMUsage,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

impl LLMCompletion {
    pub fn cost_usd(&self) -> Option<f64> {
        self.usage.cost_usd()
    }
}

/// Receives completion records and carries per-run metadata.
///
/// Shared across concurrent attempts of the same run, so implementations
/// must tolerate concurrent calls.
pub trait CompletionTracker: Send + Sync {
    fn add_completion(&self, completion: LLMCompletion);
    fn get_metadata(&self, key: &str) -> Option<String>;
    fn add_metadata(&self, key: &str, value: String);

    /// Append `item` to the comma-separated list under `key`, unless it is
    /// already there.
    ///
    /// The default reads then writes; trackers shared by concurrent attempts
    /// should override it with an atomic update.
    fn append_metadata_item(&self, key: &str, item: &str) {
        let current = self.get_metadata(key).unwrap_or_default();
        if let Some(updated) = appended(&current, item) {
            self.add_metadata(key, updated);
        }
    }
}

/// `list` with `item` appended, or `None` when it already holds it.
fn appended(list: &str, item: &str) -> Option<String> {
    if list.split(',').any(|existing| existing == item) {
        return None;
    }
    Some(if list.is_empty() { item.to_string() } else { format!("{list},{item}") })
}

#[derive(Debug, Default)]
pub struct InMemoryTracker {
    completions: Mutex<Vec<LLMCompletion>>,
    metadata: DashMap<String, String>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completions(&self) -> Vec<LLMCompletion> {
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sum of all known completion costs.
    pub fn total_cost_usd(&self) -> f64 {
        self.completions().iter().filter_map(LLMCompletion::cost_usd).sum()
    }
}

impl CompletionTracker for InMemoryTracker {
    fn add_completion(&self, completion: LLMCompletion) {
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(completion);
    }

    fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(|v| v.value().clone())
    }

    fn add_metadata(&self, key: &str, value: String) {
        self.metadata.insert(key.to_string(), value);
    }

    fn append_metadata_item(&self, key: &str, item: &str) {
        self.metadata
            .entry(key.to_string())
            .and_modify(|list| {
                if let Some(updated) = appended(list, item) {
                    *list = updated;
                }
            })
            .or_insert_with(|| item.to_string());
    }
}

/// Regions already excluded for this run.
pub fn excluded_regions(tracker: &dyn CompletionTracker) -> Vec<String> {
    tracker
        .get_metadata(VERTEX_EXCLUDED_REGIONS)
        .map(|v| {
            v.split(',')
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Add `region` to the excluded list, keeping earlier entries.
pub fn exclude_region(tracker: &dyn CompletionTracker, region: &str) {
    tracker.append_metadata_item(VERTEX_EXCLUDED_REGIONS, region);
}
