//! Token, media and cost accounting for a completion.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::ops::AddAssign;

/// Usage of one completion and, once computed, its cost.
///
/// Counts are `f64` because per-character billing produces fractional
/// token equivalents. Costs stay `None` until the cost calculator succeeds,
/// so "free" and "unknown" remain distinguishable.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LLMUsage {
    pub prompt_token_count: Option<f64>,
    /// Portion of `prompt_token_count` served from the provider cache.
    pub prompt_token_count_cached: Option<f64>,
    pub completion_token_count: Option<f64>,
    /// Portion of `completion_token_count` spent on reasoning.
    pub reasoning_token_count: Option<f64>,
    pub prompt_audio_token_count: Option<f64>,
    pub prompt_audio_duration_seconds: Option<f64>,
    pub prompt_image_count: Option<u32>,
    pub prompt_cost_usd: Option<f64>,
    pub completion_cost_usd: Option<f64>,
}

fn newer<T>(current: Option<T>, incoming: Option<T>) -> Option<T> {
    incoming.or(current)
}

fn sum<T: std::ops::Add<Output = T>>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

impl LLMUsage {
    /// Merge a newer usage snapshot into this one.
    ///
    /// Fields set on `other` win, fields only set here are kept. Providers
    /// report cumulative counts while streaming, so the latest value is the
    /// most complete one.
    pub fn merge(self, other: LLMUsage) -> LLMUsage {
        LLMUsage {
            prompt_token_count: newer(self.prompt_token_count, other.prompt_token_count),
            prompt_token_count_cached: newer(
                self.prompt_token_count_cached,
                other.prompt_token_count_cached,
            ),
            completion_token_count: newer(self.completion_token_count, other.completion_token_count),
            reasoning_token_count: newer(self.reasoning_token_count, other.reasoning_token_count),
            prompt_audio_token_count: newer(
                self.prompt_audio_token_count,
                other.prompt_audio_token_count,
            ),
            prompt_audio_duration_seconds: newer(
                self.prompt_audio_duration_seconds,
                other.prompt_audio_duration_seconds,
            ),
            prompt_image_count: newer(self.prompt_image_count, other.prompt_image_count),
            prompt_cost_usd: newer(self.prompt_cost_usd, other.prompt_cost_usd),
            completion_cost_usd: newer(self.completion_cost_usd, other.completion_cost_usd),
        }
    }

    /// Total cost, only when both sides were computed.
    pub fn cost_usd(&self) -> Option<f64> {
        Some(self.prompt_cost_usd? + self.completion_cost_usd?)
    }

    pub fn has_token_counts(&self) -> bool {
        self.prompt_token_count.is_some() || self.completion_token_count.is_some()
    }

    /// Drop any computed cost, keeping the counts.
    pub fn without_cost(mut self) -> LLMUsage {
        self.prompt_cost_usd = None;
        self.completion_cost_usd = None;
        self
    }
}

/// Accumulates usage across several round-trips of the same logical call.
impl AddAssign for LLMUsage {
    fn add_assign(&mut self, rhs: LLMUsage) {
        self.prompt_token_count = sum(self.prompt_token_count, rhs.prompt_token_count);
        self.prompt_token_count_cached =
            sum(self.prompt_token_count_cached, rhs.prompt_token_count_cached);
        self.completion_token_count = sum(self.completion_token_count, rhs.completion_token_count);
        self.reasoning_token_count = sum(self.reasoning_token_count, rhs.reasoning_token_count);
        self.prompt_audio_token_count =
            sum(self.prompt_audio_token_count, rhs.prompt_audio_token_count);
        self.prompt_audio_duration_seconds =
            sum(self.prompt_audio_duration_seconds, rhs.prompt_audio_duration_seconds);
        self.prompt_image_count = sum(self.prompt_image_count, rhs.prompt_image_count);
        self.prompt_cost_usd = sum(self.prompt_cost_usd, rhs.prompt_cost_usd);
        self.completion_cost_usd = sum(self.completion_cost_usd, rhs.completion_cost_usd);
    }
}
