//! Per-request model options and transport configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::model::ToolChoice;
use crate::model::Tool;

/// How much the model should think before answering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Disabled,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    /// Wire name used by effort-based providers.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Disabled => "none",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// Parse a wire name. `minimal` and `none` both disable reasoning.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" | "minimal" | "disabled" => Some(ReasoningEffort::Disabled),
            "low" => Some(ReasoningEffort::Low),
            "medium" => Some(ReasoningEffort::Medium),
            "high" => Some(ReasoningEffort::High),
            _ => None,
        }
    }
}

/// Options for a single completion request.
///
/// Only `model` is required. Everything else falls back to provider or
/// catalog defaults.
///
/// # Example
/// ```rust
/// use anotherai::options::{ProviderOptions, ReasoningEffort};
///
/// let options = ProviderOptions::new("claude-sonnet-4")
///     .with_temperature(0.2)
///     .with_max_tokens(1024)
///     .with_reasoning_effort(ReasoningEffort::Low);
/// assert_eq!(options.max_tokens, Some(1024));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProviderOptions {
    /// Model identifier or alias (e.g., "gpt-4o", "claude-sonnet-4")
    pub model: String,

    /// Temperature for sampling (0.0 - 2.0)
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,

    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub parallel_tool_calls: Option<bool>,
    pub tool_choice: Option<ToolChoice>,

    /// Tools the model may call
    #[serde(default)]
    pub enabled_tools: Vec<Tool>,

    /// JSON schema the final answer must follow
    pub output_schema: Option<Value>,

    /// Ask the provider to enforce `output_schema` natively
    #[serde(default)]
    pub structured_generation: bool,

    pub reasoning_effort: Option<ReasoningEffort>,

    /// Explicit reasoning token budget, wins over `reasoning_effort`
    pub reasoning_budget: Option<u32>,

    /// Name used to label strict output schemas
    pub task_name: Option<String>,
}

impl ProviderOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.enabled_tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }

    /// Set the output schema. `strict` requests native structured generation.
    pub fn with_output_schema(mut self, schema: Value, strict: bool) -> Self {
        self.output_schema = Some(schema);
        self.structured_generation = strict;
        self
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    pub fn with_reasoning_budget(mut self, budget: u32) -> Self {
        self.reasoning_budget = Some(budget);
        self
    }

    pub fn with_task_name(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }

    pub fn has_tools(&self) -> bool {
        !self.enabled_tools.is_empty()
    }
}

/// Transport-level configuration shared by every provider.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Request timeout, including reading the body
    pub timeout: Option<Duration>,

    /// HTTP proxy URL
    pub proxy: Option<String>,

    /// Additional HTTP headers to include in requests
    pub extra_headers: HashMap<String, String>,
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the proxy URL.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Add a single extra header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }
}
