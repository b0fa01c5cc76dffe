//! Accumulates parsed stream increments into a final [`RunnerOutput`].
//!
//! Non-streaming responses go through the same aggregator as a single
//! increment, so both paths share finish-reason handling, tool argument
//! parsing and output validation.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::model::{FinishReason, ParsedResponse, RunnerOutput, ToolCallRequest};
use crate::usage::LLMUsage;

/// Turns the final text into the agent output.
///
/// Implemented for any `Fn(&str) -> Result<Value, String>`, so callers can
/// plug in schema validation.
pub trait OutputFactory: Send + Sync {
    fn parse(&self, text: &str) -> Result<Value, String>;
}

impl<F> OutputFactory for F
where
    F: Fn(&str) -> Result<Value, String> + Send + Sync,
{
    fn parse(&self, text: &str) -> Result<Value, String> {
        self(text)
    }
}

/// Parse a JSON object, tolerating a surrounding markdown code fence.
pub fn json_output(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    match serde_json::from_str::<Value>(inner) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

/// The raw text as a JSON string.
pub fn text_output(text: &str) -> Result<Value, String> {
    Ok(Value::String(text.to_string()))
}

#[derive(Debug, Default)]
struct ToolCallBuffer {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct StreamingAggregator {
    text: String,
    reasoning: String,
    tool_calls: BTreeMap<u32, ToolCallBuffer>,
    usage: Option<LLMUsage>,
    finish_reason: Option<FinishReason>,
}

impl StreamingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, parsed: &ParsedResponse) {
        if let Some(delta) = &parsed.delta {
            self.text.push_str(delta);
        }
        if let Some(reasoning) = &parsed.reasoning {
            self.reasoning.push_str(reasoning);
        }
        for fragment in &parsed.tool_calls {
            let entry = self.tool_calls.entry(fragment.idx).or_default();
            if entry.id.is_none() {
                entry.id.clone_from(&fragment.id);
            }
            if entry.name.is_none() {
                entry.name.clone_from(&fragment.tool_name);
            }
            entry.arguments.push_str(&fragment.arguments);
        }
        if let Some(usage) = &parsed.usage {
            self.usage = Some(match self.usage.take() {
                Some(current) => current.merge(usage.clone()),
                None => usage.clone(),
            });
        }
        if parsed.finish_reason.is_some() {
            self.finish_reason = parsed.finish_reason;
        }
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn usage(&self) -> Option<&LLMUsage> {
        self.usage.as_ref()
    }

    fn check_finish_reason(&self) -> Result<(), ProviderError> {
        match self.finish_reason {
            Some(FinishReason::MaxContext) => Err(ProviderError::max_tokens_exceeded(
                "model stopped because it reached the max tokens limit",
            )),
            Some(FinishReason::ContentFilter) => Err(ProviderError::content_moderation(
                "model stopped because of a content filter",
            )),
            Some(FinishReason::Recitation) => Err(ProviderError::content_moderation(
                "model stopped because of recitation",
            )
            .with_retry(true)),
            Some(FinishReason::MalformedFunctionCall) => {
                Err(ProviderError::failed_generation("model produced a malformed function call"))
            }
            Some(FinishReason::Stop) | None => Ok(()),
        }
    }

    fn tool_call_requests(&mut self) -> Result<Vec<ToolCallRequest>, ProviderError> {
        std::mem::take(&mut self.tool_calls)
            .into_iter()
            .map(|(idx, call)| {
                let tool_name = call
                    .name
                    .ok_or_else(|| ProviderError::failed_generation(format!("tool call {idx} has no name")))?;
                let tool_input = if call.arguments.trim().is_empty() {
                    Map::new()
                } else {
                    serde_json::from_str::<Map<String, Value>>(&call.arguments).map_err(|e| {
                        ProviderError::failed_generation(format!(
                            "invalid arguments for tool {tool_name}: {e}"
                        ))
                    })?
                };
                Ok(ToolCallRequest {
                    id: call.id.unwrap_or_else(|| format!("{tool_name}_{idx}")),
                    tool_name,
                    tool_input,
                    index: Some(idx),
                })
            })
            .collect()
    }

    /// Build the final output. Consumes the aggregator.
    pub fn complete(mut self, output_factory: &dyn OutputFactory) -> Result<RunnerOutput, ProviderError> {
        self.check_finish_reason()?;
        let tool_call_requests = self.tool_call_requests()?;
        let text = self.text.trim();

        let agent_output = if text.is_empty() {
            if tool_call_requests.is_empty() {
                return Err(ProviderError::failed_generation("model returned an empty response"));
            }
            None
        } else {
            match output_factory.parse(text) {
                Ok(value) => Some(value),
                // A tool call makes the text optional.
                Err(_) if !tool_call_requests.is_empty() => None,
                Err(e) => return Err(ProviderError::failed_generation(format!("invalid output: {e}"))),
            }
        };

        Ok(RunnerOutput {
            agent_output,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_call_requests,
            usage: self.usage,
            finish_reason: self.finish_reason,
        })
    }
}
