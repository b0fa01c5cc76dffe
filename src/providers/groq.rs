//! Groq, OpenAI-compatible with usage reported under `x_groq`.

use super::openai_compatible::{Dialect, MaxTokensField, ReasoningStyle, WireError};
use super::{OutputSupport, Provider};
use crate::error::ProviderError;

pub const DIALECT: Dialect = Dialect {
    provider: Provider::Groq,
    base_url: "https://api.groq.com/openai/v1",
    output: OutputSupport {
        json_object: true,
        json_schema: false,
        json_with_tools: false,
    },
    max_tokens_field: MaxTokensField::MaxTokens,
    reasoning: ReasoningStyle::Inline,
    stream_usage: false,
    normalize_tool_ids: false,
    required_tool_choice: "required",
    audio_input: false,
};

pub(super) fn classify(status: u16, error: &WireError) -> Option<ProviderError> {
    let message = error.message.as_str();
    let lower = message.to_lowercase();

    match error.code.as_deref() {
        Some("json_validate_failed") | Some("tool_use_failed") => {
            return Some(ProviderError::failed_generation(message).with_store_task_run(true));
        }
        Some("model_decommissioned") | Some("model_not_found") => {
            return Some(ProviderError::missing_model(message));
        }
        _ => {}
    }
    // Groq answers 413 for per-minute token quotas.
    if status == 413 && lower.contains("tokens per minute") {
        return Some(ProviderError::rate_limit(message));
    }
    if lower.contains("does not exist or you do not have access") {
        return Some(ProviderError::missing_model(message));
    }
    None
}
