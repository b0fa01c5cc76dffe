//! Mistral La Plateforme, OpenAI-compatible with stricter tool ids.

use super::openai_compatible::{Dialect, MaxTokensField, ReasoningStyle, WireError};
use super::{OutputSupport, Provider};
use crate::error::ProviderError;

pub const DIALECT: Dialect = Dialect {
    provider: Provider::Mistral,
    base_url: "https://api.mistral.ai/v1",
    output: OutputSupport {
        json_object: true,
        json_schema: true,
        json_with_tools: true,
    },
    max_tokens_field: MaxTokensField::MaxTokens,
    reasoning: ReasoningStyle::None,
    stream_usage: false,
    normalize_tool_ids: true,
    required_tool_choice: "any",
    audio_input: false,
};

pub(super) fn classify(_status: u16, error: &WireError) -> Option<ProviderError> {
    let message = error.message.as_str();
    let lower = message.to_lowercase();

    if lower.contains("too large for model with") || (lower.contains("prompt contains") && lower.contains("tokens")) {
        return Some(ProviderError::max_tokens_exceeded(message));
    }
    if lower.contains("invalid model") {
        return Some(ProviderError::missing_model(message));
    }
    if lower.contains("function calling is not enabled") || lower.contains("image input is not supported") {
        return Some(ProviderError::unsupported_mode(message));
    }
    if lower.contains("capacity exceeded") {
        return Some(ProviderError::rate_limit(message));
    }
    None
}
