//! Fireworks AI, OpenAI-compatible with inline `<think>` reasoning.

use super::openai_compatible::{Dialect, MaxTokensField, ReasoningStyle, WireError};
use super::{OutputSupport, Provider};
use crate::error::{ErrorKind, ProviderError};

pub const DIALECT: Dialect = Dialect {
    provider: Provider::Fireworks,
    base_url: "https://api.fireworks.ai/inference/v1",
    output: OutputSupport {
        json_object: true,
        json_schema: true,
        json_with_tools: true,
    },
    max_tokens_field: MaxTokensField::MaxTokens,
    reasoning: ReasoningStyle::Inline,
    stream_usage: false,
    normalize_tool_ids: false,
    required_tool_choice: "any",
    audio_input: false,
};

pub(super) fn classify(status: u16, error: &WireError) -> Option<ProviderError> {
    let message = error.message.as_str();
    let lower = message.to_lowercase();

    if lower.contains("prompt is too long") || lower.contains("exceeds the model's context") {
        return Some(ProviderError::max_tokens_exceeded(message));
    }
    if lower.contains("model not found") {
        return Some(ProviderError::missing_model(message));
    }
    if lower.contains("json schema") || lower.contains("grammar") {
        return Some(ProviderError::new(ErrorKind::StructuredGeneration, message));
    }
    if lower.contains("overloaded") || (status == 503 && lower.contains("capacity")) {
        return Some(ProviderError::new(ErrorKind::ServerOverloaded, message));
    }
    None
}
