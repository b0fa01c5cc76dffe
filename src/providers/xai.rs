//! xAI Grok, OpenAI-compatible with a two level reasoning effort.

use super::openai_compatible::{Dialect, MaxTokensField, ReasoningStyle, WireError};
use super::{OutputSupport, Provider};
use crate::error::{ErrorKind, ProviderError};

pub const DIALECT: Dialect = Dialect {
    provider: Provider::XAi,
    base_url: "https://api.x.ai/v1",
    output: OutputSupport {
        json_object: true,
        json_schema: true,
        json_with_tools: true,
    },
    max_tokens_field: MaxTokensField::MaxTokens,
    reasoning: ReasoningStyle::EffortLowHigh,
    stream_usage: true,
    normalize_tool_ids: false,
    required_tool_choice: "required",
    audio_input: false,
};

pub(super) fn classify(_status: u16, error: &WireError) -> Option<ProviderError> {
    let message = error.message.as_str();
    let lower = message.to_lowercase();

    if lower.contains("maximum prompt length") {
        return Some(ProviderError::max_tokens_exceeded(message));
    }
    if lower.contains("model not found") || lower.contains("does not exist") {
        return Some(ProviderError::missing_model(message));
    }
    if lower.contains("fetching image failed") || lower.contains("unsupported content-type for image") || lower.contains("image is too large") {
        return Some(ProviderError::invalid_file(message));
    }
    if lower.contains("response format") || lower.contains("response_format") {
        return Some(ProviderError::new(ErrorKind::StructuredGeneration, message));
    }
    if lower.contains("credits") || lower.contains("incorrect api key") {
        return Some(ProviderError::new(ErrorKind::InvalidProviderConfig, message));
    }
    None
}
