//! OpenAI Chat Completions.
//!
//! See: <https://platform.openai.com/docs/api-reference/chat>

use super::openai_compatible::{Dialect, MaxTokensField, ReasoningStyle, WireError};
use super::{OutputSupport, Provider};
use crate::error::ProviderError;

pub const DIALECT: Dialect = Dialect {
    provider: Provider::OpenAi,
    base_url: "https://api.openai.com/v1",
    output: OutputSupport {
        json_object: true,
        json_schema: true,
        json_with_tools: true,
    },
    max_tokens_field: MaxTokensField::MaxCompletionTokens,
    reasoning: ReasoningStyle::Effort,
    stream_usage: true,
    normalize_tool_ids: false,
    required_tool_choice: "required",
    audio_input: true,
};

pub(super) fn classify(_status: u16, error: &WireError) -> Option<ProviderError> {
    let message = error.message.as_str();
    let lower = message.to_lowercase();

    if lower.contains("error while downloading") || lower.contains("timeout while downloading") {
        return Some(ProviderError::invalid_file(message));
    }
    if lower.contains("image may contain content that is not allowed") || lower.contains("flagged as potentially violating") {
        return Some(ProviderError::content_moderation(message));
    }
    if error.code.as_deref() == Some("invalid_value") && lower.contains("audio") {
        return Some(ProviderError::invalid_file(message));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::providers::ProviderKit;

    fn classify_body(status: u16, body: &str) -> ErrorKind {
        ProviderKit::OpenAiCompatible(DIALECT).classify_error(status, body, None).kind
    }

    #[test]
    fn test_classify_openai_errors() {
        assert_eq!(
            classify_body(400, r#"{"error":{"message":"Error while downloading https://x/a.png.","type":"invalid_request_error","code":"invalid_image_url"}}"#),
            ErrorKind::InvalidFile
        );
        assert_eq!(
            classify_body(400, r#"{"error":{"message":"Invalid schema for response_format 'x': extra required key","type":"invalid_request_error"}}"#),
            ErrorKind::StructuredGeneration
        );
        assert_eq!(
            classify_body(429, r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#),
            ErrorKind::InvalidProviderConfig
        );
        assert_eq!(
            classify_body(429, r#"{"error":{"message":"Rate limit reached for gpt-4o","code":"rate_limit_exceeded"}}"#),
            ErrorKind::RateLimit
        );
        assert_eq!(
            classify_body(400, r#"{"error":{"message":"Your input image may contain content that is not allowed by our safety system."}}"#),
            ErrorKind::ContentModeration
        );
    }

    #[test]
    fn test_classify_carries_status_and_provider() {
        let err = ProviderKit::OpenAiCompatible(DIALECT).classify_error(500, "oops", None);
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.status_code, Some(500));
        assert_eq!(err.provider, Some(Provider::OpenAi));
    }
}
