//! LLM provider implementations.
//!
//! Every provider exposes the same four operations, dispatched through
//! [`ProviderKit`]:
//!
//! - build the wire body from messages and options (no I/O)
//! - turn a wire body into an [`HttpRequest`] (endpoint, auth headers)
//! - parse a full response or one stream event into a [`ParsedResponse`]
//! - classify an error response into a [`ProviderError`]
//!
//! The helpers in this module hold the rules shared by all builders: max
//! token resolution, reasoning budgets, structured output mode and the
//! schema naming scheme.

pub mod anthropic;
pub mod bedrock;
pub mod fireworks;
pub mod google;
pub mod groq;
pub mod mistral;
pub mod openai;
pub mod openai_compatible;
pub mod xai;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use crate::catalog::{ModelData, ModelProviderData};
use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ProviderError};
use crate::http::HttpRequest;
use crate::model::{FinishReason, Message, ParsedResponse};
use crate::options::{ProviderOptions, ReasoningEffort};
use crate::tracking::RawCompletion;

use google::GoogleFlavor;
use openai_compatible::Dialect;

/// Every supported provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    Anthropic,
    GoogleGemini,
    GoogleVertex,
    AmazonBedrock,
    Mistral,
    Fireworks,
    XAi,
    Groq,
}

impl Provider {
    pub const ALL: [Provider; 9] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::GoogleGemini,
        Provider::GoogleVertex,
        Provider::AmazonBedrock,
        Provider::Mistral,
        Provider::Fireworks,
        Provider::XAi,
        Provider::Groq,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::GoogleGemini => "google_gemini",
            Provider::GoogleVertex => "google",
            Provider::AmazonBedrock => "amazon_bedrock",
            Provider::Mistral => "mistral_ai",
            Provider::Fireworks => "fireworks",
            Provider::XAi => "xai",
            Provider::Groq => "groq",
        }
    }

    /// Environment variable holding the API key.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::GoogleGemini => "GEMINI_API_KEY",
            Provider::GoogleVertex => "GOOGLE_VERTEX_AI_ACCESS_TOKEN",
            Provider::AmazonBedrock => "AWS_BEDROCK_API_KEY",
            Provider::Mistral => "MISTRAL_API_KEY",
            Provider::Fireworks => "FIREWORKS_API_KEY",
            Provider::XAi => "XAI_API_KEY",
            Provider::Groq => "GROQ_API_KEY",
        }
    }

    pub fn kit(&self) -> ProviderKit {
        ProviderKit::for_provider(*self)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Framing of a streaming response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Sse,
    /// AWS binary event-stream.
    EventStream,
}

/// One decoded stream event, before provider parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPayload {
    /// Event type from the framing layer, when it carries one.
    pub event_type: Option<String>,
    pub data: String,
}

impl StreamPayload {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event_type: None,
            data: data.into(),
        }
    }
}

/// Inputs of a request builder.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub messages: &'a [Message],
    pub options: &'a ProviderOptions,
    pub model: &'a ModelData,
    pub provider_data: &'a ModelProviderData,
    pub stream: bool,
}

/// Provider implementations as a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKit {
    OpenAiCompatible(Dialect),
    Anthropic,
    Google(GoogleFlavor),
    Bedrock,
}

impl ProviderKit {
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::OpenAi => ProviderKit::OpenAiCompatible(openai::DIALECT),
            Provider::Mistral => ProviderKit::OpenAiCompatible(mistral::DIALECT),
            Provider::Fireworks => ProviderKit::OpenAiCompatible(fireworks::DIALECT),
            Provider::XAi => ProviderKit::OpenAiCompatible(xai::DIALECT),
            Provider::Groq => ProviderKit::OpenAiCompatible(groq::DIALECT),
            Provider::Anthropic => ProviderKit::Anthropic,
            Provider::GoogleGemini => ProviderKit::Google(GoogleFlavor::Gemini),
            Provider::GoogleVertex => ProviderKit::Google(GoogleFlavor::Vertex),
            Provider::AmazonBedrock => ProviderKit::Bedrock,
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            ProviderKit::OpenAiCompatible(dialect) => dialect.provider,
            ProviderKit::Anthropic => Provider::Anthropic,
            ProviderKit::Google(GoogleFlavor::Gemini) => Provider::GoogleGemini,
            ProviderKit::Google(GoogleFlavor::Vertex) => Provider::GoogleVertex,
            ProviderKit::Bedrock => Provider::AmazonBedrock,
        }
    }

    pub fn stream_format(&self) -> StreamFormat {
        match self {
            ProviderKit::Bedrock => StreamFormat::EventStream,
            _ => StreamFormat::Sse,
        }
    }

    /// Build the provider wire body. Performs no I/O.
    pub fn build_request(&self, ctx: BuildContext<'_>) -> Result<Value, ProviderError> {
        check_capabilities(&ctx)?;
        let body = match self {
            ProviderKit::OpenAiCompatible(dialect) => openai_compatible::build_request(dialect, ctx)?,
            ProviderKit::Anthropic => anthropic::build_request(ctx)?,
            ProviderKit::Google(_) => google::build_request(ctx)?,
            ProviderKit::Bedrock => bedrock::build_request(ctx)?,
        };
        Ok(body)
    }

    /// Wrap a wire body into a ready-to-send request.
    ///
    /// `region` selects the Vertex region; other providers ignore it.
    pub fn http_request(
        &self,
        config: &ProviderConfig,
        wire_model: &str,
        body: &Value,
        stream: bool,
        region: Option<&str>,
    ) -> Result<HttpRequest, ProviderError> {
        let body = serde_json::to_vec(body)
            .map_err(|e| ProviderError::bad_request(format!("failed to serialize request: {e}")))?;
        let request = match self {
            ProviderKit::OpenAiCompatible(dialect) => openai_compatible::http_request(dialect, config, body)?,
            ProviderKit::Anthropic => anthropic::http_request(config, body)?,
            ProviderKit::Google(flavor) => google::http_request(*flavor, config, wire_model, body, stream, region)?,
            ProviderKit::Bedrock => bedrock::http_request(config, wire_model, body, stream)?,
        };
        Ok(request)
    }

    pub fn parse_response(&self, body: &str, raw: &mut RawCompletion) -> Result<ParsedResponse, ProviderError> {
        raw.push_raw(body);
        let parsed = match self {
            ProviderKit::OpenAiCompatible(dialect) => openai_compatible::parse_response(dialect, body, raw),
            ProviderKit::Anthropic => anthropic::parse_response(body),
            ProviderKit::Google(_) => google::parse_response(body, raw),
            ProviderKit::Bedrock => bedrock::parse_response(body),
        }
        .map_err(|e| e.with_provider(self.provider()))?;
        if let Some(usage) = &parsed.usage {
            raw.merge_usage(usage);
        }
        Ok(parsed)
    }

    /// Parse one stream event. Returns an empty response for events that
    /// carry nothing (pings, stop markers).
    pub fn parse_stream_event(
        &self,
        payload: &StreamPayload,
        raw: &mut RawCompletion,
    ) -> Result<ParsedResponse, ProviderError> {
        raw.push_raw(&payload.data);
        let parsed = match self {
            ProviderKit::OpenAiCompatible(dialect) => openai_compatible::parse_stream_event(dialect, &payload.data, raw),
            ProviderKit::Anthropic => anthropic::parse_stream_event(&payload.data),
            ProviderKit::Google(_) => google::parse_stream_event(&payload.data, raw),
            ProviderKit::Bedrock => bedrock::parse_stream_event(payload),
        }
        .map_err(|e| e.with_provider(self.provider()))?;
        if let Some(usage) = &parsed.usage {
            raw.merge_usage(usage);
        }
        Ok(parsed)
    }

    /// Release text a parser held back, once the response has ended.
    pub fn finish(&self, raw: &mut RawCompletion) -> ParsedResponse {
        match self {
            ProviderKit::OpenAiCompatible(_) => openai_compatible::finish(raw),
            _ => ParsedResponse::default(),
        }
    }

    /// Classify a non-2xx response.
    pub fn classify_error(&self, status: u16, body: &str, retry_after: Option<Duration>) -> ProviderError {
        self.classify(status, body, None, retry_after)
    }

    /// Classify a non-2xx response, reading `Retry-After` and
    /// `x-amzn-errortype` from its lowercase headers.
    pub fn classify_response(&self, status: u16, body: &str, headers: &HashMap<String, String>) -> ProviderError {
        let retry_after = parse_retry_after(headers.get("retry-after").map(String::as_str));
        let error_type = headers.get("x-amzn-errortype").map(String::as_str);
        self.classify(status, body, error_type, retry_after)
    }

    fn classify(
        &self,
        status: u16,
        body: &str,
        error_type: Option<&str>,
        retry_after: Option<Duration>,
    ) -> ProviderError {
        let mut error = match self {
            ProviderKit::OpenAiCompatible(dialect) => openai_compatible::classify_error(dialect, status, body),
            ProviderKit::Anthropic => anthropic::classify_error(status, body),
            ProviderKit::Google(_) => google::classify_error(status, body),
            ProviderKit::Bedrock => bedrock::classify_error(status, error_type, body),
        }
        .with_provider(self.provider())
        .with_status(status);
        if let Some(retry_after) = retry_after {
            error = error.with_retry_after(retry_after);
        }
        error
    }
}

/// Reject inputs the model cannot handle before sending anything.
fn check_capabilities(ctx: &BuildContext<'_>) -> Result<(), ProviderError> {
    for file in ctx.messages.iter().flat_map(Message::files) {
        if file.url.is_none() && file.data.is_none() {
            return Err(ProviderError::bad_request("file has neither a url nor data"));
        }
        let unsupported = (file.is_image() && !ctx.model.supports_input_image)
            || (file.is_audio() && !ctx.model.supports_input_audio)
            || (file.is_pdf() && !ctx.model.supports_input_pdf);
        if unsupported {
            return Err(ProviderError::unsupported_mode(format!(
                "{} does not support {} input",
                ctx.model.id,
                file.content_type.as_deref().unwrap_or("file")
            )));
        }
    }
    if ctx.options.has_tools() && !ctx.model.supports_tool_calling {
        return Err(ProviderError::unsupported_mode(format!(
            "{} does not support tool calling",
            ctx.model.id
        )));
    }
    Ok(())
}

/// Reasoning token budget for the request, `Some(0)` when disabled.
///
/// An explicit budget wins over an effort level. Both are clamped to the
/// model's `[min, max]` range.
pub fn reasoning_budget(options: &ProviderOptions, model: &ModelData) -> Option<u32> {
    let budget = model.reasoning.as_ref()?;
    match (options.reasoning_budget, options.reasoning_effort) {
        (Some(0), _) => budget.disabled,
        (Some(requested), _) => Some(budget.clamp(requested)),
        (None, Some(effort)) => budget.budget_for_effort(effort),
        (None, None) => None,
    }
}

/// Effort level for providers that take an effort rather than a budget.
pub fn reasoning_effort(options: &ProviderOptions, model: &ModelData) -> Option<ReasoningEffort> {
    let budget = model.reasoning.as_ref()?;
    options
        .reasoning_effort
        .or_else(|| options.reasoning_budget.map(|b| budget.effort_for_budget(b)))
}

/// Completion token limit.
///
/// Precedence: explicit value, model max output, model context window. An
/// explicit value is raised by the reasoning budget and everything is capped
/// at the model ceiling.
pub fn resolve_max_tokens(options: &ProviderOptions, model: &ModelData, reasoning_budget: Option<u32>) -> u32 {
    let ceiling = model.max_tokens_data.output_ceiling();
    match options.max_tokens {
        Some(requested) => requested
            .saturating_add(reasoning_budget.unwrap_or(0))
            .min(ceiling),
        None => ceiling,
    }
}

/// Whether sampling parameters may be sent.
pub fn sampling_allowed(model: &ModelData) -> bool {
    model.supports_temperature
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredMode {
    Disabled,
    JsonObject,
    JsonSchema,
}

/// What a provider API accepts for constraining output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSupport {
    pub json_object: bool,
    pub json_schema: bool,
    /// JSON modes may be combined with tools.
    pub json_with_tools: bool,
}

pub fn structured_mode(ctx: &BuildContext<'_>, support: OutputSupport) -> StructuredMode {
    if ctx.options.output_schema.is_none() {
        return StructuredMode::Disabled;
    }
    if ctx.options.has_tools() && !support.json_with_tools {
        return StructuredMode::Disabled;
    }
    let schema_capable = support.json_schema
        && ctx
            .provider_data
            .supports_structured_output
            .unwrap_or(ctx.model.supports_structured_output);

    // Strict schemas would forbid plain tool calls, tools win.
    if ctx.options.structured_generation && schema_capable && !ctx.options.has_tools() {
        StructuredMode::JsonSchema
    } else if support.json_object && ctx.model.supports_json_mode {
        StructuredMode::JsonObject
    } else {
        StructuredMode::Disabled
    }
}

const MAX_SCHEMA_NAME_LEN: usize = 64;

static INVALID_NAME_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]+").expect("valid regex"));

/// `<sanitized task name>_<first 8 hex chars of sha256(schema)>`, at most 64 chars.
pub fn schema_name(task_name: Option<&str>, schema: &Value) -> String {
    let digest = Sha256::digest(schema.to_string().as_bytes());
    let hash: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();

    let task = task_name.unwrap_or("output").trim();
    let task = INVALID_NAME_CHARS.replace_all(task, "_").to_lowercase();
    let task = task.trim_matches('_');
    let task = if task.is_empty() { "output" } else { task };
    let max_task_len = MAX_SCHEMA_NAME_LEN - hash.len() - 1;
    let task: String = task.chars().take(max_task_len).collect();

    format!("{task}_{hash}")
}

/// Instruction appended to the system prompt when the schema is not
/// enforced natively.
pub fn schema_instruction(schema: &Value) -> String {
    let schema = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!("Return a single JSON object enforcing the following JSON schema:\n```json\n{schema}\n```")
}

/// Schema instruction for `mode`, `None` when the provider enforces it.
pub fn system_schema_instruction(ctx: &BuildContext<'_>, mode: StructuredMode) -> Option<String> {
    match (&ctx.options.output_schema, mode) {
        (Some(_), StructuredMode::JsonSchema) | (None, _) => None,
        (Some(schema), _) => Some(schema_instruction(schema)),
    }
}

/// Join the system messages, then append the schema instruction if any.
pub fn system_prompt(ctx: &BuildContext<'_>, mode: StructuredMode) -> Option<String> {
    let mut parts: Vec<String> = ctx
        .messages
        .iter()
        .filter(|m| m.role == crate::model::Role::System)
        .map(Message::text)
        .filter(|t| !t.is_empty())
        .collect();
    parts.extend(system_schema_instruction(ctx, mode));
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

/// Normalize a provider stop reason.
pub fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" | "MAX_TOKENS" | "length" | "model_context_window_exceeded" => FinishReason::MaxContext,
        "RECITATION" => FinishReason::Recitation,
        "MALFORMED_FUNCTION_CALL" => FinishReason::MalformedFunctionCall,
        "content_filter" | "content_filtered" | "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII"
        | "refusal" | "guardrail_intervened" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Default classification from the HTTP status alone.
pub fn classify_status(status: u16, message: impl Into<String>) -> ProviderError {
    let kind = match status {
        400 | 422 => ErrorKind::BadRequest,
        401 | 402 | 403 => ErrorKind::InvalidProviderConfig,
        404 => ErrorKind::MissingModel,
        408 | 504 => ErrorKind::Timeout,
        413 => ErrorKind::MaxTokensExceeded,
        429 => ErrorKind::RateLimit,
        503 => ErrorKind::Unavailable,
        529 => ErrorKind::ServerOverloaded,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Unknown,
    };
    let error = ProviderError::new(kind, message);
    // A bare 413 is not a recognized context overflow message.
    if kind == ErrorKind::MaxTokensExceeded {
        error.with_capture(true)
    } else {
        error
    }
}

/// `Retry-After` in seconds.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Tool call arguments as a JSON string.
pub(crate) fn arguments_string(input: &serde_json::Map<String, Value>) -> String {
    Value::Object(input.clone()).to_string()
}

/// Mime type and base64 payload of an inline file, from `data` or a `data:` URL.
pub(crate) fn inline_data(file: &crate::model::File) -> Option<(String, String)> {
    if let Some(data) = &file.data {
        let mime = file
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        return Some((mime, data.clone()));
    }
    let rest = file.url.as_deref()?.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    Some((mime.to_string(), data.to_string()))
}
