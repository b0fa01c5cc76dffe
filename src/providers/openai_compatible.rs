//! Chat Completions wire format shared by OpenAI, Mistral, Fireworks, xAI and Groq.
//!
//! The providers differ in small ways (token limit field, reasoning knobs,
//! tool id rules, usage reporting). Those differences live in [`Dialect`];
//! everything else is shared.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use sha2::{Digest, Sha256};

use super::{
    arguments_string, classify_status, inline_data, map_finish_reason, reasoning_budget, reasoning_effort,
    resolve_max_tokens, sampling_allowed, schema_name, structured_mode, system_schema_instruction, BuildContext,
    OutputSupport, Provider, StructuredMode,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::http::HttpRequest;
use crate::model::{FinishReason, MessageContent, ParsedResponse, Role, ToolCallRequestDelta, ToolChoice};
use crate::options::ReasoningEffort;
use crate::tracking::RawCompletion;
use crate::usage::LLMUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxTokensField {
    MaxTokens,
    MaxCompletionTokens,
}

/// How a provider exposes reasoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningStyle {
    /// No reasoning controls.
    None,
    /// `reasoning_effort` with low, medium and high.
    Effort,
    /// `reasoning_effort` with only low and high.
    EffortLowHigh,
    /// Reasoning arrives inline in `<think>` tags or in `reasoning` fields.
    Inline,
}

/// Per-provider differences of the Chat Completions format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub provider: Provider,
    pub base_url: &'static str,
    pub output: OutputSupport,
    pub max_tokens_field: MaxTokensField,
    pub reasoning: ReasoningStyle,
    /// Request usage in the last stream chunk via `stream_options`.
    pub stream_usage: bool,
    /// Rewrite tool call ids to 9 alphanumeric characters.
    pub normalize_tool_ids: bool,
    /// `tool_choice` value forcing a tool call.
    pub required_tool_choice: &'static str,
    pub audio_input: bool,
}

impl Dialect {
    fn effort_name(&self, effort: ReasoningEffort) -> Option<&'static str> {
        match (self.reasoning, effort) {
            (ReasoningStyle::Effort, ReasoningEffort::Disabled) => Some("low"),
            (ReasoningStyle::Effort, effort) => Some(effort.as_str()),
            (ReasoningStyle::EffortLowHigh, ReasoningEffort::High) => Some("high"),
            (ReasoningStyle::EffortLowHigh, _) => Some("low"),
            _ => None,
        }
    }
}

// --- Request Types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: Option<u32>,
    max_completion_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    presence_penalty: Option<f32>,
    frequency_penalty: Option<f32>,
    stream: bool,
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    tool_choice: Option<Value>,
    parallel_tool_calls: Option<bool>,
    response_format: Option<Value>,
    reasoning_effort: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<WireContent>,
    tool_calls: Option<Vec<WireToolCall>>,
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    InputAudio { input_audio: InputAudio },
    File { file: FileData },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct InputAudio {
    data: String,
    format: String,
}

#[derive(Debug, Serialize)]
struct FileData {
    file_data: String,
    filename: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunction,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

/// Deterministic 9 character alphanumeric id, as Mistral requires.
pub fn normalize_tool_id(id: &str) -> String {
    if id.len() == 9 && id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return id.to_string();
    }
    let digest = Sha256::digest(id.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect::<String>()[..9].to_string()
}

fn part_for_file(dialect: &Dialect, file: &crate::model::File) -> Result<ContentPart, ProviderError> {
    if file.is_audio() {
        if !dialect.audio_input {
            return Err(ProviderError::unsupported_mode(format!("{} does not accept audio input", dialect.provider)));
        }
        let (_, data) = inline_data(file)
            .ok_or_else(|| ProviderError::invalid_file("audio input must be sent inline as base64"))?;
        return Ok(ContentPart::InputAudio {
            input_audio: InputAudio {
                data,
                format: file.format().unwrap_or("wav").to_string(),
            },
        });
    }
    if file.is_pdf() {
        let (mime, data) = inline_data(file)
            .ok_or_else(|| ProviderError::invalid_file("documents must be sent inline as base64"))?;
        return Ok(ContentPart::File {
            file: FileData {
                file_data: format!("data:{mime};base64,{data}"),
                filename: "document.pdf".to_string(),
            },
        });
    }
    let url = file
        .to_url()
        .ok_or_else(|| ProviderError::bad_request("file has neither a url nor data"))?;
    Ok(ContentPart::ImageUrl {
        image_url: ImageUrl { url },
    })
}

fn compact(mut parts: Vec<ContentPart>) -> Option<WireContent> {
    match parts.len() {
        0 => None,
        1 if matches!(parts[0], ContentPart::Text { .. }) => match parts.pop() {
            Some(ContentPart::Text { text }) => Some(WireContent::Text(text)),
            _ => None,
        },
        _ => Some(WireContent::Parts(parts)),
    }
}

fn build_messages(dialect: &Dialect, ctx: &BuildContext<'_>, mode: StructuredMode) -> Result<Vec<WireMessage>, ProviderError> {
    let tool_id = |id: &str| {
        if dialect.normalize_tool_ids {
            normalize_tool_id(id)
        } else {
            id.to_string()
        }
    };

    let mut messages = Vec::with_capacity(ctx.messages.len());
    for message in ctx.messages {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(text) => parts.push(ContentPart::Text { text: text.clone() }),
                MessageContent::File(file) => parts.push(part_for_file(dialect, file)?),
                MessageContent::ToolCallRequest(request) => tool_calls.push(WireToolCall {
                    id: tool_id(&request.id),
                    call_type: "function",
                    function: WireFunctionCall {
                        name: request.tool_name.clone(),
                        arguments: arguments_string(&request.tool_input),
                    },
                }),
                MessageContent::ToolCallResult(result) => messages.push(WireMessage {
                    role: "tool",
                    content: Some(WireContent::Text(result.result.clone())),
                    tool_calls: None,
                    tool_call_id: Some(tool_id(&result.id)),
                }),
            }
        }

        if parts.is_empty() && tool_calls.is_empty() {
            continue;
        }
        messages.push(WireMessage {
            role,
            content: compact(parts),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    }

    if let Some(instruction) = system_schema_instruction(ctx, mode) {
        match messages.first_mut() {
            Some(WireMessage {
                role: "system",
                content: Some(WireContent::Text(text)),
                ..
            }) => {
                text.push_str("\n\n");
                text.push_str(&instruction);
            }
            _ => messages.insert(
                0,
                WireMessage {
                    role: "system",
                    content: Some(WireContent::Text(instruction)),
                    tool_calls: None,
                    tool_call_id: None,
                },
            ),
        }
    }
    Ok(messages)
}

fn tool_choice(dialect: &Dialect, choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required => json!(dialect.required_tool_choice),
        ToolChoice::Function(name) => json!({"type": "function", "function": {"name": name}}),
    }
}

pub fn build_request(dialect: &Dialect, ctx: BuildContext<'_>) -> Result<Value, ProviderError> {
    let options = ctx.options;
    let mode = structured_mode(&ctx, dialect.output);
    let messages = build_messages(dialect, &ctx, mode)?;

    let reasoning_effort = match dialect.reasoning {
        ReasoningStyle::Effort | ReasoningStyle::EffortLowHigh => {
            reasoning_effort(options, ctx.model).and_then(|e| dialect.effort_name(e))
        }
        _ => None,
    };
    let budget = reasoning_budget(options, ctx.model);
    let max_tokens = (options.max_tokens.is_some() || budget.is_some_and(|b| b > 0))
        .then(|| resolve_max_tokens(options, ctx.model, budget));
    let (max_tokens, max_completion_tokens) = match dialect.max_tokens_field {
        MaxTokensField::MaxTokens => (max_tokens, None),
        MaxTokensField::MaxCompletionTokens => (None, max_tokens),
    };

    let sampling = sampling_allowed(ctx.model);
    let tools: Vec<WireTool> = options
        .enabled_tools
        .iter()
        .map(|tool| WireTool {
            tool_type: "function",
            function: WireFunction {
                name: tool.name.clone(),
                description: tool.wire_description().map(str::to_string),
                parameters: tool.input_schema.clone(),
            },
        })
        .collect();
    let has_tools = !tools.is_empty();

    let response_format = match (mode, &options.output_schema) {
        (StructuredMode::JsonSchema, Some(schema)) => Some(json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema_name(options.task_name.as_deref(), schema),
                "schema": schema,
                "strict": true,
            }
        })),
        (StructuredMode::JsonObject, _) => Some(json!({"type": "json_object"})),
        _ => None,
    };

    let request = CompletionRequest {
        model: ctx.provider_data.wire_model.clone(),
        messages,
        max_tokens,
        max_completion_tokens,
        temperature: options.temperature.filter(|_| sampling),
        top_p: options.top_p.filter(|_| sampling),
        presence_penalty: options.presence_penalty.filter(|_| sampling),
        frequency_penalty: options.frequency_penalty.filter(|_| sampling),
        stream: ctx.stream,
        stream_options: (ctx.stream && dialect.stream_usage).then_some(StreamOptions { include_usage: true }),
        tools,
        tool_choice: options.tool_choice.as_ref().filter(|_| has_tools).map(|c| tool_choice(dialect, c)),
        parallel_tool_calls: options
            .parallel_tool_calls
            .filter(|_| has_tools && ctx.model.supports_parallel_tool_calls),
        response_format,
        reasoning_effort,
    };

    serde_json::to_value(request).map_err(|e| ProviderError::bad_request(format!("failed to encode request: {e}")))
}

pub fn http_request(dialect: &Dialect, config: &ProviderConfig, body: Vec<u8>) -> Result<HttpRequest, ProviderError> {
    let base = config.base_url.as_deref().unwrap_or(dialect.base_url);
    let url = format!("{}/chat/completions", base.trim_end_matches('/'));
    Ok(HttpRequest::json(url, body).with_bearer(config.api_key()?))
}

// --- Response Types ---

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMessage {
    content: Option<ResponseContent>,
    reasoning_content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<ResponseToolCall>>,
    refusal: Option<String>,
}

/// Plain text, or typed chunks as Mistral sends for thinking models.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseContent {
    Text(String),
    Parts(Vec<ResponsePart>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsePart {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: Vec<ThinkingPart>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ThinkingPart {
    #[serde(default)]
    text: String,
}

impl ResponseContent {
    /// `(text, reasoning)`.
    fn split(self) -> (String, String) {
        match self {
            ResponseContent::Text(text) => (text, String::new()),
            ResponseContent::Parts(parts) => {
                let mut text = String::new();
                let mut reasoning = String::new();
                for part in parts {
                    match part {
                        ResponsePart::Text { text: t } => text.push_str(&t),
                        ResponsePart::Thinking { thinking } => {
                            thinking.iter().for_each(|p| reasoning.push_str(&p.text));
                        }
                        ResponsePart::Other => {}
                    }
                }
                (text, reasoning)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    index: Option<u32>,
    id: Option<String>,
    function: Option<ResponseFunction>,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: Option<String>,
    arguments: Option<Value>,
}

impl ResponseFunction {
    /// Arguments are a JSON string; some providers send the object itself.
    fn arguments(&self) -> String {
        match &self.arguments {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<f64>,
    completion_tokens: Option<f64>,
    prompt_tokens_details: Option<PromptTokensDetails>,
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<f64>,
    audio_tokens: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionTokensDetails {
    reasoning_tokens: Option<f64>,
}

impl From<WireUsage> for LLMUsage {
    fn from(usage: WireUsage) -> Self {
        let prompt = usage.prompt_tokens_details.unwrap_or_default();
        let completion = usage.completion_tokens_details.unwrap_or_default();
        LLMUsage {
            prompt_token_count: usage.prompt_tokens,
            prompt_token_count_cached: prompt.cached_tokens,
            completion_token_count: usage.completion_tokens,
            reasoning_token_count: completion.reasoning_tokens.filter(|r| *r > 0.0),
            prompt_audio_token_count: prompt.audio_tokens.filter(|a| *a > 0.0),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
    x_groq: Option<GroqExtension>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GroqExtension {
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: ResponseMessage,
    finish_reason: Option<String>,
}

fn parse_json<'a, T: Deserialize<'a>>(body: &'a str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::unknown(format!("failed to parse response: {e}")))
}

fn tool_deltas(calls: Vec<ResponseToolCall>, raw: &mut RawCompletion) -> Vec<ToolCallRequestDelta> {
    calls
        .into_iter()
        .map(|call| {
            let idx = call.index.unwrap_or_else(|| {
                let idx = raw.next_tool_idx;
                raw.next_tool_idx += 1;
                idx
            });
            ToolCallRequestDelta {
                idx,
                id: call.id,
                tool_name: call.function.as_ref().and_then(|f| f.name.clone()),
                arguments: call.function.as_ref().map(ResponseFunction::arguments).unwrap_or_default(),
            }
        })
        .collect()
}

fn append(target: &mut String, value: &str) {
    target.push_str(value);
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// Turn a message or delta into a parsed increment.
fn parse_message(
    dialect: &Dialect,
    message: ResponseMessage,
    finish_reason: Option<&str>,
    raw: &mut RawCompletion,
) -> ParsedResponse {
    let (content, mut reasoning) = message.content.map(ResponseContent::split).unwrap_or_default();
    for field in [message.reasoning_content, message.reasoning].into_iter().flatten() {
        append(&mut reasoning, &field);
    }

    let mut text = content;
    if dialect.reasoning == ReasoningStyle::Inline {
        let (visible, thought) = raw.think.feed(&text);
        text = visible;
        reasoning.push_str(&thought);
        if finish_reason.is_some() {
            let (visible, thought) = raw.think.flush();
            text.push_str(&visible);
            reasoning.push_str(&thought);
        }
    }

    let mut finish = finish_reason.map(map_finish_reason);
    if message.refusal.is_some_and(|r| !r.is_empty()) {
        finish = Some(FinishReason::ContentFilter);
    }

    ParsedResponse {
        delta: non_empty(text),
        reasoning: non_empty(reasoning),
        tool_calls: tool_deltas(message.tool_calls.unwrap_or_default(), raw),
        usage: None,
        finish_reason: finish,
    }
}

pub fn parse_response(dialect: &Dialect, body: &str, raw: &mut RawCompletion) -> Result<ParsedResponse, ProviderError> {
    let response: CompletionResponse = parse_json(body)?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::unknown("response has no choices"))?;
    let finish = choice.finish_reason.as_deref().or(Some("stop"));
    let mut parsed = parse_message(dialect, choice.message, finish, raw);
    parsed.usage = response.usage.map(LLMUsage::from);
    Ok(parsed)
}

pub fn parse_stream_event(dialect: &Dialect, data: &str, raw: &mut RawCompletion) -> Result<ParsedResponse, ProviderError> {
    let chunk: StreamChunk = parse_json(data)?;
    if let Some(error) = chunk.error {
        return Err(classify_error(dialect, 500, &json!({"error": error}).to_string()));
    }

    let usage = chunk.usage.or(chunk.x_groq.and_then(|x| x.usage)).map(LLMUsage::from);
    let mut parsed = match chunk.choices.into_iter().next() {
        Some(choice) => parse_message(dialect, choice.delta, choice.finish_reason.as_deref(), raw),
        None => ParsedResponse::default(),
    };
    parsed.usage = usage;
    Ok(parsed)
}

/// Flush a partial `<think>` tag held back when the stream ended without a
/// finish reason.
pub fn finish(raw: &mut RawCompletion) -> ParsedResponse {
    let (visible, thought) = raw.think.flush();
    ParsedResponse {
        delta: non_empty(visible),
        reasoning: non_empty(thought),
        ..Default::default()
    }
}

/// Error payload, normalized across the OpenAI-compatible providers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireError {
    pub message: String,
    pub kind: Option<String>,
    pub code: Option<String>,
}

fn value_str(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Accepts `{"error": {...}}`, `{"error": "..."}`, `{"message": ...}` and
/// `{"detail": ...}` shapes, falling back to the raw body.
pub fn parse_error_body(body: &str) -> WireError {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return WireError {
            message: body.to_string(),
            ..Default::default()
        };
    };
    let error = match value.get("error") {
        Some(Value::Object(_)) => value.get("error"),
        _ => Some(&value),
    };
    let error = error.unwrap_or(&value);
    let message = value_str(error.get("message"))
        .or_else(|| value_str(value.get("error")))
        .or_else(|| value_str(value.get("detail")))
        .unwrap_or_else(|| body.to_string());
    WireError {
        message,
        kind: value_str(error.get("type")),
        code: value_str(error.get("code")),
    }
}

/// Rules shared by every Chat Completions provider.
fn classify_common(status: u16, error: &WireError) -> Option<ProviderError> {
    let message = error.message.as_str();
    let lower = message.to_lowercase();
    let code = error.code.as_deref().unwrap_or_default();

    let err = match code {
        "context_length_exceeded" | "string_above_max_length" => ProviderError::max_tokens_exceeded(message),
        "content_policy_violation" | "content_filter" => ProviderError::content_moderation(message),
        "invalid_image_url" | "invalid_image_format" | "image_parse_error" | "invalid_image" => {
            ProviderError::invalid_file(message)
        }
        "model_not_found" => ProviderError::missing_model(message),
        "invalid_api_key" | "insufficient_quota" => {
            ProviderError::new(crate::error::ErrorKind::InvalidProviderConfig, message)
        }
        "rate_limit_exceeded" => ProviderError::rate_limit(message),
        _ if lower.contains("maximum context length") || lower.contains("reduce the length of the messages") => {
            ProviderError::max_tokens_exceeded(message)
        }
        _ if lower.contains("invalid schema for response_format") => {
            ProviderError::new(crate::error::ErrorKind::StructuredGeneration, message)
        }
        _ if lower.contains("does not support") || lower.contains("is not supported with this model") => {
            ProviderError::unsupported_mode(message)
        }
        _ if status == 404 && lower.contains("model") => ProviderError::missing_model(message),
        _ => return None,
    };
    Some(err)
}

pub fn classify_error(dialect: &Dialect, status: u16, body: &str) -> ProviderError {
    let error = parse_error_body(body);
    let specific = match dialect.provider {
        Provider::OpenAi => super::openai::classify(status, &error),
        Provider::Mistral => super::mistral::classify(status, &error),
        Provider::Fireworks => super::fireworks::classify(status, &error),
        Provider::XAi => super::xai::classify(status, &error),
        Provider::Groq => super::groq::classify(status, &error),
        _ => None,
    };
    specific
        .or_else(|| classify_common(status, &error))
        .unwrap_or_else(|| classify_status(status, error.message))
}

/// Splits `<think>...</think>` sections out of streamed text.
///
/// Tags may be split across chunks; a trailing partial tag is held back
/// until the next chunk decides it.
#[derive(Debug, Default)]
pub struct ThinkTagSplitter {
    in_think: bool,
    pending: String,
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

impl ThinkTagSplitter {
    /// Feed text and get back `(visible, reasoning)`.
    pub fn feed(&mut self, chunk: &str) -> (String, String) {
        self.pending.push_str(chunk);
        let mut visible = String::new();
        let mut reasoning = String::new();

        loop {
            let tag = if self.in_think { THINK_CLOSE } else { THINK_OPEN };
            let target = if self.in_think { &mut reasoning } else { &mut visible };
            if let Some(pos) = self.pending.find(tag) {
                target.push_str(&self.pending[..pos]);
                self.pending.drain(..pos + tag.len());
                self.in_think = !self.in_think;
                continue;
            }
            let keep = partial_suffix(&self.pending, tag);
            let flush_to = self.pending.len() - keep;
            target.push_str(&self.pending[..flush_to]);
            self.pending.drain(..flush_to);
            break;
        }
        (visible, reasoning)
    }

    /// Release anything held back.
    pub fn flush(&mut self) -> (String, String) {
        let rest = std::mem::take(&mut self.pending);
        if self.in_think {
            (String::new(), rest)
        } else {
            (rest, String::new())
        }
    }
}

/// Length of the longest suffix of `text` that is a strict prefix of `tag`.
fn partial_suffix(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&len| text.ends_with(&tag[..len]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, ToolCallRequest, ToolCallResult};
    use crate::options::ProviderOptions;
    use crate::providers::tests::{weather_tool, with_context};
    use crate::providers::{groq, mistral, openai, xai};

    fn build(provider: Provider, messages: &[Message], options: &ProviderOptions, stream: bool) -> Value {
        with_context(provider, messages, options, stream, |ctx| provider.kit().build_request(ctx)).unwrap()
    }

    fn tool_turns() -> Vec<Message> {
        let input = json!({"city": "Paris"}).as_object().cloned().unwrap();
        vec![
            Message::user("Weather?"),
            Message::new(
                Role::Assistant,
                vec![MessageContent::ToolCallRequest(ToolCallRequest {
                    id: "call_abc123XYZ_long".to_string(),
                    tool_name: "get_weather".to_string(),
                    tool_input: input.clone(),
                    index: None,
                })],
            ),
            Message::new(
                Role::User,
                vec![MessageContent::ToolCallResult(ToolCallResult {
                    id: "call_abc123XYZ_long".to_string(),
                    tool_name: "get_weather".to_string(),
                    tool_input: input,
                    result: "sunny".to_string(),
                    is_error: false,
                })],
            ),
        ]
    }

    #[test]
    fn test_openai_request_shape() {
        let messages = tool_turns();
        let options = ProviderOptions::new("gpt-4o")
            .with_tools(vec![weather_tool()])
            .with_temperature(0.3)
            .with_tool_choice(ToolChoice::Required);
        let body = build(Provider::OpenAi, &messages, &options, true);

        assert_eq!(body["model"], "gpt-4o-2024-11-20");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["tool_choice"], "required");
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["arguments"], "{\"city\":\"Paris\"}");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][2]["tool_call_id"], "call_abc123XYZ_long");
        assert!(body.get("max_completion_tokens").is_none());
        assert!(body["tools"][0]["function"].get("output_schema").is_none());
        let temperature = body["temperature"].as_f64().unwrap();
        assert!((temperature - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_openai_reasoning_model_drops_sampling() {
        let messages = [Message::user("think")];
        let options = ProviderOptions::new("o3")
            .with_temperature(0.5)
            .with_max_tokens(1_000)
            .with_reasoning_budget(4_000);
        let body = build(Provider::OpenAi, &messages, &options, false);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["reasoning_effort"], "low");
        assert_eq!(body["max_completion_tokens"], 5_000);
    }

    #[test]
    fn test_json_schema_response_format() {
        let messages = [Message::user("extract")];
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        let options = ProviderOptions::new("gpt-4o")
            .with_output_schema(schema.clone(), true)
            .with_task_name("extract");
        let body = build(Provider::OpenAi, &messages, &options, false);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["schema"], schema);
        assert_eq!(body["response_format"]["json_schema"]["name"], schema_name(Some("extract"), &schema));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_json_object_mode_adds_instruction() {
        let messages = [Message::user("extract")];
        let options = ProviderOptions::new("mistral-large-2-2407").with_output_schema(json!({"type": "object"}), false);
        let body = build(Provider::Mistral, &messages, &options, false);
        assert_eq!(body["model"], "mistral-large-2407");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][0]["content"].as_str().unwrap().contains("JSON"));
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_mistral_normalizes_tool_ids() {
        let messages = tool_turns();
        let options = ProviderOptions::new("mistral-large-2-2407").with_tools(vec![weather_tool()]);
        let body = build(Provider::Mistral, &messages, &options, false);
        let call_id = body["messages"][1]["tool_calls"][0]["id"].as_str().unwrap();
        assert_eq!(call_id.len(), 9);
        assert!(call_id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(body["messages"][2]["tool_call_id"], call_id);
        assert_eq!(normalize_tool_id("abcDEF123"), "abcDEF123");
        assert_eq!(mistral::DIALECT.required_tool_choice, "any");
    }

    #[test]
    fn test_xai_effort_low_high() {
        let messages = [Message::user("hi")];
        let options = ProviderOptions::new("grok-3-mini-beta").with_reasoning_effort(ReasoningEffort::Medium);
        let body = build(Provider::XAi, &messages, &options, false);
        assert_eq!(body["reasoning_effort"], "low");
        assert_eq!(xai::DIALECT.effort_name(ReasoningEffort::High), Some("high"));
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let body = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 5, "prompt_tokens_details": {"cached_tokens": 10}}
        }"#;
        let mut raw = RawCompletion::new();
        let parsed = parse_response(&openai::DIALECT, body, &mut raw).unwrap();
        assert_eq!(parsed.delta, None);
        assert_eq!(parsed.tool_calls[0].idx, 0);
        assert_eq!(parsed.tool_calls[0].arguments, "{\"city\":\"Paris\"}");
        assert_eq!(parsed.finish_reason, Some(FinishReason::Stop));
        let usage = parsed.usage.unwrap();
        assert_eq!(usage.prompt_token_count, Some(20.0));
        assert_eq!(usage.prompt_token_count_cached, Some(10.0));
    }

    #[test]
    fn test_parse_response_mistral_thinking_chunks() {
        let body = r#"{"choices":[{"message":{"content":[{"type":"thinking","thinking":[{"type":"text","text":"hmm"}]},{"type":"text","text":"42"}]},"finish_reason":"stop"}]}"#;
        let parsed = parse_response(&mistral::DIALECT, body, &mut RawCompletion::new()).unwrap();
        assert_eq!(parsed.delta.as_deref(), Some("42"));
        assert_eq!(parsed.reasoning.as_deref(), Some("hmm"));
    }

    #[test]
    fn test_parse_stream_events() {
        let mut raw = RawCompletion::new();
        let dialect = openai::DIALECT;
        let first = parse_stream_event(
            &dialect,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_weather","arguments":""}}]}}]}"#,
            &mut raw,
        )
        .unwrap();
        assert_eq!(first.tool_calls[0].tool_name.as_deref(), Some("get_weather"));

        let second = parse_stream_event(
            &dialect,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"ci"}}]}}]}"#,
            &mut raw,
        )
        .unwrap();
        assert_eq!(second.tool_calls[0].arguments, "{\"ci");
        assert_eq!(second.tool_calls[0].id, None);

        let usage_only = parse_stream_event(
            &dialect,
            r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#,
            &mut raw,
        )
        .unwrap();
        assert!(!usage_only.is_empty());
        assert!(!usage_only.has_content());
    }

    #[test]
    fn test_groq_usage_in_extension() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"x_groq":{"usage":{"prompt_tokens":7,"completion_tokens":2}}}"#;
        let parsed = parse_stream_event(&groq::DIALECT, data, &mut RawCompletion::new()).unwrap();
        assert_eq!(parsed.usage.unwrap().prompt_token_count, Some(7.0));
        assert_eq!(parsed.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_stream_error_chunk() {
        let data = r#"{"error":{"message":"The server had an error","type":"server_error"}}"#;
        let err = parse_stream_event(&openai::DIALECT, data, &mut RawCompletion::new()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Internal);
    }

    #[test]
    fn test_refusal_is_content_filter() {
        let body = r#"{"choices":[{"message":{"content":null,"refusal":"I can't help with that"},"finish_reason":"stop"}]}"#;
        let parsed = parse_response(&openai::DIALECT, body, &mut RawCompletion::new()).unwrap();
        assert_eq!(parsed.finish_reason, Some(FinishReason::ContentFilter));
    }

    #[test]
    fn test_stream_without_finish_reason_keeps_partial_tag() {
        let mut raw = RawCompletion::new();
        let mut text = String::new();
        for data in [
            r#"{"choices":[{"index":0,"delta":{"content":"<think>hmm</think>x "}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"is <"}}]}"#,
        ] {
            let parsed = parse_stream_event(&groq::DIALECT, data, &mut raw).unwrap();
            text.push_str(parsed.delta.as_deref().unwrap_or_default());
        }
        assert_eq!(text, "x is ");

        let kit = Provider::Groq.kit();
        let tail = kit.finish(&mut raw);
        assert_eq!(tail.delta.as_deref(), Some("<"));
        assert!(tail.reasoning.is_none());
        assert!(kit.finish(&mut raw).is_empty());
    }

    #[test]
    fn test_think_tags_across_chunks() {
        let mut splitter = ThinkTagSplitter::default();
        let mut visible = String::new();
        let mut reasoning = String::new();
        for chunk in ["<thi", "nk>let me ", "think</th", "ink>The answer", " is 4<", "b>"] {
            let (v, r) = splitter.feed(chunk);
            visible.push_str(&v);
            reasoning.push_str(&r);
        }
        let (v, r) = splitter.flush();
        visible.push_str(&v);
        reasoning.push_str(&r);
        assert_eq!(reasoning, "let me think");
        assert_eq!(visible, "The answer is 4<b>");
    }

    #[test]
    fn test_parse_error_body_shapes() {
        let openai = parse_error_body(r#"{"error":{"message":"bad","type":"invalid_request_error","code":"context_length_exceeded"}}"#);
        assert_eq!(openai.code.as_deref(), Some("context_length_exceeded"));
        assert_eq!(openai.message, "bad");

        let xai = parse_error_body(r#"{"code":"Client specified an invalid argument","error":"Model not found"}"#);
        assert_eq!(xai.message, "Model not found");

        let plain = parse_error_body("upstream connect error");
        assert_eq!(plain.message, "upstream connect error");
    }

    #[test]
    fn test_classify_common_rules() {
        let err = classify_error(
            &openai::DIALECT,
            400,
            r#"{"error":{"message":"This model's maximum context length is 128000 tokens","code":"context_length_exceeded"}}"#,
        );
        assert_eq!(err.kind, crate::error::ErrorKind::MaxTokensExceeded);
        assert!(!err.capture());

        let err = classify_error(&groq::DIALECT, 503, "<html>down</html>");
        assert_eq!(err.kind, crate::error::ErrorKind::Unavailable);
    }
}
