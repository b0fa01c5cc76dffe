//! Amazon Bedrock Converse API.
//!
//! Requests authenticate with a Bedrock API key as a bearer token. Streaming
//! responses use the AWS binary event-stream framing, decoded in
//! [`crate::eventstream`]; each frame's `:event-type` header selects how its
//! JSON payload is read.

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use serde_with::skip_serializing_none;

use super::{
    classify_status, inline_data, map_finish_reason, reasoning_budget, resolve_max_tokens, sampling_allowed,
    system_prompt, BuildContext, StreamPayload, StructuredMode,
};
use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ProviderError};
use crate::eventstream::EventStreamMessage;
use crate::http::HttpRequest;
use crate::model::{File, MessageContent, ParsedResponse, Role, ToolCallRequestDelta, ToolChoice};
use crate::usage::LLMUsage;

const MIN_THINKING_BUDGET: u32 = 1024;

// --- Request Types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConverseRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<SystemBlock>,
    messages: Vec<WireMessage>,
    inference_config: InferenceConfig,
    tool_config: Option<ToolConfig>,
    additional_model_request_fields: Option<Value>,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    text: String,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<Block>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Block {
    Text(String),
    Image(ImageBlock),
    Document(DocumentBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

#[derive(Debug, Serialize)]
struct BytesSource {
    bytes: String,
}

#[derive(Debug, Serialize)]
struct ImageBlock {
    format: String,
    source: BytesSource,
}

#[derive(Debug, Serialize)]
struct DocumentBlock {
    format: String,
    name: String,
    source: BytesSource,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseBlock {
    tool_use_id: String,
    name: String,
    input: Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResultBlock {
    tool_use_id: String,
    content: Vec<Value>,
    status: &'static str,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceConfig {
    max_tokens: u32,
    temperature: Option<f32>,
    top_p: Option<f32>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    tools: Vec<Value>,
    tool_choice: Option<Value>,
}

/// Bedrock only accepts inline bytes; the payload is checked to be valid base64.
fn file_bytes(file: &File) -> Result<(String, String), ProviderError> {
    let (mime, data) = inline_data(file)
        .ok_or_else(|| ProviderError::invalid_file("Bedrock only accepts inline file data, not URLs"))?;
    BASE64_STANDARD
        .decode(data.as_bytes())
        .map_err(|e| ProviderError::invalid_file(format!("file data is not valid base64: {e}")))?;
    let format = mime.rsplit('/').next().unwrap_or_default().to_string();
    Ok((format, data))
}

fn file_block(file: &File, position: usize) -> Result<Block, ProviderError> {
    let (format, bytes) = file_bytes(file)?;
    let source = BytesSource { bytes };
    Ok(if file.is_pdf() {
        Block::Document(DocumentBlock {
            format,
            name: format!("document-{position}"),
            source,
        })
    } else {
        Block::Image(ImageBlock { format, source })
    })
}

fn build_messages(ctx: &BuildContext<'_>) -> Result<Vec<WireMessage>, ProviderError> {
    let mut messages = Vec::new();
    let mut file_count = 0;
    for message in ctx.messages.iter().filter(|m| m.role != Role::System) {
        let mut blocks = Vec::new();
        for content in &message.content {
            let block = match content {
                MessageContent::Text(text) if text.is_empty() => continue,
                MessageContent::Text(text) => Block::Text(text.clone()),
                MessageContent::File(file) => {
                    file_count += 1;
                    file_block(file, file_count)?
                }
                MessageContent::ToolCallRequest(request) => Block::ToolUse(ToolUseBlock {
                    tool_use_id: request.id.clone(),
                    name: request.tool_name.clone(),
                    input: request.tool_input.clone(),
                }),
                MessageContent::ToolCallResult(result) => Block::ToolResult(ToolResultBlock {
                    tool_use_id: result.id.clone(),
                    content: vec![json!({ "text": result.result })],
                    status: if result.is_error { "error" } else { "success" },
                }),
            };
            blocks.push(block);
        }
        if blocks.is_empty() {
            continue;
        }
        let role = match message.role {
            Role::Assistant => "assistant",
            _ => "user",
        };
        messages.push(WireMessage { role, content: blocks });
    }
    Ok(messages)
}

fn tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Auto => Some(json!({"auto": {}})),
        // Converse has no "none"; leaving it unset falls back to auto.
        ToolChoice::None => None,
        ToolChoice::Required => Some(json!({"any": {}})),
        ToolChoice::Function(name) => Some(json!({"tool": {"name": name}})),
    }
}

pub fn build_request(ctx: BuildContext<'_>) -> Result<Value, ProviderError> {
    let options = ctx.options;
    let budget = reasoning_budget(options, ctx.model).filter(|b| *b > 0);
    let max_tokens = resolve_max_tokens(options, ctx.model, budget);
    let thinking_budget = budget
        .map(|b| b.min(max_tokens.saturating_sub(1)))
        .filter(|b| *b >= MIN_THINKING_BUDGET);
    let sampling = sampling_allowed(ctx.model) && thinking_budget.is_none();

    let tool_config = (!options.enabled_tools.is_empty()).then(|| ToolConfig {
        tools: options
            .enabled_tools
            .iter()
            .map(|tool| {
                let mut spec = json!({
                    "name": tool.name,
                    "inputSchema": {"json": tool.input_schema},
                });
                if let Some(description) = tool.wire_description() {
                    spec["description"] = json!(description);
                }
                json!({ "toolSpec": spec })
            })
            .collect(),
        tool_choice: options.tool_choice.as_ref().and_then(tool_choice),
    });

    let request = ConverseRequest {
        system: system_prompt(&ctx, StructuredMode::Disabled)
            .map(|text| vec![SystemBlock { text }])
            .unwrap_or_default(),
        messages: build_messages(&ctx)?,
        inference_config: InferenceConfig {
            max_tokens,
            temperature: options.temperature.filter(|_| sampling),
            top_p: options.top_p.filter(|_| sampling),
        },
        tool_config,
        additional_model_request_fields: thinking_budget
            .map(|b| json!({"thinking": {"type": "enabled", "budget_tokens": b}})),
    };

    serde_json::to_value(request).map_err(|e| ProviderError::bad_request(format!("failed to encode request: {e}")))
}

/// Model ids and ARNs go in the path with `:` and `/` escaped.
fn encode_model_id(model: &str) -> String {
    model.replace(':', "%3A").replace('/', "%2F")
}

pub fn http_request(
    config: &ProviderConfig,
    wire_model: &str,
    body: Vec<u8>,
    stream: bool,
) -> Result<HttpRequest, ProviderError> {
    let base = config
        .base_url
        .clone()
        .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", config.bedrock_region()));
    let action = if stream { "converse-stream" } else { "converse" };
    let url = format!("{}/model/{}/{action}", base.trim_end_matches('/'), encode_model_id(wire_model));
    Ok(HttpRequest::json(url, body).with_bearer(config.api_key()?))
}

// --- Response Types ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    input_tokens: Option<f64>,
    output_tokens: Option<f64>,
    cache_read_input_tokens: Option<f64>,
    cache_write_input_tokens: Option<f64>,
}

impl From<WireUsage> for LLMUsage {
    fn from(usage: WireUsage) -> Self {
        let prompt = match (usage.input_tokens, usage.cache_read_input_tokens, usage.cache_write_input_tokens) {
            (None, None, None) => None,
            (input, read, write) => Some(input.unwrap_or(0.0) + read.unwrap_or(0.0) + write.unwrap_or(0.0)),
        };
        LLMUsage {
            prompt_token_count: prompt,
            prompt_token_count_cached: usage.cache_read_input_tokens,
            completion_token_count: usage.output_tokens,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUse {
    tool_use_id: String,
    name: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReasoningText {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReasoningContent {
    reasoning_text: Option<ReasoningText>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlock {
    text: Option<String>,
    reasoning_content: Option<ReasoningContent>,
    tool_use: Option<ToolUse>,
}

#[derive(Debug, Deserialize)]
struct OutputMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct Output {
    message: Option<OutputMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseResponse {
    output: Option<Output>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

fn parse_json<'a, T: Deserialize<'a>>(body: &'a str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::unknown(format!("failed to parse response: {e}")))
}

pub fn parse_response(body: &str) -> Result<ParsedResponse, ProviderError> {
    let response: ConverseResponse = parse_json(body)?;
    let blocks = response
        .output
        .and_then(|o| o.message)
        .map(|m| m.content)
        .unwrap_or_default();

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        if let Some(t) = block.text {
            text.push_str(&t);
        }
        if let Some(r) = block.reasoning_content.and_then(|r| r.reasoning_text) {
            reasoning.push_str(&r.text);
        }
        if let Some(tool) = block.tool_use {
            tool_calls.push(ToolCallRequestDelta {
                idx: tool_calls.len() as u32,
                id: Some(tool.tool_use_id),
                tool_name: Some(tool.name),
                arguments: if tool.input.is_null() { String::new() } else { tool.input.to_string() },
            });
        }
    }

    Ok(ParsedResponse {
        delta: (!text.is_empty()).then_some(text),
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls,
        usage: response.usage.map(LLMUsage::from),
        finish_reason: Some(map_finish_reason(response.stop_reason.as_deref().unwrap_or("end_turn"))),
    })
}

// --- Stream Types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockStart {
    #[serde(default)]
    content_block_index: u32,
    start: Option<StartBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    tool_use: Option<ToolUseStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseStart {
    tool_use_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockDelta {
    #[serde(default)]
    content_block_index: u32,
    delta: DeltaBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaBody {
    text: Option<String>,
    tool_use: Option<ToolInputDelta>,
    reasoning_content: Option<ReasoningDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolInputDelta {
    #[serde(default)]
    input: String,
}

#[derive(Debug, Deserialize)]
struct ReasoningDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStop {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    usage: Option<WireUsage>,
}

/// Convert a decoded frame into a [`StreamPayload`].
///
/// Exception frames keep their exception type as the event type so the
/// parser can classify them.
pub fn stream_payload(message: &EventStreamMessage) -> StreamPayload {
    StreamPayload {
        event_type: message
            .exception_type()
            .or_else(|| message.event_type())
            .map(str::to_string),
        data: String::from_utf8_lossy(&message.payload).into_owned(),
    }
}

fn exception_status(exception: &str) -> u16 {
    match exception {
        "throttlingException" | "ThrottlingException" => 429,
        "validationException" | "ValidationException" => 400,
        "serviceUnavailableException" | "ServiceUnavailableException" => 503,
        "modelTimeoutException" | "ModelTimeoutException" => 408,
        _ => 500,
    }
}

pub fn parse_stream_event(payload: &StreamPayload) -> Result<ParsedResponse, ProviderError> {
    let event_type = payload.event_type.as_deref().unwrap_or_default();
    let data = payload.data.as_str();

    let parsed = match event_type {
        "contentBlockStart" => {
            let start: BlockStart = parse_json(data)?;
            match start.start.and_then(|s| s.tool_use) {
                Some(tool) => ParsedResponse {
                    tool_calls: vec![ToolCallRequestDelta {
                        idx: start.content_block_index,
                        id: Some(tool.tool_use_id),
                        tool_name: Some(tool.name),
                        arguments: String::new(),
                    }],
                    ..Default::default()
                },
                None => ParsedResponse::default(),
            }
        }
        "contentBlockDelta" => {
            let delta: BlockDelta = parse_json(data)?;
            let body = delta.delta;
            ParsedResponse {
                delta: body.text,
                reasoning: body.reasoning_content.and_then(|r| r.text),
                tool_calls: body
                    .tool_use
                    .map(|t| ToolCallRequestDelta {
                        idx: delta.content_block_index,
                        arguments: t.input,
                        ..Default::default()
                    })
                    .into_iter()
                    .collect(),
                ..Default::default()
            }
        }
        "messageStop" => {
            let stop: MessageStop = parse_json(data)?;
            ParsedResponse {
                finish_reason: stop.stop_reason.as_deref().map(map_finish_reason),
                ..Default::default()
            }
        }
        "metadata" => {
            let metadata: Metadata = parse_json(data)?;
            ParsedResponse {
                usage: metadata.usage.map(LLMUsage::from),
                ..Default::default()
            }
        }
        exception if exception.ends_with("Exception") => {
            return Err(classify_error(exception_status(exception), Some(exception), data));
        }
        _ => ParsedResponse::default(),
    };
    Ok(parsed)
}

// --- Errors ---

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "Message")]
    message: String,
    #[serde(rename = "__type")]
    kind: Option<String>,
}

/// Classify a Converse error. `exception` comes from the stream frame or the
/// `x-amzn-errortype` header; otherwise the body's `__type` is used.
pub fn classify_error(status: u16, exception: Option<&str>, body: &str) -> ProviderError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.message.is_empty() { body } else { parsed.message.as_str() };
    let exception = exception
        .map(str::to_string)
        .or(parsed.kind)
        .map(|k| {
            // `com.amazon...#ValidationException` or `ValidationException:http://...`
            let k = k.rsplit('#').next().unwrap_or_default();
            k.split(':').next().unwrap_or_default().to_ascii_lowercase()
        })
        .unwrap_or_default();
    let lower = message.to_lowercase();

    match exception.as_str() {
        "throttlingexception" => ProviderError::rate_limit(message),
        "servicequotaexceededexception" => ProviderError::rate_limit(message),
        "modeltimeoutexception" => ProviderError::timeout(message),
        "serviceunavailableexception" | "modelnotreadyexception" => ProviderError::unavailable(message),
        "accessdeniedexception" | "unrecognizedclientexception" => {
            ProviderError::new(ErrorKind::InvalidProviderConfig, message)
        }
        "resourcenotfoundexception" => ProviderError::missing_model(message),
        "internalserverexception" | "modelstreamerrorexception" => ProviderError::internal(message),
        "validationexception" => {
            if lower.contains("too long") || lower.contains("too many input tokens") {
                ProviderError::max_tokens_exceeded(message)
            } else if lower.contains("max_tokens") {
                ProviderError::max_tokens_exceeded(message).with_capture(true)
            } else if lower.contains("model identifier is invalid") {
                ProviderError::missing_model(message)
            } else if lower.contains("doesn't support") || lower.contains("does not support") {
                ProviderError::unsupported_mode(message)
            } else if lower.contains("image") || lower.contains("document") {
                ProviderError::invalid_file(message)
            } else {
                ProviderError::bad_request(message)
            }
        }
        _ => classify_status(status, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventstream::tests::{encode_frame, event};
    use crate::eventstream::EventStreamDecoder;
    use crate::model::{FinishReason, Message, ToolCallRequest, ToolCallResult};
    use crate::options::{ProviderOptions, ReasoningEffort};
    use crate::providers::tests::{weather_tool, with_context};
    use crate::providers::Provider;

    fn build(messages: &[Message], options: &ProviderOptions) -> Result<Value, ProviderError> {
        with_context(Provider::AmazonBedrock, messages, options, false, |ctx| {
            Provider::AmazonBedrock.kit().build_request(ctx)
        })
    }

    #[test]
    fn test_converse_body() {
        let input = json!({"city": "Paris"}).as_object().cloned().unwrap();
        let messages = vec![
            Message::system("Be terse."),
            Message::new(
                Role::User,
                vec![
                    MessageContent::Text("What is this?".to_string()),
                    MessageContent::File(File::from_base64("aGVsbG8=", "image/png")),
                ],
            ),
            Message::new(
                Role::Assistant,
                vec![MessageContent::ToolCallRequest(ToolCallRequest {
                    id: "tooluse_1".to_string(),
                    tool_name: "get_weather".to_string(),
                    tool_input: input.clone(),
                    index: None,
                })],
            ),
            Message::new(
                Role::User,
                vec![MessageContent::ToolCallResult(ToolCallResult {
                    id: "tooluse_1".to_string(),
                    tool_name: "get_weather".to_string(),
                    tool_input: input,
                    result: "sunny".to_string(),
                    is_error: false,
                })],
            ),
        ];
        let options = ProviderOptions::new("claude-sonnet-4")
            .with_tools(vec![weather_tool()])
            .with_tool_choice(ToolChoice::Required)
            .with_temperature(0.2);
        let body = build(&messages, &options).unwrap();

        assert_eq!(body["system"][0]["text"], "Be terse.");
        assert_eq!(body["messages"][0]["content"][0]["text"], "What is this?");
        assert_eq!(body["messages"][0]["content"][1]["image"]["format"], "png");
        assert_eq!(body["messages"][0]["content"][1]["image"]["source"]["bytes"], "aGVsbG8=");
        assert_eq!(body["messages"][1]["content"][0]["toolUse"]["toolUseId"], "tooluse_1");
        assert_eq!(body["messages"][2]["content"][0]["toolResult"]["status"], "success");
        assert_eq!(body["toolConfig"]["tools"][0]["toolSpec"]["inputSchema"]["json"]["type"], "object");
        assert_eq!(body["toolConfig"]["toolChoice"], json!({"any": {}}));
        assert_eq!(body["inferenceConfig"]["maxTokens"], 64_000);
        assert!(body["inferenceConfig"].get("temperature").is_some());
    }

    #[test]
    fn test_thinking_in_additional_fields() {
        let messages = [Message::user("hi")];
        let options = ProviderOptions::new("claude-sonnet-4")
            .with_max_tokens(1_000)
            .with_temperature(0.2)
            .with_reasoning_effort(ReasoningEffort::Medium);
        let body = build(&messages, &options).unwrap();
        assert_eq!(body["additionalModelRequestFields"]["thinking"]["budget_tokens"], 32_000);
        assert_eq!(body["inferenceConfig"]["maxTokens"], 33_000);
        assert!(body["inferenceConfig"].get("temperature").is_none());
    }

    #[test]
    fn test_url_files_rejected() {
        let messages = [Message::new(
            Role::User,
            vec![MessageContent::File(File {
                content_type: Some("image/png".to_string()),
                ..File::from_url("https://example.com/cat.png")
            })],
        )];
        let err = build(&messages, &ProviderOptions::new("claude-sonnet-4")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFile);

        let messages = [Message::new(
            Role::User,
            vec![MessageContent::File(File::from_base64("not base64!", "image/png"))],
        )];
        let err = build(&messages, &ProviderOptions::new("claude-sonnet-4")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFile);
    }

    #[test]
    fn test_model_id_escaped_in_url() {
        let config = ProviderConfig::new(Provider::AmazonBedrock)
            .with_api_key("key")
            .with_region("eu-west-1");
        let request = http_request(&config, "us.anthropic.claude-sonnet-4-20250514-v1:0", vec![], true).unwrap();
        assert_eq!(
            request.url,
            "https://bedrock-runtime.eu-west-1.amazonaws.com/model/us.anthropic.claude-sonnet-4-20250514-v1%3A0/converse-stream"
        );
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "output": {"message": {"role": "assistant", "content": [
                {"reasoningContent": {"reasoningText": {"text": "hmm", "signature": "s"}}},
                {"text": "Checking"},
                {"toolUse": {"toolUseId": "tooluse_1", "name": "get_weather", "input": {"city": "Paris"}}}
            ]}},
            "stopReason": "tool_use",
            "usage": {"inputTokens": 10, "outputTokens": 4, "totalTokens": 14, "cacheReadInputTokens": 2}
        }"#;
        let parsed = parse_response(body).unwrap();
        assert_eq!(parsed.delta.as_deref(), Some("Checking"));
        assert_eq!(parsed.reasoning.as_deref(), Some("hmm"));
        assert_eq!(parsed.tool_calls[0].id.as_deref(), Some("tooluse_1"));
        assert_eq!(parsed.finish_reason, Some(FinishReason::Stop));
        assert_eq!(parsed.usage.unwrap().prompt_token_count, Some(12.0));
    }

    #[test]
    fn test_stream_frames() {
        let mut bytes = event("messageStart", r#"{"role":"assistant"}"#);
        bytes.extend(event("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":"Hel"}}"#));
        bytes.extend(event(
            "contentBlockStart",
            r#"{"contentBlockIndex":1,"start":{"toolUse":{"toolUseId":"t1","name":"get_weather"}}}"#,
        ));
        bytes.extend(event("contentBlockDelta", r#"{"contentBlockIndex":1,"delta":{"toolUse":{"input":"{\"city\":"}}}"#));
        bytes.extend(event("messageStop", r#"{"stopReason":"max_tokens"}"#));
        bytes.extend(event("metadata", r#"{"usage":{"inputTokens":3,"outputTokens":7},"metrics":{"latencyMs":10}}"#));

        let parsed: Vec<ParsedResponse> = EventStreamDecoder::new()
            .feed(&bytes)
            .unwrap()
            .iter()
            .map(|m| parse_stream_event(&stream_payload(m)).unwrap())
            .collect();

        assert!(parsed[0].is_empty());
        assert_eq!(parsed[1].delta.as_deref(), Some("Hel"));
        assert_eq!(parsed[2].tool_calls[0].tool_name.as_deref(), Some("get_weather"));
        assert_eq!(parsed[3].tool_calls[0].idx, 1);
        assert_eq!(parsed[3].tool_calls[0].arguments, "{\"city\":");
        assert_eq!(parsed[4].finish_reason, Some(FinishReason::MaxContext));
        assert_eq!(parsed[5].usage.as_ref().unwrap().completion_token_count, Some(7.0));
    }

    #[test]
    fn test_stream_exception_frame() {
        let bytes = encode_frame(
            &[(":message-type", "exception"), (":exception-type", "throttlingException")],
            br#"{"message":"Too many requests, please wait before trying again."}"#,
        );
        let messages = EventStreamDecoder::new().feed(&bytes).unwrap();
        let err = parse_stream_event(&stream_payload(&messages[0])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimit);
    }

    #[test]
    fn test_classify_errors() {
        let overflow = classify_error(400, Some("ValidationException"), r#"{"message":"Input is too long for requested model."}"#);
        assert_eq!(overflow.kind, ErrorKind::MaxTokensExceeded);
        assert!(!overflow.capture());

        let rejected = classify_error(
            400,
            Some("ValidationException"),
            r#"{"message":"max_tokens must be less than or equal to 64000"}"#,
        );
        assert_eq!(rejected.kind, ErrorKind::MaxTokensExceeded);
        assert!(rejected.capture());

        assert_eq!(
            classify_error(400, None, r#"{"__type":"com.amazon.coral#ValidationException","message":"The provided model identifier is invalid."}"#).kind,
            ErrorKind::MissingModel
        );
        assert_eq!(
            classify_error(403, None, r#"{"Message":"User is not authorized"}"#).kind,
            ErrorKind::InvalidProviderConfig
        );
        assert_eq!(
            classify_error(424, Some("modelStreamErrorException"), r#"{"message":"boom"}"#).kind,
            ErrorKind::Internal
        );
    }
}
