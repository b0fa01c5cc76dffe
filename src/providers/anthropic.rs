//! Anthropic Messages API.
//!
//! See: <https://docs.anthropic.com/en/api/messages>

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use serde_with::skip_serializing_none;

use super::{
    classify_status, inline_data, map_finish_reason, reasoning_budget, resolve_max_tokens, sampling_allowed,
    system_prompt, BuildContext, StructuredMode,
};
use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ProviderError};
use crate::http::HttpRequest;
use crate::model::{File, MessageContent, ParsedResponse, Role, ToolCallRequestDelta, ToolChoice};
use crate::usage::LLMUsage;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Smallest thinking budget the API accepts.
const MIN_THINKING_BUDGET: u32 = 1024;

// --- Request Types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: Option<String>,
    messages: Vec<WireMessage>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    tool_choice: Option<Value>,
    thinking: Option<Thinking>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<Block>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    Image {
        source: Source,
    },
    Document {
        source: Source,
    },
    ToolUse {
        id: String,
        name: String,
        input: Map<String, Value>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: Option<bool>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Source {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: Option<String>,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct Thinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

fn file_block(file: &File) -> Result<Block, ProviderError> {
    let source = match inline_data(file) {
        Some((media_type, data)) => Source::Base64 { media_type, data },
        None => Source::Url {
            url: file
                .url
                .clone()
                .ok_or_else(|| ProviderError::bad_request("file has neither a url nor data"))?,
        },
    };
    Ok(if file.is_pdf() {
        Block::Document { source }
    } else {
        Block::Image { source }
    })
}

fn build_messages(ctx: &BuildContext<'_>) -> Result<Vec<WireMessage>, ProviderError> {
    let mut messages = Vec::new();
    for message in ctx.messages.iter().filter(|m| m.role != Role::System) {
        let mut blocks = Vec::new();
        let mut results = Vec::new();
        for content in &message.content {
            match content {
                MessageContent::Text(text) if text.is_empty() => {}
                MessageContent::Text(text) => blocks.push(Block::Text { text: text.clone() }),
                MessageContent::File(file) => blocks.push(file_block(file)?),
                MessageContent::ToolCallRequest(request) => blocks.push(Block::ToolUse {
                    id: request.id.clone(),
                    name: request.tool_name.clone(),
                    input: request.tool_input.clone(),
                }),
                MessageContent::ToolCallResult(result) => results.push(Block::ToolResult {
                    tool_use_id: result.id.clone(),
                    content: result.result.clone(),
                    is_error: result.is_error.then_some(true),
                }),
            }
        }

        match message.role {
            Role::Assistant => {
                if !blocks.is_empty() {
                    messages.push(WireMessage {
                        role: "assistant",
                        content: blocks,
                    });
                }
                if !results.is_empty() {
                    messages.push(WireMessage {
                        role: "user",
                        content: results,
                    });
                }
            }
            _ => {
                // Tool results must lead the user turn.
                results.extend(blocks);
                if !results.is_empty() {
                    messages.push(WireMessage {
                        role: "user",
                        content: results,
                    });
                }
            }
        }
    }
    Ok(messages)
}

fn tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::None => json!({"type": "none"}),
        ToolChoice::Required => json!({"type": "any"}),
        ToolChoice::Function(name) => json!({"type": "tool", "name": name}),
    }
}

pub fn build_request(ctx: BuildContext<'_>) -> Result<Value, ProviderError> {
    let options = ctx.options;
    let budget = reasoning_budget(options, ctx.model).filter(|b| *b > 0);
    let max_tokens = resolve_max_tokens(options, ctx.model, budget);

    // The budget has to stay below max_tokens.
    let thinking = budget
        .map(|b| b.min(max_tokens.saturating_sub(1)))
        .filter(|b| *b >= MIN_THINKING_BUDGET)
        .map(|budget_tokens| Thinking {
            kind: "enabled",
            budget_tokens,
        });
    let sampling = sampling_allowed(ctx.model) && thinking.is_none();

    let tools: Vec<WireTool> = options
        .enabled_tools
        .iter()
        .map(|tool| WireTool {
            name: tool.name.clone(),
            description: tool.wire_description().map(str::to_string),
            input_schema: tool.input_schema.clone(),
        })
        .collect();

    let request = MessagesRequest {
        model: ctx.provider_data.wire_model.clone(),
        max_tokens,
        system: system_prompt(&ctx, StructuredMode::Disabled),
        messages: build_messages(&ctx)?,
        temperature: options.temperature.filter(|_| sampling),
        top_p: options.top_p.filter(|_| sampling),
        stream: ctx.stream,
        tool_choice: options
            .tool_choice
            .as_ref()
            .filter(|_| !tools.is_empty())
            .map(tool_choice),
        tools,
        thinking,
    };

    serde_json::to_value(request).map_err(|e| ProviderError::bad_request(format!("failed to encode request: {e}")))
}

pub fn http_request(config: &ProviderConfig, body: Vec<u8>) -> Result<HttpRequest, ProviderError> {
    let base = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
    Ok(
        HttpRequest::json(format!("{}/messages", base.trim_end_matches('/')), body)
            .with_header("x-api-key", config.api_key()?)
            .with_header("anthropic-version", ANTHROPIC_VERSION),
    )
}

// --- Response Types ---

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    input_tokens: Option<f64>,
    output_tokens: Option<f64>,
    cache_read_input_tokens: Option<f64>,
    cache_creation_input_tokens: Option<f64>,
}

impl WireUsage {
    fn into_usage(self) -> LLMUsage {
        let prompt = match (self.input_tokens, self.cache_read_input_tokens, self.cache_creation_input_tokens) {
            (None, None, None) => None,
            (input, read, write) => Some(input.unwrap_or(0.0) + read.unwrap_or(0.0) + write.unwrap_or(0.0)),
        };
        LLMUsage {
            prompt_token_count: prompt,
            prompt_token_count_cached: self.cache_read_input_tokens,
            completion_token_count: self.output_tokens,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

fn parse_json<'a, T: Deserialize<'a>>(body: &'a str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::unknown(format!("failed to parse response: {e}")))
}

fn extract_content_str(content: &[ContentBlock]) -> Option<String> {
    let text: String = content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    (!text.is_empty()).then_some(text)
}

fn extract_reasoning_steps(content: &[ContentBlock]) -> Option<String> {
    let thinking: String = content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Thinking { thinking } => Some(thinking.as_str()),
            _ => None,
        })
        .collect();
    (!thinking.is_empty()).then_some(thinking)
}

fn extract_native_tool_calls(content: &[ContentBlock]) -> Vec<ToolCallRequestDelta> {
    content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some((id, name, input)),
            _ => None,
        })
        .enumerate()
        .map(|(idx, (id, name, input))| ToolCallRequestDelta {
            idx: idx as u32,
            id: Some(id.clone()),
            tool_name: Some(name.clone()),
            arguments: if input.is_null() { String::new() } else { input.to_string() },
        })
        .collect()
}

pub fn parse_response(body: &str) -> Result<ParsedResponse, ProviderError> {
    let response: MessagesResponse = parse_json(body)?;
    Ok(ParsedResponse {
        delta: extract_content_str(&response.content),
        reasoning: extract_reasoning_steps(&response.content),
        tool_calls: extract_native_tool_calls(&response.content),
        usage: response.usage.map(WireUsage::into_usage),
        finish_reason: Some(map_finish_reason(response.stop_reason.as_deref().unwrap_or("end_turn"))),
    })
}

// --- Stream Types ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        usage: Option<WireUsage>,
    },
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Parse one SSE payload. `ping`, `content_block_stop` and `message_stop`
/// produce an empty response.
pub fn parse_stream_event(data: &str) -> Result<ParsedResponse, ProviderError> {
    let event: StreamEvent = parse_json(data)?;
    let parsed = match event {
        StreamEvent::MessageStart { message } => ParsedResponse {
            usage: message.usage.map(WireUsage::into_usage),
            ..Default::default()
        },
        StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::ToolUse { id, name, .. },
        } => ParsedResponse {
            tool_calls: vec![ToolCallRequestDelta {
                idx: index,
                id: Some(id),
                tool_name: Some(name),
                arguments: String::new(),
            }],
            ..Default::default()
        },
        StreamEvent::ContentBlockStart {
            content_block: ContentBlock::Text { text },
            ..
        } if !text.is_empty() => ParsedResponse::text(text),
        StreamEvent::ContentBlockStart { .. } => ParsedResponse::default(),
        StreamEvent::ContentBlockDelta { index, delta } => match delta {
            BlockDelta::TextDelta { text } => ParsedResponse::text(text),
            BlockDelta::InputJsonDelta { partial_json } => ParsedResponse {
                tool_calls: vec![ToolCallRequestDelta {
                    idx: index,
                    arguments: partial_json,
                    ..Default::default()
                }],
                ..Default::default()
            },
            BlockDelta::ThinkingDelta { thinking } => ParsedResponse {
                reasoning: Some(thinking),
                ..Default::default()
            },
            BlockDelta::Other => ParsedResponse::default(),
        },
        StreamEvent::MessageDelta { delta, usage } => ParsedResponse {
            usage: usage.map(WireUsage::into_usage),
            finish_reason: delta.stop_reason.as_deref().map(map_finish_reason),
            ..Default::default()
        },
        StreamEvent::Error { error } => {
            let status = match error.kind.as_str() {
                "overloaded_error" => 529,
                "rate_limit_error" => 429,
                "api_error" => 500,
                _ => 400,
            };
            return Err(classify(status, &error.kind, &error.message));
        }
        StreamEvent::Ignored => ParsedResponse::default(),
    };
    Ok(parsed)
}

fn classify(status: u16, kind: &str, message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    match kind {
        "overloaded_error" => return ProviderError::new(ErrorKind::ServerOverloaded, message),
        "rate_limit_error" => return ProviderError::rate_limit(message),
        "authentication_error" | "permission_error" => {
            return ProviderError::new(ErrorKind::InvalidProviderConfig, message)
        }
        "not_found_error" => return ProviderError::missing_model(message),
        "api_error" => return ProviderError::internal(message),
        "request_too_large" => return ProviderError::max_tokens_exceeded(message).with_capture(true),
        _ => {}
    }

    if lower.contains("prompt is too long") || lower.contains("exceed context limit") {
        ProviderError::max_tokens_exceeded(message)
    } else if lower.contains("credit balance is too low") {
        ProviderError::new(ErrorKind::InvalidProviderConfig, message)
    } else if lower.contains("could not process image")
        || lower.contains("image exceeds")
        || lower.contains("unable to download the file")
        || lower.contains("the pdf specified")
    {
        ProviderError::invalid_file(message)
    } else if lower.contains("does not support") {
        ProviderError::unsupported_mode(message)
    } else if lower.contains("output blocked by content filtering") {
        ProviderError::content_moderation(message)
    } else {
        classify_status(status, message)
    }
}

pub fn classify_error(status: u16, body: &str) -> ProviderError {
    #[derive(Deserialize)]
    struct Envelope {
        error: ErrorBody,
    }
    match serde_json::from_str::<Envelope>(body) {
        Ok(envelope) => classify(status, &envelope.error.kind, &envelope.error.message),
        Err(_) => classify_status(status, body),
    }
}
