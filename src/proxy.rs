//! OpenAI `chat.completions` compatibility.
//!
//! Converts an OpenAI chat request into domain messages and options, and
//! domain outputs back into OpenAI response and stream-chunk shapes. Both the
//! current `tools` API and the deprecated `functions` API are accepted; a
//! request using `functions` is answered with `function_call` fields.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use serde_with::skip_serializing_none;
use std::collections::HashMap;

use crate::error::ProviderError;
use crate::model::{File, Message, MessageContent, Role, RunnerOutput, RunnerOutputChunk, Tool, ToolCallRequest, ToolCallResult, ToolChoice};
use crate::options::{ProviderOptions, ReasoningEffort};
use crate::usage::LLMUsage;

// --- Request Types ---

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Replaces `max_tokens` for reasoning models.
    pub max_completion_tokens: Option<u32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub parallel_tool_calls: Option<bool>,
    #[serde(default)]
    pub tools: Vec<ChatTool>,
    pub tool_choice: Option<ChatToolChoice>,
    /// Deprecated predecessor of `tools`.
    #[serde(default)]
    pub functions: Vec<ChatFunction>,
    /// Deprecated predecessor of `tool_choice`.
    pub function_call: Option<ChatFunctionChoice>,
    pub response_format: Option<ResponseFormat>,
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    Developer,
    User,
    Assistant,
    Tool,
    Function,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<ChatContent>,
    pub name: Option<String>,
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ChatToolCall>,
    pub function_call: Option<ChatFunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    InputAudio { input_audio: InputAudio },
    File { file: FileData },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputAudio {
    /// Base64 payload.
    pub data: String,
    /// `wav`, `mp3`, ...
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileData {
    /// A `data:` URL.
    pub file_data: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: ChatFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatTool {
    pub function: ChatFunction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatFunction {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatToolChoice {
    Mode(String),
    Named { function: FunctionName },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatFunctionChoice {
    Mode(String),
    Named(FunctionName),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionName {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonSchemaFormat {
    pub name: Option<String>,
    pub schema: Option<Value>,
    pub strict: Option<bool>,
}

fn function_type() -> String {
    "function".to_string()
}

impl ChatCompletionRequest {
    /// Whether the caller uses the deprecated `functions` API.
    pub fn uses_functions(&self) -> bool {
        !self.functions.is_empty() || self.function_call.is_some()
    }

    /// Whether the answer must be a JSON object.
    pub fn expects_json(&self) -> bool {
        matches!(
            self.response_format,
            Some(ResponseFormat::JsonObject | ResponseFormat::JsonSchema { .. })
        )
    }

    /// Convert into domain messages and options.
    pub fn into_domain(self) -> Result<(Vec<Message>, ProviderOptions), ProviderError> {
        let options = self.options()?;
        let messages = convert_messages(self.messages)?;
        Ok((messages, options))
    }

    fn options(&self) -> Result<ProviderOptions, ProviderError> {
        let tools = self
            .tools
            .iter()
            .map(|t| &t.function)
            .chain(&self.functions)
            .map(ChatFunction::to_tool)
            .collect();

        let tool_choice = match (&self.tool_choice, &self.function_call) {
            (Some(ChatToolChoice::Named { function }), _) => Some(ToolChoice::Function(function.name.clone())),
            (Some(ChatToolChoice::Mode(mode)), _) => Some(tool_choice_mode(mode)?),
            (None, Some(ChatFunctionChoice::Named(function))) => Some(ToolChoice::Function(function.name.clone())),
            (None, Some(ChatFunctionChoice::Mode(mode))) => Some(tool_choice_mode(mode)?),
            (None, None) => None,
        };

        let reasoning_effort = self
            .reasoning_effort
            .as_deref()
            .map(|effort| {
                ReasoningEffort::parse(effort)
                    .ok_or_else(|| ProviderError::bad_request(format!("invalid reasoning_effort {effort}")))
            })
            .transpose()?;

        let mut options = ProviderOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_completion_tokens.or(self.max_tokens),
            top_p: self.top_p,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            parallel_tool_calls: self.parallel_tool_calls,
            tool_choice,
            enabled_tools: tools,
            reasoning_effort,
            ..Default::default()
        };

        match &self.response_format {
            Some(ResponseFormat::JsonObject) => {
                options.output_schema = Some(json!({"type": "object"}));
            }
            Some(ResponseFormat::JsonSchema { json_schema }) => {
                options.output_schema = Some(json_schema.schema.clone().unwrap_or_else(|| json!({"type": "object"})));
                options.structured_generation = json_schema.strict.unwrap_or(false);
                options.task_name.clone_from(&json_schema.name);
            }
            Some(ResponseFormat::Text) | None => {}
        }
        Ok(options)
    }
}

impl ChatFunction {
    fn to_tool(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            description: self.description.clone().unwrap_or_default(),
            input_schema: self
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            output_schema: None,
        }
    }
}

fn tool_choice_mode(mode: &str) -> Result<ToolChoice, ProviderError> {
    match mode {
        "auto" => Ok(ToolChoice::Auto),
        "none" => Ok(ToolChoice::None),
        "required" => Ok(ToolChoice::Required),
        other => Err(ProviderError::bad_request(format!("invalid tool_choice {other}"))),
    }
}

fn parse_arguments(name: &str, arguments: &str) -> Result<Map<String, Value>, ProviderError> {
    if arguments.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(arguments)
        .map_err(|e| ProviderError::bad_request(format!("invalid arguments for tool call {name}: {e}")))
}

/// Split a `data:<mime>;base64,<payload>` URL.
fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    rest.split_once(";base64,")
}

fn file_from_url(url: &str) -> File {
    match parse_data_url(url) {
        Some((mime, data)) => File::from_base64(data, mime),
        None => File::from_url(url),
    }
}

fn convert_part(part: ContentPart) -> Result<MessageContent, ProviderError> {
    Ok(match part {
        ContentPart::Text { text } => MessageContent::Text(text),
        ContentPart::ImageUrl { image_url } => MessageContent::File(file_from_url(&image_url.url)),
        ContentPart::InputAudio { input_audio } => {
            MessageContent::File(File::from_base64(input_audio.data, format!("audio/{}", input_audio.format)))
        }
        ContentPart::File { file } => {
            let data = file.file_data.ok_or_else(|| {
                ProviderError::invalid_file(format!(
                    "file {} has no file_data",
                    file.filename.as_deref().unwrap_or("without name")
                ))
            })?;
            let (mime, payload) = parse_data_url(&data)
                .ok_or_else(|| ProviderError::invalid_file("file_data must be a base64 data URL"))?;
            MessageContent::File(File::from_base64(payload, mime))
        }
    })
}

fn content_items(content: Option<ChatContent>) -> Result<Vec<MessageContent>, ProviderError> {
    match content {
        None => Ok(Vec::new()),
        Some(ChatContent::Text(text)) if text.is_empty() => Ok(Vec::new()),
        Some(ChatContent::Text(text)) => Ok(vec![MessageContent::Text(text)]),
        Some(ChatContent::Parts(parts)) => parts.into_iter().map(convert_part).collect(),
    }
}

/// Text of a tool result, parts joined by newlines.
fn content_text(content: Option<ChatContent>) -> String {
    match content {
        None => String::new(),
        Some(ChatContent::Text(text)) => text,
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .join("\n"),
    }
}

fn convert_messages(messages: Vec<ChatMessage>) -> Result<Vec<Message>, ProviderError> {
    // Tool results only carry an id; the name and input come from the call.
    let mut calls: HashMap<String, (String, Map<String, Value>)> = HashMap::new();
    let mut converted: Vec<Message> = Vec::with_capacity(messages.len());

    for message in messages {
        let (role, content) = match message.role {
            ChatRole::System | ChatRole::Developer => (Role::System, content_items(message.content)?),
            ChatRole::User => (Role::User, content_items(message.content)?),
            ChatRole::Assistant => {
                let mut content = content_items(message.content)?;
                let function_call = message.function_call.map(|call| ChatToolCall {
                    id: call.name.clone(),
                    call_type: function_type(),
                    function: call,
                });
                for (index, call) in message.tool_calls.into_iter().chain(function_call).enumerate() {
                    let input = parse_arguments(&call.function.name, &call.function.arguments)?;
                    calls.insert(call.id.clone(), (call.function.name.clone(), input.clone()));
                    content.push(MessageContent::ToolCallRequest(ToolCallRequest {
                        id: call.id,
                        tool_name: call.function.name,
                        tool_input: input,
                        index: u32::try_from(index).ok(),
                    }));
                }
                (Role::Assistant, content)
            }
            ChatRole::Tool | ChatRole::Function => {
                let id = message
                    .tool_call_id
                    .or_else(|| message.name.clone())
                    .ok_or_else(|| ProviderError::bad_request("tool message without tool_call_id"))?;
                let (tool_name, tool_input) = calls
                    .get(&id)
                    .cloned()
                    .or_else(|| message.name.clone().map(|name| (name, Map::new())))
                    .ok_or_else(|| ProviderError::bad_request(format!("no tool call matches tool_call_id {id}")))?;
                let result = ToolCallResult {
                    id,
                    tool_name,
                    tool_input,
                    result: content_text(message.content),
                    is_error: false,
                };
                (Role::User, vec![MessageContent::ToolCallResult(result)])
            }
        };

        // Consecutive tool results form a single user turn.
        let is_result = |c: &MessageContent| matches!(c, MessageContent::ToolCallResult(_));
        match converted.last_mut() {
            Some(last)
                if role == Role::User
                    && last.role == Role::User
                    && content.first().is_some_and(is_result)
                    && last.content.iter().all(is_result) =>
            {
                last.content.extend(content);
            }
            _ => converted.push(Message::new(role, content)),
        }
    }
    Ok(converted)
}

// --- Response Types ---

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatResponseMessage,
    pub finish_reason: &'static str,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatResponseMessage {
    pub role: &'static str,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCall>,
    pub function_call: Option<ChatFunctionCall>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PromptTokensDetails {
    pub cached_tokens: u64,
}

// --- Stream Types ---

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<&'static str>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ChunkDelta {
    pub role: Option<&'static str>,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChunkToolCall>,
    pub function_call: Option<ChunkFunction>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkToolCall {
    pub index: u32,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub call_type: Option<&'static str>,
    pub function: ChunkFunction,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkFunction {
    pub name: Option<String>,
    pub arguments: String,
}

/// Identity of the response being produced.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub id: String,
    pub model: String,
    /// Unix seconds.
    pub created: u64,
    /// Answer with `function_call` instead of `tool_calls`.
    pub deprecated_functions: bool,
}

impl ResponseMeta {
    pub fn for_request(request: &ChatCompletionRequest, id: impl Into<String>, created: u64) -> Self {
        Self {
            id: id.into(),
            model: request.model.clone(),
            created,
            deprecated_functions: request.uses_functions(),
        }
    }

    fn finish_reason(&self, has_tool_calls: bool) -> &'static str {
        match (has_tool_calls, self.deprecated_functions) {
            (false, _) => "stop",
            (true, false) => "tool_calls",
            (true, true) => "function_call",
        }
    }
}

fn output_text(output: &RunnerOutput) -> Option<String> {
    output.agent_output.as_ref().map(|value| match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    })
}

fn token_count(count: Option<f64>) -> u64 {
    count.map_or(0, |c| c.max(0.0).round() as u64)
}

impl From<&LLMUsage> for ChatUsage {
    fn from(usage: &LLMUsage) -> Self {
        let prompt_tokens = token_count(usage.prompt_token_count);
        let completion_tokens = token_count(usage.completion_token_count);
        ChatUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_tokens_details: usage.prompt_token_count_cached.map(|cached| PromptTokensDetails {
                cached_tokens: token_count(Some(cached)),
            }),
        }
    }
}

fn wire_call(call: &ToolCallRequest) -> ChatToolCall {
    ChatToolCall {
        id: call.id.clone(),
        call_type: function_type(),
        function: ChatFunctionCall {
            name: call.tool_name.clone(),
            arguments: Value::Object(call.tool_input.clone()).to_string(),
        },
    }
}

/// The `chat.completion` body for a finished output.
pub fn completion_response(output: &RunnerOutput, meta: &ResponseMeta) -> ChatCompletion {
    let calls: Vec<ChatToolCall> = output.tool_call_requests.iter().map(wire_call).collect();
    let (tool_calls, function_call) = if meta.deprecated_functions {
        (Vec::new(), calls.into_iter().next().map(|c| c.function))
    } else {
        (calls, None)
    };

    ChatCompletion {
        id: meta.id.clone(),
        object: "chat.completion",
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatResponseMessage {
                role: "assistant",
                content: output_text(output),
                reasoning_content: output.reasoning.clone(),
                tool_calls,
                function_call,
            },
            finish_reason: meta.finish_reason(!output.tool_call_requests.is_empty()),
        }],
        usage: output.usage.as_ref().map(ChatUsage::from),
    }
}

/// The `chat.completion.chunk` body for a streaming chunk.
pub fn stream_chunk(chunk: &RunnerOutputChunk, meta: &ResponseMeta) -> ChatCompletionChunk {
    let (delta, finish_reason, usage) = match chunk {
        RunnerOutputChunk::Delta {
            text,
            reasoning,
            tool_calls,
        } => {
            let mut delta = ChunkDelta {
                content: text.clone(),
                reasoning_content: reasoning.clone(),
                ..Default::default()
            };
            if meta.deprecated_functions {
                delta.function_call = tool_calls.first().map(|call| ChunkFunction {
                    name: call.tool_name.clone(),
                    arguments: call.arguments.clone(),
                });
            } else {
                delta.tool_calls = tool_calls
                    .iter()
                    .map(|call| ChunkToolCall {
                        index: call.idx,
                        id: call.id.clone(),
                        call_type: call.id.as_ref().map(|_| "function"),
                        function: ChunkFunction {
                            name: call.tool_name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect();
            }
            (delta, None, None)
        }
        RunnerOutputChunk::Final(output) => (
            ChunkDelta::default(),
            Some(meta.finish_reason(!output.tool_call_requests.is_empty())),
            output.usage.as_ref().map(ChatUsage::from),
        ),
    };

    ChatCompletionChunk {
        id: meta.id.clone(),
        object: "chat.completion.chunk",
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
        usage,
    }
}

/// OpenAI-style error envelope.
pub fn error_body(error: &ProviderError) -> Value {
    json!({
        "error": {
            "message": error.message,
            "type": error.kind.code(),
            "code": error.status_code,
        }
    })
}
