//! Provider-agnostic conversation, tool and output types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::usage::LLMUsage;

/// Role of the message sender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A file attached to a message, referenced by URL or carried inline as base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct File {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Base64 encoded payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// MIME type, e.g. `image/png` or `audio/wav`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Audio length, used for per-second billing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl File {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn from_base64(data: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            content_type: Some(content_type.into()),
            ..Default::default()
        }
    }

    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }

    pub fn is_audio(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("audio/"))
    }

    pub fn is_pdf(&self) -> bool {
        self.content_type.as_deref() == Some("application/pdf")
    }

    /// Short format name derived from the content type (`png`, `mp3`, ...).
    pub fn format(&self) -> Option<&str> {
        let ct = self.content_type.as_deref()?;
        let subtype = ct.split('/').nth(1)?;
        Some(match subtype {
            "mpeg" => "mp3",
            "x-wav" => "wav",
            "jpg" => "jpeg",
            other => other,
        })
    }

    /// `data:` URL when the payload is inline, the remote URL otherwise.
    pub fn to_url(&self) -> Option<String> {
        match (&self.data, &self.url) {
            (Some(data), _) => Some(format!(
                "data:{};base64,{}",
                self.content_type.as_deref().unwrap_or("application/octet-stream"),
                data
            )),
            (None, Some(url)) => Some(url.clone()),
            (None, None) => None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub tool_name: String,
    pub tool_input: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// The outcome of executing a tool call, fed back to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub tool_name: String,
    pub tool_input: Map<String, Value>,
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
}

/// One item of message content. Exactly one kind per item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    File(File),
    ToolCallRequest(ToolCallRequest),
    ToolCallResult(ToolCallResult),
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<MessageContent>,
}

impl Message {
    pub fn new(role: Role, content: Vec<MessageContent>) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![MessageContent::Text(text.into())])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessageContent::Text(text.into())])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![MessageContent::Text(text.into())])
    }

    /// Concatenated text items, separated by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                MessageContent::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn files(&self) -> impl Iterator<Item = &File> {
        self.content.iter().filter_map(|c| match c {
            MessageContent::File(f) => Some(f),
            _ => None,
        })
    }

    pub fn tool_call_requests(&self) -> impl Iterator<Item = &ToolCallRequest> {
        self.content.iter().filter_map(|c| match c {
            MessageContent::ToolCallRequest(r) => Some(r),
            _ => None,
        })
    }

    pub fn tool_call_results(&self) -> impl Iterator<Item = &ToolCallResult> {
        self.content.iter().filter_map(|c| match c {
            MessageContent::ToolCallResult(r) => Some(r),
            _ => None,
        })
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
    /// Kept for the caller; never sent to providers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl Tool {
    /// Description to send on the wire, `None` when empty.
    pub fn wire_description(&self) -> Option<&str> {
        (!self.description.is_empty()).then_some(self.description.as_str())
    }
}

/// How the model may pick tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Function(String),
}

/// Normalized reason the model stopped generating.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxContext,
    ContentFilter,
    MalformedFunctionCall,
    Recitation,
}

/// A fragment of a tool call as it arrives in a stream.
///
/// Fragments sharing an `idx` belong to the same call; `arguments` is a piece
/// of the JSON-encoded argument string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ToolCallRequestDelta {
    pub idx: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// One normalized increment produced by a provider parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ParsedResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequestDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<LLMUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl ParsedResponse {
    /// The "nothing happened" sentinel: a keep-alive, a `[DONE]` marker or
    /// an event type we ignore.
    pub fn is_empty(&self) -> bool {
        self.delta.is_none()
            && self.reasoning.is_none()
            && self.tool_calls.is_empty()
            && self.usage.is_none()
            && self.finish_reason.is_none()
    }

    /// Whether this increment carries something worth yielding to a caller.
    pub fn has_content(&self) -> bool {
        self.delta.as_deref().is_some_and(|d| !d.is_empty())
            || self.reasoning.as_deref().is_some_and(|r| !r.is_empty())
            || !self.tool_calls.is_empty()
    }

    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            ..Default::default()
        }
    }
}

/// Final normalized output of a completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunnerOutput {
    /// Parsed JSON, a raw string, or `None` when only tool calls were usable.
    pub agent_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_call_requests: Vec<ToolCallRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<LLMUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// A streaming chunk: intermediate deltas, then exactly one `Final`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerOutputChunk {
    Delta {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequestDelta>,
    },
    Final(RunnerOutput),
}

impl RunnerOutputChunk {
    pub fn is_final(&self) -> bool {
        matches!(self, RunnerOutputChunk::Final(_))
    }
}

impl From<&ParsedResponse> for RunnerOutputChunk {
    fn from(parsed: &ParsedResponse) -> Self {
        RunnerOutputChunk::Delta {
            text: parsed.delta.clone(),
            reasoning: parsed.reasoning.clone(),
            tool_calls: parsed.tool_calls.clone(),
        }
    }
}
