//! Google `generateContent`, served by both the Gemini API and Vertex AI.
//!
//! The two flavors share the wire format and differ only in endpoint and
//! authentication. Vertex requests are pinned to a region so the engine can
//! fail over to the next configured location on rate limits.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;

use super::{
    classify_status, inline_data, map_finish_reason, reasoning_budget, resolve_max_tokens, sampling_allowed,
    structured_mode, system_prompt, BuildContext, OutputSupport, StructuredMode,
};
use crate::config::ProviderConfig;
use crate::error::{ConfigError, ErrorKind, ProviderError};
use crate::http::HttpRequest;
use crate::model::{File, FinishReason, MessageContent, ParsedResponse, Role, ToolCallRequestDelta, ToolChoice};
use crate::providers::Provider;
use crate::tracking::RawCompletion;
use crate::usage::LLMUsage;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Function calling cannot be combined with a JSON response mime type.
const OUTPUT_SUPPORT: OutputSupport = OutputSupport {
    json_object: true,
    json_schema: true,
    json_with_tools: false,
};

/// Schema keywords `responseSchema` rejects.
const UNSUPPORTED_SCHEMA_KEYS: [&str; 5] = ["additionalProperties", "$schema", "title", "default", "examples"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoogleFlavor {
    Gemini,
    Vertex,
}

// --- Request Types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
    tools: Option<Vec<ToolDeclarations>>,
    tool_config: Option<Value>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Content {
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    thought: Option<bool>,
    inline_data: Option<InlineData>,
    file_data: Option<FileData>,
    function_call: Option<FunctionCall>,
    function_response: Option<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileData {
    mime_type: String,
    file_uri: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: Option<f32>,
    top_p: Option<f32>,
    presence_penalty: Option<f32>,
    frequency_penalty: Option<f32>,
    response_mime_type: Option<&'static str>,
    response_schema: Option<Value>,
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: u32,
    include_thoughts: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: Option<String>,
    parameters: Option<Value>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// Keywords whose value maps names to subschemas.
const SCHEMA_MAP_KEYS: &[&str] = &["properties", "$defs", "definitions", "patternProperties"];

/// Strip keywords `responseSchema` does not accept, recursively.
///
/// Only keyword positions are filtered; names under `properties` and
/// definition maps are kept as is.
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()))
                .map(|(k, v)| {
                    let value = match v {
                        Value::Object(named) if SCHEMA_MAP_KEYS.contains(&k.as_str()) => Value::Object(
                            named.iter().map(|(name, sub)| (name.clone(), sanitize_schema(sub))).collect(),
                        ),
                        other => sanitize_schema(other),
                    };
                    (k.clone(), value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn file_part(file: &File) -> Result<Part, ProviderError> {
    if let Some((mime_type, data)) = inline_data(file) {
        return Ok(Part {
            inline_data: Some(InlineData { mime_type, data }),
            ..Default::default()
        });
    }
    let url = file
        .url
        .clone()
        .ok_or_else(|| ProviderError::bad_request("file has neither a url nor data"))?;
    Ok(Part {
        file_data: Some(FileData {
            mime_type: file
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            file_uri: url,
        }),
        ..Default::default()
    })
}

fn tool_response(result: &crate::model::ToolCallResult) -> Value {
    let value = serde_json::from_str::<Value>(&result.result).unwrap_or_else(|_| Value::String(result.result.clone()));
    if result.is_error {
        json!({ "error": value })
    } else {
        json!({ "result": value })
    }
}

fn build_contents(ctx: &BuildContext<'_>) -> Result<Vec<Content>, ProviderError> {
    let mut contents: Vec<Content> = Vec::new();
    for message in ctx.messages.iter().filter(|m| m.role != Role::System) {
        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let mut parts = Vec::new();
        for content in &message.content {
            match content {
                MessageContent::Text(text) if text.is_empty() => {}
                MessageContent::Text(text) => parts.push(Part::text(text.clone())),
                MessageContent::File(file) => parts.push(file_part(file)?),
                MessageContent::ToolCallRequest(request) => parts.push(Part {
                    function_call: Some(FunctionCall {
                        id: None,
                        name: request.tool_name.clone(),
                        args: Some(Value::Object(request.tool_input.clone())),
                    }),
                    ..Default::default()
                }),
                MessageContent::ToolCallResult(result) => parts.push(Part {
                    function_response: Some(FunctionResponse {
                        name: result.tool_name.clone(),
                        response: tool_response(result),
                    }),
                    ..Default::default()
                }),
            }
        }
        if parts.is_empty() {
            continue;
        }
        // Consecutive turns of the same role are merged.
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }
    Ok(contents)
}

fn tool_config(choice: &ToolChoice) -> Value {
    let config = match choice {
        ToolChoice::Auto => json!({"mode": "AUTO"}),
        ToolChoice::None => json!({"mode": "NONE"}),
        ToolChoice::Required => json!({"mode": "ANY"}),
        ToolChoice::Function(name) => json!({"mode": "ANY", "allowedFunctionNames": [name]}),
    };
    json!({ "functionCallingConfig": config })
}

pub fn build_request(ctx: BuildContext<'_>) -> Result<Value, ProviderError> {
    let options = ctx.options;
    let mode = structured_mode(&ctx, OUTPUT_SUPPORT);
    let budget = reasoning_budget(options, ctx.model);
    let sampling = sampling_allowed(ctx.model);

    let (response_mime_type, response_schema) = match (mode, &options.output_schema) {
        (StructuredMode::JsonSchema, Some(schema)) => (Some("application/json"), Some(sanitize_schema(schema))),
        (StructuredMode::JsonObject, _) => (Some("application/json"), None),
        _ => (None, None),
    };

    let generation_config = GenerationConfig {
        max_output_tokens: resolve_max_tokens(options, ctx.model, budget),
        temperature: options.temperature.filter(|_| sampling),
        top_p: options.top_p.filter(|_| sampling),
        presence_penalty: options.presence_penalty.filter(|_| sampling),
        frequency_penalty: options.frequency_penalty.filter(|_| sampling),
        response_mime_type,
        response_schema,
        thinking_config: budget.map(|b| ThinkingConfig {
            thinking_budget: b,
            include_thoughts: b > 0,
        }),
    };

    let declarations: Vec<FunctionDeclaration> = options
        .enabled_tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.wire_description().map(str::to_string),
            parameters: Some(sanitize_schema(&tool.input_schema)),
        })
        .collect();

    let request = GenerateContentRequest {
        contents: build_contents(&ctx)?,
        system_instruction: system_prompt(&ctx, mode).map(|text| Content {
            role: None,
            parts: vec![Part::text(text)],
        }),
        generation_config,
        tool_config: options
            .tool_choice
            .as_ref()
            .filter(|_| !declarations.is_empty())
            .map(tool_config),
        tools: (!declarations.is_empty()).then(|| {
            vec![ToolDeclarations {
                function_declarations: declarations,
            }]
        }),
    };

    serde_json::to_value(request).map_err(|e| ProviderError::bad_request(format!("failed to encode request: {e}")))
}

fn method(stream: bool) -> &'static str {
    if stream {
        "streamGenerateContent?alt=sse"
    } else {
        "generateContent"
    }
}

/// Host serving a Vertex region.
pub fn vertex_base_url(region: &str) -> String {
    if region == "global" {
        "https://aiplatform.googleapis.com/v1".to_string()
    } else {
        format!("https://{region}-aiplatform.googleapis.com/v1")
    }
}

pub fn http_request(
    flavor: GoogleFlavor,
    config: &ProviderConfig,
    wire_model: &str,
    body: Vec<u8>,
    stream: bool,
    region: Option<&str>,
) -> Result<HttpRequest, ProviderError> {
    match flavor {
        GoogleFlavor::Gemini => {
            let base = config.base_url.as_deref().unwrap_or(GEMINI_BASE_URL);
            let url = format!("{}/models/{wire_model}:{}", base.trim_end_matches('/'), method(stream));
            Ok(HttpRequest::json(url, body).with_header("x-goog-api-key", config.api_key()?))
        }
        GoogleFlavor::Vertex => {
            let vertex = config.vertex.as_ref().ok_or_else(|| ConfigError::Incomplete {
                provider: Provider::GoogleVertex,
                reason: "missing project and locations".to_string(),
            })?;
            let region = region.unwrap_or(vertex.locations.head.as_str());
            let base = config.base_url.clone().unwrap_or_else(|| vertex_base_url(region));
            let url = format!(
                "{}/projects/{}/locations/{region}/publishers/google/models/{wire_model}:{}",
                base.trim_end_matches('/'),
                vertex.project_id,
                method(stream)
            );
            Ok(HttpRequest::json(url, body).with_bearer(config.api_key()?))
        }
    }
}

// --- Response Types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModalityCount {
    modality: String,
    #[serde(default)]
    token_count: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<f64>,
    candidates_token_count: Option<f64>,
    thoughts_token_count: Option<f64>,
    cached_content_token_count: Option<f64>,
    #[serde(default)]
    prompt_tokens_details: Vec<ModalityCount>,
}

impl From<UsageMetadata> for LLMUsage {
    fn from(usage: UsageMetadata) -> Self {
        let completion = match (usage.candidates_token_count, usage.thoughts_token_count) {
            (None, None) => None,
            (candidates, thoughts) => Some(candidates.unwrap_or(0.0) + thoughts.unwrap_or(0.0)),
        };
        LLMUsage {
            prompt_token_count: usage.prompt_token_count,
            prompt_token_count_cached: usage.cached_content_token_count,
            completion_token_count: completion,
            reasoning_token_count: usage.thoughts_token_count,
            prompt_audio_token_count: usage
                .prompt_tokens_details
                .iter()
                .find(|d| d.modality == "AUDIO")
                .map(|d| d.token_count),
            ..Default::default()
        }
    }
}

fn parse_chunk(body: &str, raw: &mut RawCompletion) -> Result<ParsedResponse, ProviderError> {
    let response: GenerateContentResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::unknown(format!("failed to parse response: {e}")))?;

    let mut parsed = ParsedResponse {
        usage: response.usage_metadata.map(LLMUsage::from),
        ..Default::default()
    };

    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        tracing::debug!(%reason, "prompt blocked");
        parsed.finish_reason = Some(FinishReason::ContentFilter);
        return Ok(parsed);
    }

    let Some(candidate) = response.candidates.into_iter().next() else {
        return Ok(parsed);
    };

    let mut text = String::new();
    let mut reasoning = String::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(call) = part.function_call {
            let idx = raw.next_tool_idx;
            raw.next_tool_idx += 1;
            parsed.tool_calls.push(ToolCallRequestDelta {
                idx,
                id: Some(call.id.unwrap_or_else(|| format!("{}_{idx}", call.name))),
                tool_name: Some(call.name),
                arguments: call.args.map(|a| a.to_string()).unwrap_or_default(),
            });
        } else if let Some(t) = part.text {
            if part.thought == Some(true) {
                reasoning.push_str(&t);
            } else {
                text.push_str(&t);
            }
        }
    }

    parsed.delta = (!text.is_empty()).then_some(text);
    parsed.reasoning = (!reasoning.is_empty()).then_some(reasoning);
    parsed.finish_reason = candidate.finish_reason.as_deref().map(map_finish_reason);
    Ok(parsed)
}

pub fn parse_response(body: &str, raw: &mut RawCompletion) -> Result<ParsedResponse, ProviderError> {
    let mut parsed = parse_chunk(body, raw)?;
    if parsed.finish_reason.is_none() {
        parsed.finish_reason = Some(FinishReason::Stop);
    }
    Ok(parsed)
}

/// Each SSE event is a complete `GenerateContentResponse`.
pub fn parse_stream_event(data: &str, raw: &mut RawCompletion) -> Result<ParsedResponse, ProviderError> {
    if let Some(error) = parse_error(data) {
        return Err(classify(error.code.unwrap_or(500), &error));
    }
    parse_chunk(data, raw)
}

// --- Errors ---

#[derive(Debug, Default, Deserialize)]
struct GoogleError {
    code: Option<u16>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// The error object, either bare or wrapped in a one-element array.
fn parse_error(body: &str) -> Option<GoogleError> {
    #[derive(Deserialize)]
    struct Envelope {
        error: GoogleError,
    }
    let value: Value = serde_json::from_str(body).ok()?;
    let value = match value {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    serde_json::from_value::<Envelope>(value).ok().map(|e| e.error)
}

fn classify(status: u16, error: &GoogleError) -> ProviderError {
    let message = error.message.as_str();
    let lower = message.to_lowercase();

    if error.status == "RESOURCE_EXHAUSTED" || lower.contains("resource exhausted") {
        ProviderError::rate_limit(message)
    } else if lower.contains("exceeds the maximum number of tokens") || lower.contains("input token count") {
        ProviderError::max_tokens_exceeded(message)
    } else if error.status == "NOT_FOUND" && lower.contains("model") {
        ProviderError::missing_model(message)
    } else if lower.contains("cannot fetch content from the provided url")
        || lower.contains("unable to process input image")
        || lower.contains("url_retrieval")
        || lower.contains("the document has no pages")
    {
        ProviderError::invalid_file(message)
    } else if lower.contains("schema") && error.status == "INVALID_ARGUMENT" {
        ProviderError::new(ErrorKind::StructuredGeneration, message)
    } else if lower.contains("overloaded") {
        ProviderError::new(ErrorKind::ServerOverloaded, message)
    } else if error.status == "PERMISSION_DENIED" || error.status == "UNAUTHENTICATED" {
        ProviderError::new(ErrorKind::InvalidProviderConfig, message)
    } else if lower.contains("is not supported") {
        ProviderError::unsupported_mode(message)
    } else {
        classify_status(status, message)
    }
}

pub fn classify_error(status: u16, body: &str) -> ProviderError {
    match parse_error(body) {
        Some(error) => classify(status, &error),
        None => classify_status(status, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelData;
    use crate::model::{Message, ToolCallRequest, ToolCallResult};
    use crate::options::{ProviderOptions, ReasoningEffort};
    use crate::providers::tests::{weather_tool, with_context};
    use nonempty::nonempty;

    fn build(provider: Provider, messages: &[Message], options: &ProviderOptions) -> Value {
        with_context(provider, messages, options, false, |ctx| provider.kit().build_request(ctx)).unwrap()
    }

    #[test]
    fn test_contents_roles_and_tool_parts() {
        let input = json!({"city": "Paris"}).as_object().cloned().unwrap();
        let messages = vec![
            Message::system("Be terse."),
            Message::user("Weather?"),
            Message::new(
                Role::Assistant,
                vec![MessageContent::ToolCallRequest(ToolCallRequest {
                    id: "get_weather_0".to_string(),
                    tool_name: "get_weather".to_string(),
                    tool_input: input.clone(),
                    index: None,
                })],
            ),
            Message::new(
                Role::User,
                vec![MessageContent::ToolCallResult(ToolCallResult {
                    id: "get_weather_0".to_string(),
                    tool_name: "get_weather".to_string(),
                    tool_input: input,
                    result: "{\"temp\": 21}".to_string(),
                    is_error: false,
                })],
            ),
            Message::user("And tomorrow?"),
        ];
        let options = ProviderOptions::new("gemini-2.0-flash").with_tools(vec![weather_tool()]);
        let body = build(Provider::GoogleGemini, &messages, &options);

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be terse.");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["city"], "Paris");
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["response"]["result"]["temp"], 21);
        assert_eq!(contents[2]["parts"][1]["text"], "And tomorrow?");
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "get_weather");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 8_192);
    }

    #[test]
    fn test_structured_output_uses_response_schema() {
        let messages = [Message::user("hi")];
        let schema = json!({"type": "object", "additionalProperties": false, "properties": {"a": {"type": "string", "title": "A"}}});
        let options = ProviderOptions::new("gemini-2.0-flash").with_output_schema(schema, true);
        let body = build(Provider::GoogleGemini, &messages, &options);
        let config = &body["generationConfig"];
        assert_eq!(config["responseMimeType"], "application/json");
        assert!(config["responseSchema"].get("additionalProperties").is_none());
        assert!(config["responseSchema"]["properties"]["a"].get("title").is_none());
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn test_schema_property_names_survive_sanitizing() {
        let messages = [Message::user("hi")];
        let schema = json!({
            "type": "object",
            "title": "Book",
            "properties": {
                "title": {"type": "string", "title": "Title"},
                "default": {"type": "integer", "default": 3},
                "examples": {"type": "array", "items": {"type": "string", "examples": ["a"]}}
            },
            "required": ["title", "default", "examples"],
            "$defs": {"additionalProperties": {"type": "boolean"}}
        });
        let options = ProviderOptions::new("gemini-2.0-flash").with_output_schema(schema, true);
        let body = build(Provider::GoogleGemini, &messages, &options);
        let response_schema = &body["generationConfig"]["responseSchema"];

        assert!(response_schema.get("title").is_none());
        let properties = response_schema["properties"].as_object().unwrap();
        assert_eq!(properties.len(), 3);
        assert_eq!(properties["title"], json!({"type": "string"}));
        assert_eq!(properties["default"], json!({"type": "integer"}));
        assert_eq!(properties["examples"], json!({"type": "array", "items": {"type": "string"}}));
        assert_eq!(response_schema["$defs"]["additionalProperties"], json!({"type": "boolean"}));
        assert_eq!(response_schema["required"], json!(["title", "default", "examples"]));
    }

    #[test]
    fn test_sampling_parameters_dropped_when_unsupported() {
        let catalog = crate::catalog::build_catalog();
        let provider_data = catalog
            .get_model_provider_data(Provider::GoogleGemini, "gemini-2.0-flash")
            .unwrap();
        let mut model = crate::catalog::tests::test_model(8_192, None);
        model.supports_temperature = false;
        let messages = [Message::user("hi")];
        let mut options = ProviderOptions::new("test-model").with_temperature(0.5).with_top_p(0.9);
        options.presence_penalty = Some(0.2);
        options.frequency_penalty = Some(0.3);
        let build_for = |model: &ModelData| {
            build_request(BuildContext {
                messages: &messages,
                options: &options,
                model,
                provider_data,
                stream: false,
            })
            .unwrap()
        };

        let body = build_for(&model);
        let config = body["generationConfig"].as_object().unwrap();
        for key in ["temperature", "topP", "presencePenalty", "frequencyPenalty"] {
            assert!(!config.contains_key(key), "{key} should be dropped");
        }

        model.supports_temperature = true;
        let body = build_for(&model);
        assert_eq!(body["generationConfig"]["presencePenalty"], 0.2f32);
        assert_eq!(body["generationConfig"]["frequencyPenalty"], 0.3f32);
    }

    #[test]
    fn test_structured_output_with_tools_falls_back_to_prompt() {
        let messages = [Message::user("hi")];
        let options = ProviderOptions::new("gemini-2.0-flash")
            .with_output_schema(json!({"type": "object"}), true)
            .with_tools(vec![weather_tool()]);
        let body = build(Provider::GoogleGemini, &messages, &options);
        assert!(body["generationConfig"].get("responseMimeType").is_none());
        let system = body["systemInstruction"]["parts"][0]["text"].as_str().unwrap();
        assert!(system.starts_with("Return a single JSON object"));
    }

    #[test]
    fn test_thinking_config() {
        let messages = [Message::user("hi")];
        let options = ProviderOptions::new("gemini-2.5-pro").with_reasoning_effort(ReasoningEffort::High);
        let body = build(Provider::GoogleVertex, &messages, &options);
        let thinking = &body["generationConfig"]["thinkingConfig"];
        assert_eq!(thinking["thinkingBudget"], 26_214);
        assert_eq!(thinking["includeThoughts"], true);
    }

    #[test]
    fn test_vertex_url_per_region() {
        let config = ProviderConfig::new(Provider::GoogleVertex)
            .with_api_key("ya29")
            .with_vertex("proj", nonempty!["us-central1".to_string(), "global".to_string()]);
        let request = http_request(GoogleFlavor::Vertex, &config, "gemini-2.5-pro", vec![], false, None).unwrap();
        assert_eq!(
            request.url,
            "https://us-central1-aiplatform.googleapis.com/v1/projects/proj/locations/us-central1/publishers/google/models/gemini-2.5-pro:generateContent"
        );
        let request = http_request(GoogleFlavor::Vertex, &config, "gemini-2.5-pro", vec![], true, Some("global")).unwrap();
        assert!(request.url.starts_with("https://aiplatform.googleapis.com/v1/projects/proj/locations/global/"));
        assert!(request.url.ends_with(":streamGenerateContent?alt=sse"));
        assert!(request.headers.iter().any(|(k, v)| k == "authorization" && v == "Bearer ya29"));
    }

    #[test]
    fn test_gemini_url_and_key_header() {
        let config = ProviderConfig::new(Provider::GoogleGemini).with_api_key("g-key");
        let request = http_request(GoogleFlavor::Gemini, &config, "gemini-2.0-flash-001", vec![], false, None).unwrap();
        assert_eq!(
            request.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash-001:generateContent"
        );
        assert!(request.headers.iter().any(|(k, v)| k == "x-goog-api-key" && v == "g-key"));
    }

    #[test]
    fn test_parse_response_parts() {
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "pondering", "thought": true},
                    {"text": "Here you go"},
                    {"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}},
                    {"functionCall": {"name": "get_weather", "args": {"city": "Rome"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5, "thoughtsTokenCount": 3,
                "promptTokensDetails": [{"modality": "TEXT", "tokenCount": 4}, {"modality": "AUDIO", "tokenCount": 6}]}
        }"#;
        let mut raw = RawCompletion::new();
        let parsed = parse_response(body, &mut raw).unwrap();
        assert_eq!(parsed.delta.as_deref(), Some("Here you go"));
        assert_eq!(parsed.reasoning.as_deref(), Some("pondering"));
        assert_eq!(parsed.tool_calls.len(), 2);
        assert_eq!(parsed.tool_calls[1].idx, 1);
        assert_eq!(parsed.tool_calls[1].id.as_deref(), Some("get_weather_1"));
        let usage = parsed.usage.unwrap();
        assert_eq!(usage.completion_token_count, Some(8.0));
        assert_eq!(usage.reasoning_token_count, Some(3.0));
        assert_eq!(usage.prompt_audio_token_count, Some(6.0));
    }

    #[test]
    fn test_stream_tool_indexes_continue_across_events() {
        let mut raw = RawCompletion::new();
        let event = r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"a","args":{}}}]}}]}"#;
        let first = parse_stream_event(event, &mut raw).unwrap();
        let second = parse_stream_event(event, &mut raw).unwrap();
        assert_eq!(first.tool_calls[0].idx, 0);
        assert_eq!(second.tool_calls[0].idx, 1);
        assert_eq!(first.finish_reason, None);
    }

    #[test]
    fn test_blocked_prompt() {
        let mut raw = RawCompletion::new();
        let parsed = parse_response(r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#, &mut raw).unwrap();
        assert_eq!(parsed.finish_reason, Some(FinishReason::ContentFilter));
    }

    #[test]
    fn test_classify_errors() {
        let body = |code: u16, status: &str, message: &str| {
            json!({"error": {"code": code, "status": status, "message": message}}).to_string()
        };
        assert_eq!(
            classify_error(429, &body(429, "RESOURCE_EXHAUSTED", "Resource exhausted. Please try again later.")).kind,
            ErrorKind::RateLimit
        );
        assert_eq!(
            classify_error(400, &body(400, "INVALID_ARGUMENT", "The input token count (3000000) exceeds the maximum number of tokens allowed (2097152).")).kind,
            ErrorKind::MaxTokensExceeded
        );
        assert_eq!(
            classify_error(404, &body(404, "NOT_FOUND", "Publisher Model `gemini-9` was not found")).kind,
            ErrorKind::MissingModel
        );
        assert_eq!(
            classify_error(400, &body(400, "INVALID_ARGUMENT", "Cannot fetch content from the provided URL.")).kind,
            ErrorKind::InvalidFile
        );
        assert_eq!(
            classify_error(503, &body(503, "UNAVAILABLE", "The model is overloaded.")).kind,
            ErrorKind::ServerOverloaded
        );
        let wrapped = format!("[{}]", body(403, "PERMISSION_DENIED", "denied"));
        assert_eq!(classify_error(403, &wrapped).kind, ErrorKind::InvalidProviderConfig);
    }

    #[test]
    fn test_stream_error_event() {
        let mut raw = RawCompletion::new();
        let err = parse_stream_event(
            r#"{"error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "quota"}}"#,
            &mut raw,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimit);
    }
}
