//! Provider-agnostic request execution.
//!
//! The engine builds the provider request, sends it through a [`Transport`],
//! retries transient transport failures, classifies error responses, parses
//! and aggregates the answer, computes its cost and records every attempt in
//! the caller's [`CompletionTracker`].
//!
//! Fallback to another model or provider is left to the caller; errors carry
//! the flags needed to decide.
//!
//! # Example
//! ```no_run
//! use anotherai::catalog::build_catalog;
//! use anotherai::engine::Engine;
//! use anotherai::model::Message;
//! use anotherai::options::{ProviderOptions, TransportOptions};
//! use anotherai::providers::Provider;
//! use anotherai::stream::text_output;
//! use anotherai::tracking::InMemoryTracker;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::from_env(Arc::new(build_catalog()), &TransportOptions::new())?;
//!     let tracker = InMemoryTracker::new();
//!     let output = engine
//!         .complete(
//!             Provider::OpenAi,
//!             &[Message::user("Hello!")],
//!             &ProviderOptions::new("gpt-4o"),
//!             &tracker,
//!             &text_output,
//!         )
//!         .await?;
//!     println!("{:?} cost {}", output.agent_output, tracker.total_cost_usd());
//!     Ok(())
//! }
//! ```

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::catalog::{BillingUnit, Catalog, ModelData, ModelProviderData};
use crate::config::ProviderConfig;
use crate::cost::{character_token_equivalent, compute_llm_completion_usage};
use crate::error::{ConfigError, ErrorKind, ProviderError, TransportError};
use crate::eventstream::wrap_eventstream;
use crate::http::{ByteStream, HttpRequest, ReqwestTransport, Transport};
use crate::model::{Message, RunnerOutput, RunnerOutputChunk};
use crate::options::{ProviderOptions, TransportOptions};
use crate::providers::google::GoogleFlavor;
use crate::providers::{bedrock, BuildContext, Provider, ProviderKit, StreamFormat, StreamPayload};
use crate::sse::wrap_sse;
use crate::stream::{OutputFactory, StreamingAggregator};
use crate::tracking::{exclude_region, excluded_regions, CompletionTracker, LLMCompletion, RawCompletion};
use crate::usage::LLMUsage;

/// Attempts per request for transport failures, without backoff.
const MAX_TRANSPORT_ATTEMPTS: usize = 3;

type PayloadStream = Pin<Box<dyn Stream<Item = Result<StreamPayload, TransportError>> + Send>>;

#[derive(Clone)]
pub struct Engine {
    catalog: Arc<Catalog>,
    transport: Arc<dyn Transport>,
    configs: Arc<HashMap<Provider, ProviderConfig>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("providers", &self.configs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Everything resolved for one logical call.
struct Call<'a> {
    provider: Provider,
    kit: ProviderKit,
    config: &'a ProviderConfig,
    model: &'a ModelData,
    provider_data: &'a ModelProviderData,
    options: &'a ProviderOptions,
    tracker: &'a dyn CompletionTracker,
}

impl Call<'_> {
    fn context<'m>(&'m self, messages: &'m [Message], stream: bool) -> BuildContext<'m> {
        BuildContext {
            messages,
            options: self.options,
            model: self.model,
            provider_data: self.provider_data,
            stream,
        }
    }
}

enum ReplyBody {
    Text(String),
    Stream(ByteStream),
}

struct Reply {
    status: u16,
    headers: HashMap<String, String>,
    body: ReplyBody,
}

impl Engine {
    pub fn new(catalog: Arc<Catalog>, transport: Arc<dyn Transport>) -> Self {
        Self {
            catalog,
            transport,
            configs: Arc::new(HashMap::new()),
        }
    }

    /// Register or replace the configuration of `config.provider`.
    pub fn with_provider(mut self, config: ProviderConfig) -> Self {
        Arc::make_mut(&mut self.configs).insert(config.provider, config);
        self
    }

    /// Engine over `reqwest`, configured with every provider whose
    /// environment variables are set.
    pub fn from_env(catalog: Arc<Catalog>, transport: &TransportOptions) -> Result<Self, ConfigError> {
        let engine = Self::new(catalog, Arc::new(ReqwestTransport::new(transport)?));
        Ok(Provider::ALL
            .into_iter()
            .fold(engine, |engine, provider| match ProviderConfig::from_env(provider) {
                Ok(config) => engine.with_provider(config),
                Err(e) => {
                    debug!(%provider, error = %e, "provider not configured");
                    engine
                }
            }))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        self.configs.contains_key(&provider)
    }

    fn call<'a>(
        &'a self,
        provider: Provider,
        options: &'a ProviderOptions,
        tracker: &'a dyn CompletionTracker,
    ) -> Result<Call<'a>, ProviderError> {
        let config = self.configs.get(&provider).ok_or_else(|| {
            ProviderError::from(ConfigError::Incomplete {
                provider,
                reason: "provider is not configured".to_string(),
            })
        })?;
        let model = self.catalog.get_model_data(&options.model).ok_or_else(|| {
            ProviderError::missing_model(format!("unknown model {}", options.model)).with_provider(provider)
        })?;
        let provider_data = self
            .catalog
            .get_model_provider_data(provider, &options.model)
            .ok_or_else(|| {
                ProviderError::missing_model(format!("{provider} does not host {}", model.id)).with_provider(provider)
            })?;
        if let Some(date) = &provider_data.sunset_date {
            debug!(%provider, model = %model.id, sunset = %date, "model is scheduled for removal");
        }
        Ok(Call {
            provider,
            kit: provider.kit(),
            config,
            model,
            provider_data,
            options,
            tracker,
        })
    }

    /// Run a non-streaming completion.
    ///
    /// An answer rejected by `output_factory` is re-prompted once with the
    /// validation error.
    pub async fn complete(
        &self,
        provider: Provider,
        messages: &[Message],
        options: &ProviderOptions,
        tracker: &dyn CompletionTracker,
        output_factory: &dyn OutputFactory,
    ) -> Result<RunnerOutput, ProviderError> {
        let call = self.call(provider, options, tracker)?;
        let mut messages = messages.to_vec();
        let mut reprompted = false;

        loop {
            let (result, answer) = self.complete_once(&call, &messages, output_factory).await?;
            match result {
                Err(error) if error.kind == ErrorKind::FailedGeneration && !reprompted && !answer.is_empty() => {
                    warn!(%provider, model = %call.model.id, error = %error.message, "invalid output, re-prompting");
                    messages.push(Message::assistant(answer));
                    messages.push(Message::user(format!(
                        "Your previous response was invalid with error `{}`.\nPlease retry",
                        error.message
                    )));
                    reprompted = true;
                }
                result => return result,
            }
        }
    }

    /// One round-trip. The outer error covers sending, the inner result the
    /// parsed answer, returned with the raw answer text.
    async fn complete_once(
        &self,
        call: &Call<'_>,
        messages: &[Message],
        output_factory: &dyn OutputFactory,
    ) -> Result<(Result<RunnerOutput, ProviderError>, String), ProviderError> {
        let body = call
            .kit
            .build_request(call.context(messages, false))
            .map_err(|e| e.with_provider(call.provider))?;
        let (reply, started) = self.execute(call, messages, &body, false).await?;
        let text = match reply.body {
            ReplyBody::Text(text) => text,
            ReplyBody::Stream(bytes) => read_body(bytes).await.map_err(ProviderError::from)?,
        };

        let mut raw = RawCompletion::new();
        let mut answer = String::new();
        let result = call.kit.parse_response(&text, &mut raw).and_then(|parsed| {
            let mut aggregator = StreamingAggregator::new();
            aggregator.add(&parsed);
            aggregator.add(&call.kit.finish(&mut raw));
            answer = aggregator.text().to_string();
            aggregator.complete(output_factory)
        });
        let result = self.finish(call, messages, started, raw, &answer, result);
        Ok((result, answer))
    }

    /// Run a streaming completion.
    ///
    /// Yields a delta for every event carrying text, reasoning or tool call
    /// fragments, then exactly one final chunk. Errors end the stream.
    pub fn stream(
        &self,
        provider: Provider,
        messages: Vec<Message>,
        options: ProviderOptions,
        tracker: Arc<dyn CompletionTracker>,
        output_factory: Arc<dyn OutputFactory>,
    ) -> impl Stream<Item = Result<RunnerOutputChunk, ProviderError>> + Send + 'static {
        let engine = self.clone();
        async_stream::try_stream! {
            let call = engine.call(provider, &options, tracker.as_ref())?;
            let body = call
                .kit
                .build_request(call.context(&messages, true))
                .map_err(|e| e.with_provider(provider))?;
            let (reply, started) = engine.execute(&call, &messages, &body, true).await?;

            let bytes: ByteStream = match reply.body {
                ReplyBody::Stream(bytes) => bytes,
                ReplyBody::Text(text) => futures::stream::once(async move { Ok(Bytes::from(text)) }).boxed(),
            };
            let mut events = stream_payloads(call.kit.stream_format(), bytes);

            let mut raw = RawCompletion::new();
            let mut aggregator = StreamingAggregator::new();
            let mut failure = None;
            while let Some(payload) = events.next().await {
                let parsed = payload
                    .map_err(|e| ProviderError::from(e).with_provider(provider))
                    .and_then(|payload| call.kit.parse_stream_event(&payload, &mut raw));
                match parsed {
                    Ok(parsed) => {
                        aggregator.add(&parsed);
                        if parsed.has_content() {
                            yield RunnerOutputChunk::from(&parsed);
                        }
                    }
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }

            if failure.is_none() {
                let tail = call.kit.finish(&mut raw);
                aggregator.add(&tail);
                if tail.has_content() {
                    yield RunnerOutputChunk::from(&tail);
                }
            }

            let answer = aggregator.text().to_string();
            let result = match failure {
                Some(error) => Err(error),
                None => aggregator.complete(output_factory.as_ref()),
            };
            let output = engine.finish(&call, &messages, started, raw, &answer, result)?;
            yield RunnerOutputChunk::Final(output);
        }
    }

    /// Regions to try, in order. `None` for providers without regions.
    fn regions(&self, call: &Call<'_>) -> Vec<Option<String>> {
        match (call.kit, &call.config.vertex) {
            (ProviderKit::Google(GoogleFlavor::Vertex), Some(vertex)) => {
                let excluded = excluded_regions(call.tracker);
                vertex
                    .locations
                    .iter()
                    .filter(|location| !excluded.contains(location))
                    .cloned()
                    .map(Some)
                    .collect()
            }
            _ => vec![None],
        }
    }

    /// Send until a successful reply, failing over Vertex regions on 429.
    async fn execute(
        &self,
        call: &Call<'_>,
        messages: &[Message],
        body: &Value,
        stream: bool,
    ) -> Result<(Reply, Instant), ProviderError> {
        let all_excluded = || {
            ProviderError::rate_limit("every configured Vertex region is rate limited").with_provider(call.provider)
        };
        let regions = self.regions(call);
        if regions.is_empty() {
            return Err(all_excluded());
        }

        let mut last_error = None;
        for region in regions {
            let request = call
                .kit
                .http_request(call.config, &call.provider_data.wire_model, body, stream, region.as_deref())
                .map_err(|e| e.with_provider(call.provider))?;
            debug!(
                provider = %call.provider,
                model = %call.model.id,
                stream,
                region = region.as_deref().unwrap_or("default"),
                "dispatching request"
            );

            let started = Instant::now();
            let reply = match self.send_with_retries(call, &request, stream).await {
                Ok(reply) => reply,
                Err(error) => {
                    self.record(call, messages, started, None, LLMUsage::default(), Some(&error));
                    return Err(error);
                }
            };
            if (200..300).contains(&reply.status) {
                return Ok((reply, started));
            }

            let text = match reply.body {
                ReplyBody::Text(text) => text,
                ReplyBody::Stream(bytes) => read_body(bytes).await.unwrap_or_default(),
            };
            let error = call.kit.classify_response(reply.status, &text, &reply.headers);
            self.record(call, messages, started, Some(text), LLMUsage::default(), Some(&error));

            match region {
                Some(region) if reply.status == 429 => {
                    warn!(provider = %call.provider, %region, "rate limited, failing over to the next region");
                    exclude_region(call.tracker, &region);
                    last_error = Some(error);
                }
                _ => return Err(error),
            }
        }
        Err(last_error.unwrap_or_else(all_excluded))
    }

    async fn send_with_retries(&self, call: &Call<'_>, request: &HttpRequest, stream: bool) -> Result<Reply, ProviderError> {
        let mut attempt = 1;
        loop {
            match self.send_once(request.clone(), stream).await {
                Ok(reply) => return Ok(reply),
                Err(error) if error.is_retryable() && attempt < MAX_TRANSPORT_ATTEMPTS => {
                    warn!(provider = %call.provider, attempt, %error, "transport error, retrying");
                    attempt += 1;
                }
                Err(error) => return Err(ProviderError::from(error).with_provider(call.provider)),
            }
        }
    }

    /// Send once. Error replies and non-streaming bodies are read fully so
    /// body read errors count as transport failures.
    async fn send_once(&self, request: HttpRequest, stream: bool) -> Result<Reply, TransportError> {
        let response = self.transport.send(request).await?;
        let status = response.status;
        let headers = response.headers.clone();
        if stream && response.is_success() {
            return Ok(Reply {
                status,
                headers,
                body: ReplyBody::Stream(response.body),
            });
        }
        let text = response.text().await?;
        Ok(Reply {
            status,
            headers,
            body: ReplyBody::Text(text),
        })
    }

    /// Cost the usage, record the attempt and attach the usage to the output.
    fn finish(
        &self,
        call: &Call<'_>,
        messages: &[Message],
        started: Instant,
        raw: RawCompletion,
        answer: &str,
        result: Result<RunnerOutput, ProviderError>,
    ) -> Result<RunnerOutput, ProviderError> {
        let usage = self.final_usage(call, messages, &raw.usage, answer);
        let result = result.map_err(|e| e.with_provider(call.provider));
        self.record(
            call,
            messages,
            started,
            Some(raw.response),
            usage.clone(),
            result.as_ref().err(),
        );
        result.map(|output| RunnerOutput {
            usage: Some(usage),
            ..output
        })
    }

    fn final_usage(&self, call: &Call<'_>, messages: &[Message], reported: &LLMUsage, answer: &str) -> LLMUsage {
        let mut usage = declared_usage(messages).merge(reported.clone());
        if call.provider_data.billing_unit == BillingUnit::Characters {
            let prompt_chars = messages.iter().map(|m| m.text().chars().count()).sum();
            usage.prompt_token_count = Some(character_token_equivalent(prompt_chars));
            usage.completion_token_count = Some(character_token_equivalent(answer.chars().count()));
        }
        compute_llm_completion_usage(&self.catalog, call.provider, &call.model.id, &usage)
    }

    fn record(
        &self,
        call: &Call<'_>,
        messages: &[Message],
        started: Instant,
        response: Option<String>,
        usage: LLMUsage,
        error: Option<&ProviderError>,
    ) {
        if let Some(error) = error.filter(|e| e.capture()) {
            warn!(
                provider = %call.provider,
                model = %call.model.id,
                status = ?error.status_code,
                kind = %error.kind,
                "{}",
                error.message
            );
        }
        call.tracker.add_completion(LLMCompletion {
            provider: call.provider,
            model: call.model.id.clone(),
            wire_model: call.provider_data.wire_model.clone(),
            messages: serde_json::to_value(messages).unwrap_or(Value::Null),
            response,
            usage,
            duration_seconds: started.elapsed().as_secs_f64(),
            error: error.map(ToString::to_string),
        });
    }
}

/// Usage the provider does not report: image count and audio duration.
pub fn declared_usage(messages: &[Message]) -> LLMUsage {
    let files: Vec<_> = messages.iter().flat_map(Message::files).collect();
    let images = files.iter().filter(|f| f.is_image()).count();
    let durations: Vec<f64> = files
        .iter()
        .filter(|f| f.is_audio())
        .filter_map(|f| f.duration_seconds)
        .collect();
    LLMUsage {
        prompt_image_count: u32::try_from(images).ok().filter(|n| *n > 0),
        prompt_audio_duration_seconds: (!durations.is_empty()).then(|| durations.iter().sum()),
        ..Default::default()
    }
}

async fn read_body(bytes: ByteStream) -> Result<String, TransportError> {
    let chunks: Vec<Bytes> = bytes.try_collect().await?;
    Ok(String::from_utf8_lossy(&chunks.concat()).into_owned())
}

fn stream_payloads(format: StreamFormat, bytes: ByteStream) -> PayloadStream {
    match format {
        StreamFormat::Sse => wrap_sse(bytes).map_ok(StreamPayload::data).boxed(),
        StreamFormat::EventStream => wrap_eventstream(bytes)
            .map_ok(|message| bedrock::stream_payload(&message))
            .boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_catalog;
    use crate::eventstream::tests::event;
    use crate::http::tests::{Scripted, ScriptedTransport};
    use crate::model::{File, FinishReason, MessageContent, Role};
    use crate::stream::{json_output, text_output};
    use crate::tracking::{InMemoryTracker, VERTEX_EXCLUDED_REGIONS};
    use futures::TryStreamExt;
    use nonempty::nonempty;
    use serde_json::json;

    const OPENAI_OK: &str = r#"{"choices":[{"message":{"role":"assistant","content":"{\"answer\": 42}"},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#;

    fn engine(script: Vec<Scripted>) -> (Engine, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(script));
        let engine = Engine::new(Arc::new(build_catalog()), transport.clone())
            .with_provider(ProviderConfig::new(Provider::OpenAi).with_api_key("sk-test"))
            .with_provider(ProviderConfig::new(Provider::Anthropic).with_api_key("sk-ant"))
            .with_provider(ProviderConfig::new(Provider::AmazonBedrock).with_api_key("br-key"))
            .with_provider(
                ProviderConfig::new(Provider::GoogleVertex)
                    .with_api_key("ya29")
                    .with_vertex("proj", nonempty!["us-central1".to_string(), "europe-west4".to_string()]),
            );
        (engine, transport)
    }

    fn sse(events: &[&str]) -> String {
        events.iter().map(|e| format!("data: {e}\n\n")).collect()
    }

    #[tokio::test]
    async fn test_complete_parses_costs_and_records() {
        let (engine, transport) = engine(vec![Scripted::ok(OPENAI_OK)]);
        let tracker = InMemoryTracker::new();
        let output = engine
            .complete(Provider::OpenAi, &[Message::user("hi")], &ProviderOptions::new("gpt-4o"), &tracker, &json_output)
            .await
            .unwrap();

        assert_eq!(output.agent_output, Some(json!({"answer": 42})));
        let usage = output.usage.unwrap();
        assert_eq!(usage.prompt_token_count, Some(10.0));
        assert!(usage.cost_usd().is_some());

        assert_eq!(transport.request_count(), 1);
        assert_eq!(transport.request_url(0), "https://api.openai.com/v1/chat/completions");
        assert_eq!(transport.request_body(0)["model"], "gpt-4o-2024-11-20");

        let completions = tracker.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].error, None);
        assert_eq!(completions[0].response.as_deref(), Some(OPENAI_OK));
    }

    #[tokio::test]
    async fn test_read_error_then_success_sends_twice() {
        let (engine, transport) = engine(vec![
            Scripted::Respond(200, vec![Err(TransportError::Read("connection reset".to_string()))]),
            Scripted::ok(OPENAI_OK),
        ]);
        let tracker = InMemoryTracker::new();
        let output = engine
            .complete(Provider::OpenAi, &[Message::user("hi")], &ProviderOptions::new("gpt-4o"), &tracker, &json_output)
            .await
            .unwrap();
        assert!(output.agent_output.is_some());
        assert_eq!(transport.request_count(), 2);
        assert_eq!(tracker.completions().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_after_three_attempts() {
        let (engine, transport) = engine(vec![
            Scripted::Fail(TransportError::Connect("refused".to_string())),
            Scripted::Fail(TransportError::Disconnected),
            Scripted::Fail(TransportError::Connect("refused".to_string())),
            Scripted::ok(OPENAI_OK),
        ]);
        let tracker = InMemoryTracker::new();
        let err = engine
            .complete(Provider::OpenAi, &[Message::user("hi")], &ProviderOptions::new("gpt-4o"), &tracker, &json_output)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(err.capture());
        assert_eq!(err.provider, Some(Provider::OpenAi));
        assert_eq!(transport.request_count(), 3);
        assert!(tracker.completions()[0].error.is_some());
    }

    #[tokio::test]
    async fn test_timeouts_surface_as_timeout() {
        let (engine, _) = engine(vec![
            Scripted::Fail(TransportError::Timeout),
            Scripted::Fail(TransportError::Timeout),
            Scripted::Fail(TransportError::Timeout),
        ]);
        let tracker = InMemoryTracker::new();
        let err = engine
            .complete(Provider::OpenAi, &[Message::user("hi")], &ProviderOptions::new("gpt-4o"), &tracker, &text_output)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_http_errors_are_classified_not_retried() {
        let body = r#"{"error":{"message":"This model's maximum context length is 128000 tokens","type":"invalid_request_error","code":"context_length_exceeded"}}"#;
        let (engine, transport) = engine(vec![Scripted::status(400, body), Scripted::ok(OPENAI_OK)]);
        let tracker = InMemoryTracker::new();
        let err = engine
            .complete(Provider::OpenAi, &[Message::user("hi")], &ProviderOptions::new("gpt-4o"), &tracker, &json_output)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MaxTokensExceeded);
        assert_eq!(err.status_code, Some(400));
        assert_eq!(transport.request_count(), 1);
        assert_eq!(tracker.completions()[0].response.as_deref(), Some(body));
    }

    #[tokio::test]
    async fn test_invalid_output_reprompts_once() {
        let invalid = r#"{"choices":[{"message":{"content":"sure, here it is"},"finish_reason":"stop"}]}"#;
        let (engine, transport) = engine(vec![Scripted::ok(invalid), Scripted::ok(OPENAI_OK)]);
        let tracker = InMemoryTracker::new();
        let output = engine
            .complete(Provider::OpenAi, &[Message::user("hi")], &ProviderOptions::new("gpt-4o"), &tracker, &json_output)
            .await
            .unwrap();
        assert_eq!(output.agent_output, Some(json!({"answer": 42})));
        assert_eq!(transport.request_count(), 2);

        let messages = transport.request_body(1)["messages"].as_array().cloned().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"], "sure, here it is");
        let retry = messages[2]["content"].as_str().unwrap();
        assert!(retry.starts_with("Your previous response was invalid with error `invalid output"), "{retry}");
        assert!(retry.ends_with("`.\nPlease retry"));
        assert_eq!(tracker.completions().len(), 2);
    }

    #[tokio::test]
    async fn test_second_invalid_output_fails() {
        let invalid = r#"{"choices":[{"message":{"content":"nope"},"finish_reason":"stop"}]}"#;
        let (engine, transport) = engine(vec![Scripted::ok(invalid), Scripted::ok(invalid)]);
        let tracker = InMemoryTracker::new();
        let err = engine
            .complete(Provider::OpenAi, &[Message::user("hi")], &ProviderOptions::new("gpt-4o"), &tracker, &json_output)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedGeneration);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_stream_yields_deltas_then_final() {
        let body = sse(&[
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":2}}"#,
        ]) + "data: [DONE]\n\n";
        let (engine, transport) = engine(vec![Scripted::ok(&body)]);
        let tracker = Arc::new(InMemoryTracker::new());

        let chunks: Vec<RunnerOutputChunk> = engine
            .stream(
                Provider::OpenAi,
                vec![Message::user("hi")],
                ProviderOptions::new("gpt-4o"),
                tracker.clone(),
                Arc::new(text_output),
            )
            .try_collect()
            .await
            .unwrap();

        assert_eq!(chunks.len(), 3);
        assert!(matches!(&chunks[0], RunnerOutputChunk::Delta { text: Some(t), .. } if t == "Hel"));
        assert!(matches!(&chunks[1], RunnerOutputChunk::Delta { text: Some(t), .. } if t == "lo"));
        let RunnerOutputChunk::Final(output) = &chunks[2] else {
            panic!("last chunk must be final");
        };
        assert_eq!(output.agent_output, Some(json!("Hello")));
        assert_eq!(output.finish_reason, Some(FinishReason::Stop));
        assert!(output.usage.as_ref().unwrap().cost_usd().is_some());

        assert_eq!(transport.request_body(0)["stream"], true);
        assert_eq!(tracker.completions().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_structured_output_end_to_end() {
        let body = sse(&[
            r#"{"choices":[{"index":0,"delta":{"content":"{\"key\": \"value\","}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"\"key2\": \"value2\"}"}}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":35,"completion_tokens":109}}"#,
        ]);
        let (engine, _) = engine(vec![Scripted::ok(&body)]);
        let tracker = Arc::new(InMemoryTracker::new());

        let chunks: Vec<RunnerOutputChunk> = engine
            .stream(
                Provider::OpenAi,
                vec![Message::user("fill the keys")],
                ProviderOptions::new("gpt-4o"),
                tracker.clone(),
                Arc::new(json_output),
            )
            .try_collect()
            .await
            .unwrap();

        assert_eq!(chunks.len(), 3);
        let RunnerOutputChunk::Final(output) = &chunks[2] else {
            panic!("last chunk must be final");
        };
        assert_eq!(output.agent_output, Some(json!({"key": "value", "key2": "value2"})));

        let recorded = &tracker.completions()[0].usage;
        assert_eq!(recorded.prompt_token_count, Some(35.0));
        assert_eq!(recorded.completion_token_count, Some(109.0));
    }

    #[tokio::test]
    async fn test_stream_error_event_ends_stream() {
        let body = sse(&[
            r#"{"type":"message_start","message":{"usage":{"input_tokens":5,"output_tokens":1}}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ]);
        let (engine, _) = engine(vec![Scripted::ok(&body)]);
        let tracker = Arc::new(InMemoryTracker::new());
        let results: Vec<_> = engine
            .stream(
                Provider::Anthropic,
                vec![Message::user("hi")],
                ProviderOptions::new("claude-sonnet-4"),
                tracker.clone(),
                Arc::new(text_output),
            )
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerOverloaded);
        assert_eq!(err.provider, Some(Provider::Anthropic));
        assert!(tracker.completions()[0].error.is_some());
    }

    #[tokio::test]
    async fn test_bedrock_event_stream() {
        let mut bytes = event("messageStart", r#"{"role":"assistant"}"#);
        bytes.extend(event("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":"{\"ok\":"}}"#));
        bytes.extend(event("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":" true}"}}"#));
        bytes.extend(event("messageStop", r#"{"stopReason":"end_turn"}"#));
        bytes.extend(event("metadata", r#"{"usage":{"inputTokens":4,"outputTokens":3}}"#));
        let (mid, rest) = bytes.split_at(bytes.len() / 2);
        let (engine, transport) = engine(vec![Scripted::Respond(
            200,
            vec![Ok(Bytes::copy_from_slice(mid)), Ok(Bytes::copy_from_slice(rest))],
        )]);

        let chunks: Vec<RunnerOutputChunk> = engine
            .stream(
                Provider::AmazonBedrock,
                vec![Message::user("hi")],
                ProviderOptions::new("claude-sonnet-4"),
                Arc::new(InMemoryTracker::new()),
                Arc::new(json_output),
            )
            .try_collect()
            .await
            .unwrap();

        assert_eq!(chunks.len(), 3);
        let RunnerOutputChunk::Final(output) = chunks.last().unwrap() else {
            panic!("last chunk must be final");
        };
        assert_eq!(output.agent_output, Some(json!({"ok": true})));
        assert_eq!(output.usage.as_ref().unwrap().completion_token_count, Some(3.0));
        assert!(transport.request_url(0).ends_with("/converse-stream"));
    }

    #[tokio::test]
    async fn test_vertex_region_failover() {
        let ok = r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":1}}"#;
        let limited = r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","message":"Resource exhausted"}}"#;
        let (engine, transport) = engine(vec![Scripted::status(429, limited), Scripted::ok(ok)]);
        let tracker = InMemoryTracker::new();

        let output = engine
            .complete(Provider::GoogleVertex, &[Message::user("hi")], &ProviderOptions::new("gemini-2.0-flash"), &tracker, &text_output)
            .await
            .unwrap();
        assert_eq!(output.agent_output, Some(json!("hi")));
        assert!(transport.request_url(0).contains("/locations/us-central1/"));
        assert!(transport.request_url(1).contains("/locations/europe-west4/"));
        assert_eq!(tracker.get_metadata(VERTEX_EXCLUDED_REGIONS).as_deref(), Some("us-central1"));
        assert_eq!(tracker.completions().len(), 2);
    }

    #[tokio::test]
    async fn test_vertex_per_character_billing_ignores_reported_tokens() {
        let ok = r#"{"candidates":[{"content":{"parts":[{"text":"hi!!"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":999,"candidatesTokenCount":999}}"#;
        let (engine, _) = engine(vec![Scripted::ok(ok)]);
        let tracker = InMemoryTracker::new();

        let output = engine
            .complete(
                Provider::GoogleVertex,
                &[Message::user("abcdefgh")],
                &ProviderOptions::new("gemini-1.5-pro-002"),
                &tracker,
                &text_output,
            )
            .await
            .unwrap();
        assert_eq!(output.agent_output, Some(json!("hi!!")));

        let recorded = &tracker.completions()[0].usage;
        assert_eq!(recorded.prompt_token_count, Some(2.0));
        assert_eq!(recorded.completion_token_count, Some(1.0));
        let prompt_cost = recorded.prompt_cost_usd.unwrap();
        assert!((prompt_cost - 2.0 * 1.25 / 1_000_000.0).abs() < 1e-12);

        let usage = output.usage.unwrap();
        assert_eq!(usage.prompt_token_count, Some(2.0));
        assert_eq!(usage.completion_token_count, Some(1.0));
    }

    #[tokio::test]
    async fn test_vertex_all_regions_excluded() {
        let limited = r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","message":"Resource exhausted"}}"#;
        let (engine, transport) = engine(vec![Scripted::status(429, limited), Scripted::status(429, limited)]);
        let tracker = InMemoryTracker::new();
        let options = ProviderOptions::new("gemini-2.0-flash");

        let err = engine
            .complete(Provider::GoogleVertex, &[Message::user("hi")], &options, &tracker, &text_output)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(transport.request_count(), 2);

        let err = engine
            .complete(Provider::GoogleVertex, &[Message::user("hi")], &options, &tracker, &text_output)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_model_and_unconfigured_provider() {
        let (engine, transport) = engine(vec![]);
        let tracker = InMemoryTracker::new();
        let err = engine
            .complete(Provider::OpenAi, &[Message::user("hi")], &ProviderOptions::new("gpt-9"), &tracker, &text_output)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingModel);

        let err = engine
            .complete(Provider::Groq, &[Message::user("hi")], &ProviderOptions::new("llama-3.3-70b"), &tracker, &text_output)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidProviderConfig);
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_declared_usage() {
        let audio = File {
            duration_seconds: Some(12.5),
            ..File::from_base64("AAAA", "audio/wav")
        };
        let messages = [Message::new(
            Role::User,
            vec![
                MessageContent::File(File::from_base64("AAAA", "image/png")),
                MessageContent::File(File::from_base64("AAAA", "image/jpeg")),
                MessageContent::File(audio),
            ],
        )];
        let usage = declared_usage(&messages);
        assert_eq!(usage.prompt_image_count, Some(2));
        assert_eq!(usage.prompt_audio_duration_seconds, Some(12.5));
        assert_eq!(declared_usage(&[Message::user("hi")]), LLMUsage::default());
    }
}
