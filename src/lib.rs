//! # anotherai - Provider-agnostic LLM completions
//!
//! A single domain representation of conversations, tools and options,
//! translated to and from the wire protocols of OpenAI, Anthropic, Google
//! Gemini and Vertex, Amazon Bedrock, Mistral, Fireworks, xAI and Groq.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - Streaming over Server-Sent Events and the AWS event-stream framing
//! - Structured output, tool calls and reasoning budgets per model
//! - Normalized error taxonomy with retry and fallback flags
//! - Usage and cost accounting across per-token, per-character, tiered,
//!   audio and image pricing
//!
//! ## Architecture
//!
//! - **[`catalog`]**: model capabilities, limits and per-provider pricing
//! - **[`providers`]**: request builders, response and stream parsers and
//!   error classifiers, one module per wire protocol
//! - **[`stream`]**: aggregation of parsed increments into a final output
//! - **[`engine`]**: sending, retrying, cost computation and tracking
//! - **[`proxy`]**: OpenAI `chat.completions` compatibility
//!
//! ## Example
//! ```no_run
//! use anotherai::{build_catalog, Engine, InMemoryTracker, Message, Provider, ProviderOptions, TransportOptions};
//! use anotherai::stream::json_output;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::from_env(Arc::new(build_catalog()), &TransportOptions::new())?;
//!     let tracker = InMemoryTracker::new();
//!
//!     let options = ProviderOptions::new("claude-sonnet-4")
//!         .with_max_tokens(512)
//!         .with_output_schema(serde_json::json!({"type": "object"}), false);
//!     let messages = vec![
//!         Message::system("Answer in JSON."),
//!         Message::user("Name three primes."),
//!     ];
//!
//!     let output = engine
//!         .complete(Provider::Anthropic, &messages, &options, &tracker, &json_output)
//!         .await?;
//!     println!("{:?}", output.agent_output);
//!     println!("cost: ${:.6}", tracker.total_cost_usd());
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod cost;
pub mod engine;
pub mod error;
pub mod eventstream;
pub mod http;
pub mod model;
pub mod options;
pub mod providers;
pub mod proxy;
pub mod sse;
pub mod stream;
pub mod tracking;
pub mod usage;

// Re-exports for convenience
pub use catalog::{build_catalog, Catalog};
pub use config::ProviderConfig;
pub use engine::Engine;
pub use error::{ErrorKind, ProviderError};
pub use model::{Message, MessageContent, Role, RunnerOutput, RunnerOutputChunk};
pub use options::{ProviderOptions, ReasoningEffort, TransportOptions};
pub use providers::Provider;
pub use tracking::{CompletionTracker, InMemoryTracker};
pub use usage::LLMUsage;
