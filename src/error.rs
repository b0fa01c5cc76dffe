//! Error taxonomy shared by every provider.
//!
//! Provider failures are classified into a small, stable set of kinds. Each
//! kind carries default policy flags that callers use to decide what to do
//! next:
//!
//! - `capture`: the failure is unexpected and should alert engineers
//! - `store_task_run`: the (partial) run should still be persisted
//! - `retry`: re-issuing the same request may succeed
//! - `try next provider`: another provider hosting the same model may succeed
//!
//! Classification itself never retries. Only the engine retries transport
//! failures; everything else is surfaced.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::providers::Provider;

/// Stable classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP 408 or a transport read timeout.
    Timeout,
    /// The provider could not be reached after retries.
    Unavailable,
    /// 5xx with an unstructured body.
    Internal,
    /// 429 and quota exhaustion.
    RateLimit,
    /// The provider is overloaded (Anthropic 529).
    ServerOverloaded,
    /// Truncated generation or a prompt longer than the context window.
    MaxTokensExceeded,
    /// The model does not support a requested capability.
    ModelDoesNotSupportMode,
    /// The provider rejected the output schema or response format.
    StructuredGeneration,
    /// The provider refused or flagged the content.
    ContentModeration,
    BadRequest,
    /// An input file could not be downloaded or processed.
    InvalidFile,
    /// The provider does not host the requested model.
    MissingModel,
    /// The output could not be parsed into the expected shape.
    FailedGeneration,
    /// Credentials, credits or configuration problems on our side.
    InvalidProviderConfig,
    Unknown,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "provider_unavailable",
            ErrorKind::Internal => "provider_internal_error",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerOverloaded => "server_overloaded",
            ErrorKind::MaxTokensExceeded => "max_tokens_exceeded",
            ErrorKind::ModelDoesNotSupportMode => "model_does_not_support_mode",
            ErrorKind::StructuredGeneration => "structured_generation_error",
            ErrorKind::ContentModeration => "content_moderation",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::InvalidFile => "invalid_file",
            ErrorKind::MissingModel => "missing_model",
            ErrorKind::FailedGeneration => "failed_generation",
            ErrorKind::InvalidProviderConfig => "invalid_provider_config",
            ErrorKind::Unknown => "unknown_provider_error",
        }
    }

    fn default_capture(&self) -> bool {
        matches!(
            self,
            ErrorKind::Unavailable
                | ErrorKind::StructuredGeneration
                | ErrorKind::InvalidProviderConfig
                | ErrorKind::Unknown
        )
    }

    fn default_store_task_run(&self) -> bool {
        matches!(
            self,
            ErrorKind::MaxTokensExceeded
                | ErrorKind::ModelDoesNotSupportMode
                | ErrorKind::StructuredGeneration
                | ErrorKind::ContentModeration
                | ErrorKind::BadRequest
                | ErrorKind::InvalidFile
                | ErrorKind::FailedGeneration
                | ErrorKind::Unknown
        )
    }

    fn default_retry(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Unavailable
                | ErrorKind::Internal
                | ErrorKind::RateLimit
                | ErrorKind::ServerOverloaded
                | ErrorKind::FailedGeneration
        )
    }

    /// Whether a different provider for the same model may succeed.
    pub fn should_try_next_provider(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Unavailable
                | ErrorKind::Internal
                | ErrorKind::RateLimit
                | ErrorKind::ServerOverloaded
                | ErrorKind::ModelDoesNotSupportMode
                | ErrorKind::MissingModel
                | ErrorKind::InvalidProviderConfig
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified provider failure.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    pub provider: Option<Provider>,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
    capture: Option<bool>,
    store_task_run: Option<bool>,
    retry: Option<bool>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            status_code: None,
            retry_after: None,
            capture: None,
            store_task_run: None,
            retry: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn max_tokens_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MaxTokensExceeded, message)
    }

    pub fn unsupported_mode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelDoesNotSupportMode, message)
    }

    pub fn content_moderation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContentModeration, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn invalid_file(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFile, message)
    }

    pub fn missing_model(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingModel, message)
    }

    pub fn failed_generation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FailedGeneration, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_store_task_run(mut self, store: bool) -> Self {
        self.store_task_run = Some(store);
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Should this failure alert engineers.
    pub fn capture(&self) -> bool {
        self.capture.unwrap_or_else(|| self.kind.default_capture())
    }

    /// Should the run still be persisted.
    pub fn store_task_run(&self) -> bool {
        self.store_task_run
            .unwrap_or_else(|| self.kind.default_store_task_run())
    }

    /// Would re-issuing the same request plausibly succeed.
    pub fn should_retry(&self) -> bool {
        self.retry.unwrap_or_else(|| self.kind.default_retry())
    }

    pub fn should_try_next_provider(&self) -> bool {
        self.kind.should_try_next_provider()
    }
}

/// Network-level failures raised by a [`Transport`](crate::http::Transport).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("read timed out")]
    Timeout,

    #[error("read error: {0}")]
    Read(String),

    #[error("remote end closed the connection")]
    Disconnected,

    #[error("invalid request: {0}")]
    Request(String),
}

impl TransportError {
    /// Transient failures worth re-issuing the request for.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Request(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::Request(err.to_string())
        } else if err.is_body() || err.is_decode() {
            TransportError::Read(err.to_string())
        } else {
            TransportError::Disconnected
        }
    }
}

impl From<TransportError> for ProviderError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => ProviderError::timeout(err.to_string()),
            TransportError::Request(_) => ProviderError::bad_request(err.to_string()).with_capture(true),
            _ => ProviderError::unavailable(err.to_string()),
        }
    }
}

/// Invalid or missing provider configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("{provider} is not configured: {reason}")]
    Incomplete { provider: Provider, reason: String },

    #[error("invalid header {0}")]
    InvalidHeader(String),

    #[error("invalid transport configuration: {0}")]
    Transport(String),
}

impl From<ConfigError> for ProviderError {
    fn from(err: ConfigError) -> Self {
        let provider = match &err {
            ConfigError::Incomplete { provider, .. } => Some(*provider),
            _ => None,
        };
        let mut error = ProviderError::new(ErrorKind::InvalidProviderConfig, err.to_string());
        error.provider = provider;
        error
    }
}
