//! HTTP transport used by the engine.
//!
//! Requests are fully built (URL, headers, JSON body) before they reach the
//! transport, so a [`Transport`] only moves bytes. The engine depends on the
//! trait, which keeps retry behavior testable without a network.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use tracing::debug;

use crate::error::{ConfigError, TransportError};
use crate::options::TransportOptions;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// A fully built provider request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("authorization", format!("Bearer {token}"))
    }
}

/// Status, lowercase headers and a lazily read body.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: ByteStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Read the whole body as text.
    pub async fn text(self) -> Result<String, TransportError> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        let body: Vec<u8> = chunks.concat();
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a POST request. Non-2xx statuses are returned, not raised.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    extra_headers: HashMap<String, String>,
}

impl ReqwestTransport {
    pub fn new(options: &TransportOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            client: build_http_client(options)?,
            extra_headers: options.extra_headers.clone(),
        })
    }
}

/// Build a configured HTTP client from transport options.
///
/// This applies common configuration like timeouts and proxies.
pub fn build_http_client(options: &TransportOptions) -> Result<Client, ConfigError> {
    let mut builder = Client::builder();

    if let Some(timeout) = options.timeout {
        builder = builder.timeout(timeout);
    }

    if let Some(proxy_url) = &options.proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| ConfigError::Transport(format!("proxy {proxy_url}: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| ConfigError::Transport(e.to_string()))
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        debug!(url = %request.url, bytes = request.body.len(), "sending provider request");

        let mut builder = self.client.post(&request.url);
        let headers = request.headers.iter().map(|(k, v)| (k, v));
        for (name, value) in headers.chain(self.extra_headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body).send().await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes_stream().map_err(TransportError::from).boxed();

        Ok(HttpResponse { status, headers, body })
    }
}
