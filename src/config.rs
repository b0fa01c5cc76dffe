//! Provider credentials and endpoints.

use nonempty::NonEmpty;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;
use crate::providers::Provider;

/// Google Cloud project and the regions to spread Vertex traffic across.
#[derive(Debug, Clone)]
pub struct VertexConfig {
    pub project_id: String,
    /// Regions in failover order. `global` is allowed.
    pub locations: NonEmpty<String>,
}

/// Everything needed to reach one provider.
///
/// # Example
/// ```rust
/// use anotherai::config::ProviderConfig;
/// use anotherai::providers::Provider;
///
/// let config = ProviderConfig::new(Provider::Groq)
///     .with_api_key("gsk-test")
///     .with_base_url("http://localhost:8080/openai/v1");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub api_key: Option<SecretString>,
    /// Overrides the provider's public endpoint.
    pub base_url: Option<String>,
    pub vertex: Option<VertexConfig>,
    /// AWS region for Bedrock.
    pub region: Option<String>,
}

const DEFAULT_BEDROCK_REGION: &str = "us-west-2";

impl ProviderConfig {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            api_key: None,
            base_url: None,
            vertex: None,
            region: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_vertex(mut self, project_id: impl Into<String>, locations: NonEmpty<String>) -> Self {
        self.vertex = Some(VertexConfig {
            project_id: project_id.into(),
            locations,
        });
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Read the conventional environment variables for `provider`.
    pub fn from_env(provider: Provider) -> Result<Self, ConfigError> {
        Self::from_lookup(provider, |key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(
        provider: Provider,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let read = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingEnv(key))
        };

        let config = match provider {
            Provider::GoogleVertex => {
                let locations = read("GOOGLE_VERTEX_AI_LOCATIONS").unwrap_or_else(|_| "us-central1".to_string());
                let locations = NonEmpty::collect(
                    locations
                        .split(',')
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string),
                )
                .ok_or(ConfigError::MissingEnv("GOOGLE_VERTEX_AI_LOCATIONS"))?;
                Self::new(provider)
                    .with_api_key(read("GOOGLE_VERTEX_AI_ACCESS_TOKEN")?)
                    .with_vertex(read("GOOGLE_VERTEX_AI_PROJECT_ID")?, locations)
            }
            Provider::AmazonBedrock => Self::new(provider)
                .with_api_key(read("AWS_BEDROCK_API_KEY")?)
                .with_region(read("AWS_BEDROCK_REGION").unwrap_or_else(|_| DEFAULT_BEDROCK_REGION.to_string())),
            _ => Self::new(provider).with_api_key(read(provider.api_key_env())?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the fields the provider needs are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let incomplete = |reason: &str| ConfigError::Incomplete {
            provider: self.provider,
            reason: reason.to_string(),
        };
        if self
            .api_key
            .as_ref()
            .is_none_or(|k| k.expose_secret().is_empty())
        {
            return Err(incomplete("missing api key"));
        }
        if self.provider == Provider::GoogleVertex && self.vertex.is_none() {
            return Err(incomplete("missing project and locations"));
        }
        Ok(())
    }

    pub fn bedrock_region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_BEDROCK_REGION)
    }

    pub(crate) fn api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_ref()
            .map(|k| k.expose_secret())
            .ok_or_else(|| ConfigError::Incomplete {
                provider: self.provider,
                reason: "missing api key".to_string(),
            })
    }
}
