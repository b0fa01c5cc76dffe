//! Read-only model capabilities and per-provider pricing.
//!
//! The catalog is built once at startup by [`build_catalog`] and shared by
//! reference (`Arc<Catalog>`) afterwards. Nothing mutates it after
//! construction, so concurrent reads need no synchronization.
//!
//! Build order:
//! 1. raw model definitions
//! 2. provider pricing tables
//! 3. reasoning budget finalization (missing tiers default to 20/50/80% of max)
//! 4. alias index

use serde::Serialize;
use std::collections::HashMap;

use crate::options::ReasoningEffort;
use crate::providers::Provider;

/// Context window and output ceiling of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MaxTokensData {
    /// Context window, prompt and completion included.
    pub max_tokens: u32,
    pub max_output_tokens: Option<u32>,
}

impl MaxTokensData {
    /// Ceiling for generated tokens: declared output max, else the context.
    pub fn output_ceiling(&self) -> u32 {
        self.max_output_tokens.unwrap_or(self.max_tokens)
    }
}

/// Token budgets a model accepts for each reasoning effort level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ModelReasoningBudget {
    /// Budget that turns reasoning off, `None` when it cannot be disabled.
    pub disabled: Option<u32>,
    pub low: Option<u32>,
    pub medium: Option<u32>,
    pub high: Option<u32>,
    pub min: Option<u32>,
    pub max: u32,
}

impl ModelReasoningBudget {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            ..Default::default()
        }
    }

    /// Fill missing tiers with 20%, 50% and 80% of the max.
    pub fn finalize(self) -> Self {
        let share = |pct: u64| u32::try_from(u64::from(self.max) * pct / 100).unwrap_or(self.max);
        Self {
            low: self.low.or_else(|| Some(share(20))),
            medium: self.medium.or_else(|| Some(share(50))),
            high: self.high.or_else(|| Some(share(80))),
            ..self
        }
    }

    pub fn clamp(&self, budget: u32) -> u32 {
        budget.clamp(self.min.unwrap_or(0), self.max)
    }

    /// Token budget for an effort level, clamped to `[min, max]`.
    ///
    /// Returns `None` for `Disabled` when the model cannot turn reasoning off.
    pub fn budget_for_effort(&self, effort: ReasoningEffort) -> Option<u32> {
        let tier = match effort {
            ReasoningEffort::Disabled => return self.disabled,
            ReasoningEffort::Low => self.low,
            ReasoningEffort::Medium => self.medium,
            ReasoningEffort::High => self.high,
        };
        Some(self.clamp(tier.unwrap_or(self.max)))
    }

    /// Closest effort level for a token budget.
    ///
    /// Tier boundaries sit halfway between consecutive tier values so the
    /// mapping is a piecewise-linear partition of `[min, max]`.
    pub fn effort_for_budget(&self, budget: u32) -> ReasoningEffort {
        if self.disabled.is_some_and(|d| budget <= d) {
            return ReasoningEffort::Disabled;
        }
        let budget = self.clamp(budget);
        let low = self.low.unwrap_or(self.max / 5);
        let medium = self.medium.unwrap_or(self.max / 2);
        let high = self.high.unwrap_or(self.max * 4 / 5);
        if budget < low + (medium - low.min(medium)) / 2 {
            ReasoningEffort::Low
        } else if budget < medium + (high - medium.min(high)) / 2 {
            ReasoningEffort::Medium
        } else {
            ReasoningEffort::High
        }
    }
}

/// Capabilities of a logical model, independent of who hosts it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelData {
    pub id: String,
    pub display_name: String,
    pub supports_json_mode: bool,
    pub supports_structured_output: bool,
    pub supports_tool_calling: bool,
    pub supports_parallel_tool_calls: bool,
    pub supports_input_image: bool,
    pub supports_input_pdf: bool,
    pub supports_input_audio: bool,
    /// Sampling parameters (temperature, top_p, penalties) are accepted.
    pub supports_temperature: bool,
    pub max_tokens_data: MaxTokensData,
    pub reasoning: Option<ModelReasoningBudget>,
    /// Models to fall back to when this one fails in a recoverable way.
    pub fallback: Vec<String>,
    /// Hosting providers in order of preference.
    pub providers: Vec<Provider>,
    pub aliases: Vec<String>,
}

impl ModelData {
    fn new(id: &str, display_name: &str, max_tokens: u32, max_output_tokens: Option<u32>) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            supports_json_mode: true,
            supports_structured_output: false,
            supports_tool_calling: true,
            supports_parallel_tool_calls: true,
            supports_input_image: false,
            supports_input_pdf: false,
            supports_input_audio: false,
            supports_temperature: true,
            max_tokens_data: MaxTokensData {
                max_tokens,
                max_output_tokens,
            },
            reasoning: None,
            fallback: Vec::new(),
            providers: Vec::new(),
            aliases: Vec::new(),
        }
    }

    fn structured(mut self) -> Self {
        self.supports_structured_output = true;
        self
    }

    fn vision(mut self, pdf: bool) -> Self {
        self.supports_input_image = true;
        self.supports_input_pdf = pdf;
        self
    }

    fn audio(mut self) -> Self {
        self.supports_input_audio = true;
        self
    }

    fn reasoning(mut self, budget: ModelReasoningBudget) -> Self {
        self.reasoning = Some(budget);
        self
    }

    fn without_sampling(mut self) -> Self {
        self.supports_temperature = false;
        self
    }

    fn without_json_mode(mut self) -> Self {
        self.supports_json_mode = false;
        self
    }

    fn hosted_on(mut self, providers: &[Provider]) -> Self {
        self.providers = providers.to_vec();
        self
    }

    fn fallback_to(mut self, models: &[&str]) -> Self {
        self.fallback = models.iter().map(|m| m.to_string()).collect();
        self
    }

    fn aliased(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// Above `threshold` prompt tokens the whole request is billed at the
/// `*_over` rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceThreshold {
    pub threshold: u32,
    pub prompt_cost_per_token_over: f64,
    pub completion_cost_per_token_over: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TextPrice {
    pub prompt_cost_per_token: f64,
    pub completion_cost_per_token: f64,
    /// Fractional discount on cached prompt tokens (0.5 = half price).
    pub prompt_cached_tokens_discount: f64,
    pub threshold: Option<PriceThreshold>,
}

impl TextPrice {
    /// Prices expressed in USD per million tokens.
    pub fn per_million(prompt: f64, completion: f64) -> Self {
        Self {
            prompt_cost_per_token: prompt / 1_000_000.0,
            completion_cost_per_token: completion / 1_000_000.0,
            prompt_cached_tokens_discount: 0.0,
            threshold: None,
        }
    }

    pub fn cached_discount(mut self, discount: f64) -> Self {
        self.prompt_cached_tokens_discount = discount;
        self
    }

    pub fn over(mut self, threshold: u32, prompt: f64, completion: f64) -> Self {
        self.threshold = Some(PriceThreshold {
            threshold,
            prompt_cost_per_token_over: prompt / 1_000_000.0,
            completion_cost_per_token_over: completion / 1_000_000.0,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImagePrice {
    pub cost_per_image: f64,
    /// `(prompt token threshold, cost per image above it)`.
    pub over_threshold: Option<(u32, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum AudioPrice {
    PerToken(f64),
    PerSecond(f64),
}

/// What the provider counts when billing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BillingUnit {
    Tokens,
    /// Characters, converted to token equivalents by dividing by 4.
    Characters,
}

/// How one provider hosts and bills one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelProviderData {
    /// Model id expected by the provider API.
    pub wire_model: String,
    pub text_price: TextPrice,
    pub billing_unit: BillingUnit,
    pub image_price: Option<ImagePrice>,
    pub audio_price: Option<AudioPrice>,
    /// Provider-level override of `ModelData::supports_structured_output`.
    pub supports_structured_output: Option<bool>,
    /// ISO date after which the provider stops serving the model.
    pub sunset_date: Option<String>,
    pub replacement_model: Option<String>,
}

impl ModelProviderData {
    fn new(wire_model: &str, text_price: TextPrice) -> Self {
        Self {
            wire_model: wire_model.to_string(),
            text_price,
            billing_unit: BillingUnit::Tokens,
            image_price: None,
            audio_price: None,
            supports_structured_output: None,
            sunset_date: None,
            replacement_model: None,
        }
    }

    fn per_character(mut self) -> Self {
        self.billing_unit = BillingUnit::Characters;
        self
    }

    fn images(mut self, price: ImagePrice) -> Self {
        self.image_price = Some(price);
        self
    }

    fn audio(mut self, price: AudioPrice) -> Self {
        self.audio_price = Some(price);
        self
    }

    fn no_structured_output(mut self) -> Self {
        self.supports_structured_output = Some(false);
        self
    }

    fn sunset(mut self, date: &str, replacement: &str) -> Self {
        self.sunset_date = Some(date.to_string());
        self.replacement_model = Some(replacement.to_string());
        self
    }
}

/// Immutable lookup over models and provider pricing.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    models: HashMap<String, ModelData>,
    providers: HashMap<(Provider, String), ModelProviderData>,
    aliases: HashMap<String, String>,
}

impl Catalog {
    /// Canonical id for a model name or alias.
    pub fn resolve<'a>(&'a self, model: &'a str) -> &'a str {
        self.aliases.get(model).map(String::as_str).unwrap_or(model)
    }

    pub fn get_model_data(&self, model: &str) -> Option<&ModelData> {
        self.models.get(self.resolve(model))
    }

    pub fn get_model_provider_data(&self, provider: Provider, model: &str) -> Option<&ModelProviderData> {
        self.providers
            .get(&(provider, self.resolve(model).to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelData> {
        self.models.values()
    }

    /// Register a model and its provider data. Used while building.
    pub fn with_model(mut self, model: ModelData, hosting: Vec<(Provider, ModelProviderData)>) -> Self {
        for (provider, data) in hosting {
            self.providers.insert((provider, model.id.clone()), data);
        }
        self.models.insert(model.id.clone(), model);
        self
    }

    fn finalize(mut self) -> Self {
        for model in self.models.values_mut() {
            model.reasoning = model.reasoning.map(ModelReasoningBudget::finalize);
        }
        self.aliases = self
            .models
            .values()
            .flat_map(|m| m.aliases.iter().map(move |a| (a.clone(), m.id.clone())))
            .collect();
        self
    }
}

fn raw_models() -> Vec<ModelData> {
    use Provider::*;

    vec![
        ModelData::new("gpt-4o-2024-11-20", "GPT-4o (2024-11-20)", 128_000, Some(16_384))
            .structured()
            .vision(true)
            .hosted_on(&[OpenAi])
            .fallback_to(&["claude-sonnet-4-20250514"])
            .aliased(&["gpt-4o", "gpt-4o-latest"]),
        ModelData::new("gpt-4o-audio-preview-2024-12-17", "GPT-4o Audio", 128_000, Some(16_384))
            .audio()
            .without_json_mode()
            .hosted_on(&[OpenAi]),
        ModelData::new("gpt-4.1-2025-04-14", "GPT-4.1", 1_047_576, Some(32_768))
            .structured()
            .vision(true)
            .hosted_on(&[OpenAi])
            .aliased(&["gpt-4.1"]),
        ModelData::new("o3-2025-04-16", "o3", 200_000, Some(100_000))
            .structured()
            .vision(true)
            .without_sampling()
            .reasoning(ModelReasoningBudget {
                min: Some(1024),
                ..ModelReasoningBudget::new(100_000)
            })
            .hosted_on(&[OpenAi])
            .aliased(&["o3"]),
        ModelData::new("claude-sonnet-4-20250514", "Claude Sonnet 4", 200_000, Some(64_000))
            .vision(true)
            .reasoning(ModelReasoningBudget {
                disabled: Some(0),
                min: Some(1024),
                ..ModelReasoningBudget::new(64_000)
            })
            .hosted_on(&[Anthropic, AmazonBedrock])
            .fallback_to(&["gpt-4.1-2025-04-14"])
            .aliased(&["claude-sonnet-4", "claude-sonnet-4-latest"]),
        ModelData::new("claude-3-5-haiku-20241022", "Claude 3.5 Haiku", 200_000, Some(8_192))
            .vision(false)
            .hosted_on(&[Anthropic, AmazonBedrock])
            .aliased(&["claude-3-5-haiku-latest"]),
        ModelData::new("gemini-2.5-pro", "Gemini 2.5 Pro", 1_048_576, Some(65_536))
            .structured()
            .vision(true)
            .audio()
            .reasoning(ModelReasoningBudget {
                min: Some(128),
                ..ModelReasoningBudget::new(32_768)
            })
            .hosted_on(&[GoogleVertex, GoogleGemini])
            .aliased(&["gemini-2.5-pro-latest"]),
        ModelData::new("gemini-2.0-flash-001", "Gemini 2.0 Flash", 1_048_576, Some(8_192))
            .structured()
            .vision(true)
            .audio()
            .hosted_on(&[GoogleVertex, GoogleGemini])
            .aliased(&["gemini-2.0-flash"]),
        ModelData::new("gemini-1.5-pro-002", "Gemini 1.5 Pro (002)", 2_097_152, Some(8_192))
            .structured()
            .vision(true)
            .audio()
            .hosted_on(&[GoogleVertex]),
        ModelData::new("mistral-large-2-2407", "Mistral Large 2", 128_000, None)
            .hosted_on(&[Mistral]),
        ModelData::new("llama-3.3-70b", "Llama 3.3 70B", 128_000, Some(32_768))
            .hosted_on(&[Groq, Fireworks]),
        ModelData::new("deepseek-r1-2501", "DeepSeek R1", 163_840, Some(32_768))
            .reasoning(ModelReasoningBudget::new(32_768))
            .hosted_on(&[Fireworks]),
        ModelData::new("grok-3-beta", "Grok 3", 131_072, None)
            .structured()
            .hosted_on(&[XAi]),
        ModelData::new("grok-3-mini-beta", "Grok 3 Mini", 131_072, None)
            .structured()
            .reasoning(ModelReasoningBudget::new(131_072))
            .hosted_on(&[XAi]),
    ]
}

fn provider_pricing() -> Vec<(Provider, &'static str, ModelProviderData)> {
    use Provider::*;

    vec![
        (
            OpenAi,
            "gpt-4o-2024-11-20",
            ModelProviderData::new("gpt-4o-2024-11-20", TextPrice::per_million(2.5, 10.0).cached_discount(0.5)),
        ),
        (
            OpenAi,
            "gpt-4o-audio-preview-2024-12-17",
            ModelProviderData::new("gpt-4o-audio-preview-2024-12-17", TextPrice::per_million(2.5, 10.0))
                .audio(AudioPrice::PerToken(40.0 / 1_000_000.0)),
        ),
        (
            OpenAi,
            "gpt-4.1-2025-04-14",
            ModelProviderData::new("gpt-4.1-2025-04-14", TextPrice::per_million(2.0, 8.0).cached_discount(0.75)),
        ),
        (
            OpenAi,
            "o3-2025-04-16",
            ModelProviderData::new("o3-2025-04-16", TextPrice::per_million(2.0, 8.0).cached_discount(0.75)),
        ),
        (
            Anthropic,
            "claude-sonnet-4-20250514",
            ModelProviderData::new("claude-sonnet-4-20250514", TextPrice::per_million(3.0, 15.0).cached_discount(0.9)),
        ),
        (
            AmazonBedrock,
            "claude-sonnet-4-20250514",
            ModelProviderData::new(
                "us.anthropic.claude-sonnet-4-20250514-v1:0",
                TextPrice::per_million(3.0, 15.0).cached_discount(0.9),
            ),
        ),
        (
            Anthropic,
            "claude-3-5-haiku-20241022",
            ModelProviderData::new("claude-3-5-haiku-20241022", TextPrice::per_million(0.8, 4.0).cached_discount(0.9)),
        ),
        (
            AmazonBedrock,
            "claude-3-5-haiku-20241022",
            ModelProviderData::new(
                "us.anthropic.claude-3-5-haiku-20241022-v1:0",
                TextPrice::per_million(0.8, 4.0).cached_discount(0.9),
            ),
        ),
        (
            GoogleVertex,
            "gemini-2.5-pro",
            ModelProviderData::new(
                "gemini-2.5-pro",
                TextPrice::per_million(1.25, 10.0)
                    .cached_discount(0.75)
                    .over(200_000, 2.5, 15.0),
            ),
        ),
        (
            GoogleGemini,
            "gemini-2.5-pro",
            ModelProviderData::new(
                "gemini-2.5-pro",
                TextPrice::per_million(1.25, 10.0)
                    .cached_discount(0.75)
                    .over(200_000, 2.5, 15.0),
            ),
        ),
        (
            GoogleVertex,
            "gemini-2.0-flash-001",
            ModelProviderData::new("gemini-2.0-flash-001", TextPrice::per_million(0.1, 0.4).cached_discount(0.75))
                .audio(AudioPrice::PerToken(0.7 / 1_000_000.0)),
        ),
        (
            GoogleGemini,
            "gemini-2.0-flash-001",
            ModelProviderData::new("gemini-2.0-flash-001", TextPrice::per_million(0.1, 0.4).cached_discount(0.75))
                .audio(AudioPrice::PerToken(0.7 / 1_000_000.0)),
        ),
        (
            GoogleVertex,
            "gemini-1.5-pro-002",
            ModelProviderData::new("gemini-1.5-pro-002", TextPrice::per_million(1.25, 5.0).over(128_000, 2.5, 10.0))
                .per_character()
                .images(ImagePrice {
                    cost_per_image: 0.000_328_75,
                    over_threshold: Some((128_000, 0.000_657_5)),
                })
                .audio(AudioPrice::PerSecond(0.000_031_25))
                .sunset("2025-09-24", "gemini-2.5-pro"),
        ),
        (
            Mistral,
            "mistral-large-2-2407",
            ModelProviderData::new("mistral-large-2407", TextPrice::per_million(2.0, 6.0)),
        ),
        (
            Groq,
            "llama-3.3-70b",
            ModelProviderData::new("llama-3.3-70b-versatile", TextPrice::per_million(0.59, 0.79)),
        ),
        (
            Fireworks,
            "llama-3.3-70b",
            ModelProviderData::new(
                "accounts/fireworks/models/llama-v3p3-70b-instruct",
                TextPrice::per_million(0.9, 0.9),
            ),
        ),
        (
            Fireworks,
            "deepseek-r1-2501",
            ModelProviderData::new("accounts/fireworks/models/deepseek-r1", TextPrice::per_million(3.0, 8.0))
                .no_structured_output(),
        ),
        (
            XAi,
            "grok-3-beta",
            ModelProviderData::new("grok-3-beta", TextPrice::per_million(3.0, 15.0)),
        ),
        (
            XAi,
            "grok-3-mini-beta",
            ModelProviderData::new("grok-3-mini-beta", TextPrice::per_million(0.3, 0.5)),
        ),
    ]
}

/// Build the process-wide catalog. Call once at startup.
pub fn build_catalog() -> Catalog {
    let mut pricing: HashMap<&str, Vec<(Provider, ModelProviderData)>> = HashMap::new();
    for (provider, model, data) in provider_pricing() {
        pricing.entry(model).or_default().push((provider, data));
    }

    raw_models()
        .into_iter()
        .fold(Catalog::default(), |catalog, model| {
            let hosting = pricing.remove(model.id.as_str()).unwrap_or_default();
            catalog.with_model(model, hosting)
        })
        .finalize()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A model with the given ceiling and reasoning budget, for builder tests.
    pub(crate) fn test_model(max_output: u32, reasoning: Option<ModelReasoningBudget>) -> ModelData {
        let mut model = ModelData::new("test-model", "Test", 200_000, Some(max_output));
        model.reasoning = reasoning.map(ModelReasoningBudget::finalize);
        model
    }

    #[test]
    fn test_every_hosted_model_has_pricing() {
        let catalog = build_catalog();
        for model in catalog.models() {
            for provider in &model.providers {
                assert!(
                    catalog.get_model_provider_data(*provider, &model.id).is_some(),
                    "{} on {} has no pricing",
                    model.id,
                    provider
                );
            }
        }
    }

    #[test]
    fn test_aliases_resolve() {
        let catalog = build_catalog();
        let model = catalog.get_model_data("gpt-4o-latest");
        assert_eq!(model.map(|m| m.id.as_str()), Some("gpt-4o-2024-11-20"));
        assert!(catalog
            .get_model_provider_data(Provider::OpenAi, "gpt-4o")
            .is_some());
        assert!(catalog.get_model_data("does-not-exist").is_none());
    }

    #[test]
    fn test_reasoning_budget_finalized() {
        let catalog = build_catalog();
        let budget = catalog
            .get_model_data("gemini-2.5-pro")
            .and_then(|m| m.reasoning)
            .unwrap();
        assert_eq!(budget.low, Some(6553));
        assert_eq!(budget.medium, Some(16384));
        assert_eq!(budget.high, Some(26214));
    }

    #[test]
    fn test_budget_for_effort_clamps() {
        let budget = ModelReasoningBudget {
            low: Some(10),
            min: Some(1024),
            ..ModelReasoningBudget::new(4096)
        }
        .finalize();
        assert_eq!(budget.budget_for_effort(ReasoningEffort::Low), Some(1024));
        assert_eq!(budget.budget_for_effort(ReasoningEffort::Medium), Some(2048));
        assert_eq!(budget.budget_for_effort(ReasoningEffort::Disabled), None);
    }

    #[test]
    fn test_effort_for_budget() {
        let budget = ModelReasoningBudget {
            disabled: Some(0),
            ..ModelReasoningBudget::new(10_000)
        }
        .finalize();
        assert_eq!(budget.effort_for_budget(0), ReasoningEffort::Disabled);
        assert_eq!(budget.effort_for_budget(1_000), ReasoningEffort::Low);
        assert_eq!(budget.effort_for_budget(5_000), ReasoningEffort::Medium);
        assert_eq!(budget.effort_for_budget(9_000), ReasoningEffort::High);
        assert_eq!(budget.effort_for_budget(50_000), ReasoningEffort::High);
    }
}
