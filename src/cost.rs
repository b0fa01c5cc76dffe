//! Completion cost from usage and catalog pricing.

use crate::catalog::{AudioPrice, Catalog, ModelProviderData};
use crate::providers::Provider;
use crate::usage::LLMUsage;

/// Characters per token equivalent for per-character billing.
pub const CHARS_PER_TOKEN: f64 = 4.0;

pub fn character_token_equivalent(chars: usize) -> f64 {
    chars as f64 / CHARS_PER_TOKEN
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cost {
    prompt: f64,
    completion: f64,
}

fn compute(pricing: &ModelProviderData, usage: &LLMUsage) -> Option<Cost> {
    let prompt_tokens = usage.prompt_token_count?;
    let completion_tokens = usage.completion_token_count?;
    let price = &pricing.text_price;

    // Step function: a prompt exactly at the threshold still uses the base rate.
    let (prompt_rate, completion_rate) = match price.threshold {
        Some(t) if prompt_tokens > f64::from(t.threshold) => {
            (t.prompt_cost_per_token_over, t.completion_cost_per_token_over)
        }
        _ => (price.prompt_cost_per_token, price.completion_cost_per_token),
    };

    let cached = usage.prompt_token_count_cached.unwrap_or(0.0).min(prompt_tokens);

    let (audio_tokens, audio_cost) = match pricing.audio_price {
        Some(AudioPrice::PerToken(rate)) => {
            let tokens = usage.prompt_audio_token_count.unwrap_or(0.0);
            (tokens, tokens * rate)
        }
        Some(AudioPrice::PerSecond(rate)) => (0.0, usage.prompt_audio_duration_seconds.unwrap_or(0.0) * rate),
        None => (0.0, 0.0),
    };

    let image_cost = match (pricing.image_price, usage.prompt_image_count) {
        (Some(image), Some(count)) => {
            let per_image = match image.over_threshold {
                Some((threshold, over)) if prompt_tokens > f64::from(threshold) => over,
                _ => image.cost_per_image,
            };
            f64::from(count) * per_image
        }
        _ => 0.0,
    };

    let text_tokens = (prompt_tokens - cached - audio_tokens).max(0.0);
    let prompt = text_tokens * prompt_rate
        + cached * prompt_rate * (1.0 - price.prompt_cached_tokens_discount)
        + audio_cost
        + image_cost;
    let completion = completion_tokens * completion_rate;

    (prompt.is_finite() && completion.is_finite() && prompt >= 0.0 && completion >= 0.0)
        .then_some(Cost { prompt, completion })
}

/// Fill the cost fields of `usage`.
///
/// Missing pricing or counts leave the costs as `None`; this never fails.
pub fn compute_llm_completion_usage(catalog: &Catalog, provider: Provider, model: &str, usage: &LLMUsage) -> LLMUsage {
    let usage = usage.clone().without_cost();
    let Some(pricing) = catalog.get_model_provider_data(provider, model) else {
        tracing::debug!(%provider, model, "no pricing, cost left unset");
        return usage;
    };
    match compute(pricing, &usage) {
        Some(cost) => LLMUsage {
            prompt_cost_usd: Some(cost.prompt),
            completion_cost_usd: Some(cost.completion),
            ..usage
        },
        None => usage,
    }
}
