//! Static model catalog.
//!
//! Models are grouped into four cost/capability tiers. A run may only
//! target a model listed here; the provider recorded on the run and sent
//! to workers is looked up from the same table.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Errors from catalog lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),
}

/// Cost/capability tier of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    LightCostEffective,
    MediumBalanced,
    HeavyEffective,
    ProReasoning,
}

impl ModelTier {
    pub const ALL: [ModelTier; 4] = [
        ModelTier::LightCostEffective,
        ModelTier::MediumBalanced,
        ModelTier::HeavyEffective,
        ModelTier::ProReasoning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::LightCostEffective => "light_cost_effective",
            ModelTier::MediumBalanced => "medium_balanced",
            ModelTier::HeavyEffective => "heavy_effective",
            ModelTier::ProReasoning => "pro_reasoning",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider serving a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Google,
    OpenAi,
    Anthropic,
}

impl ModelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelProvider::Google => "google",
            ModelProvider::OpenAi => "openai",
            ModelProvider::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelEntry {
    pub slug: &'static str,
    pub provider: ModelProvider,
    pub tier: ModelTier,
}

const fn entry(slug: &'static str, provider: ModelProvider, tier: ModelTier) -> ModelEntry {
    ModelEntry {
        slug,
        provider,
        tier,
    }
}

use ModelProvider::{Anthropic, Google, OpenAi};
use ModelTier::{HeavyEffective, LightCostEffective, MediumBalanced, ProReasoning};

static MODELS: &[ModelEntry] = &[
    entry("gemini-2.5-flash-lite", Google, LightCostEffective),
    entry("gemini-2.0-flash-lite", Google, LightCostEffective),
    entry("gpt-5-nano", OpenAi, LightCostEffective),
    entry("gpt-4.1-nano", OpenAi, LightCostEffective),
    entry("gpt-4o-mini", OpenAi, LightCostEffective),
    entry("claude-3-haiku-20240307", Anthropic, LightCostEffective),
    entry("gemini-2.5-flash", Google, MediumBalanced),
    entry("gemini-2.0-flash", Google, MediumBalanced),
    entry("gpt-5-mini", OpenAi, MediumBalanced),
    entry("gpt-4.1-mini", OpenAi, MediumBalanced),
    entry("claude-3-5-haiku-20241022", Anthropic, MediumBalanced),
    entry("gemini-2.5-pro", Google, HeavyEffective),
    entry("gpt-5", OpenAi, HeavyEffective),
    entry("gpt-4.1", OpenAi, HeavyEffective),
    entry("claude-3-7-sonnet-20250219", Anthropic, HeavyEffective),
    entry("claude-sonnet-4-20250514", Anthropic, HeavyEffective),
    entry("o3-mini", OpenAi, ProReasoning),
    entry("o4-mini", OpenAi, ProReasoning),
    entry("o3", OpenAi, ProReasoning),
    entry("o3-pro-2025-06-10", OpenAi, ProReasoning),
    entry("claude-opus-4-20250514", Anthropic, ProReasoning),
    entry("claude-opus-4-1-20250805", Anthropic, ProReasoning),
];

/// All catalog entries, grouped by tier in ascending cost.
pub fn all_models() -> &'static [ModelEntry] {
    MODELS
}

/// Looks up a model by exact slug.
pub fn resolve(model_slug: &str) -> Result<&'static ModelEntry, CatalogError> {
    MODELS
        .iter()
        .find(|m| m.slug == model_slug)
        .ok_or_else(|| CatalogError::UnknownModel(model_slug.to_string()))
}

/// Entries belonging to one tier.
pub fn models_in_tier(tier: ModelTier) -> impl Iterator<Item = &'static ModelEntry> {
    MODELS.iter().filter(move |m| m.tier == tier)
}
