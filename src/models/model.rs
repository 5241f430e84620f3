//! Upstream model and provider records
//!
//! A [`Model`] is identified by a provider-scoped string and carries the
//! operator weight, context window and per-1k pricing used by the routing
//! engine. A [`Provider`] binds a type tag to a base URL and a credential
//! source; at runtime every enabled provider has a registered adapter.

use serde::{Deserialize, Serialize};

/// Where a model's pricing comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingSource {
    /// Operator-entered prices, never overwritten by the refresher.
    Manual,
    /// Prices refreshed from the bundled litellm-style pricing table.
    Litellm,
}

impl PricingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingSource::Manual => "manual",
            PricingSource::Litellm => "litellm",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "litellm" => PricingSource::Litellm,
            _ => PricingSource::Manual,
        }
    }
}

/// An upstream model the router can select.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub provider_id: String,
    /// Operator preference; higher wins ties.
    pub weight: i64,
    pub max_context_tokens: u32,
    /// USD per 1 000 input tokens.
    pub input_per_1k: f64,
    /// USD per 1 000 output tokens.
    pub output_per_1k: f64,
    pub enabled: bool,
    pub pricing_source: PricingSource,
}

impl Model {
    /// Estimated USD cost for a request with the given token counts.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Upstream provider type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    Vllm,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Vllm => "vllm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderKind::Openai),
            "anthropic" => Some(ProviderKind::Anthropic),
            "vllm" => Some(ProviderKind::Vllm),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a provider's API credential is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// Conventional environment variable (`OPENAI_API_KEY`, ...).
    Env,
    /// The encrypted vault, keyed `provider:<id>`.
    Vault,
    /// No credential (local vLLM and friends).
    None,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Env => "env",
            CredentialSource::Vault => "vault",
            CredentialSource::None => "none",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "env" => CredentialSource::Env,
            "vault" => CredentialSource::Vault,
            _ => CredentialSource::None,
        }
    }
}

/// An upstream provider a model belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub enabled: bool,
    pub credential_source: CredentialSource,
}
