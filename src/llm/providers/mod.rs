//! Concrete upstream adapters
//!
//! Three variants: OpenAI-like, Anthropic, and vLLM. They differ in auth
//! headers, stream framing, and the error strings that map to a context
//! overflow; everything else is shared through [`crate::llm::traits`].

pub mod anthropic;
pub mod openai;
pub mod vllm;

use std::sync::Arc;
use std::time::Duration;

use crate::models::{Provider, ProviderKind};

use super::traits::ProviderAdapter;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;
pub use vllm::VllmAdapter;

/// Build the adapter for a provider record with an already-resolved
/// credential. The HTTP client carries the per-provider timeout.
pub fn build_adapter(
    provider: &Provider,
    credential: Option<String>,
    timeout: Duration,
) -> Arc<dyn ProviderAdapter> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    match provider.kind {
        ProviderKind::Openai => Arc::new(OpenAiAdapter::new(
            provider.id.clone(),
            provider.base_url.clone(),
            credential,
            client,
        )),
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(
            provider.id.clone(),
            provider.base_url.clone(),
            credential,
            client,
        )),
        ProviderKind::Vllm => Arc::new(VllmAdapter::new(
            provider.id.clone(),
            provider.base_url.clone(),
            credential,
            client,
        )),
    }
}

/// Conventional environment variable holding the provider's API key.
pub fn env_var_for(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Openai => "OPENAI_API_KEY",
        ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        ProviderKind::Vllm => "VLLM_API_KEY",
    }
}
