//! The capability set every upstream provider adapter implements
//!
//! The routing engine references adapters by provider id and only ever calls
//! through this trait; adapters never call back into the engine.

use async_trait::async_trait;

use crate::models::ProviderKind;

use super::{ChatRequest, ChunkStream, ProviderError, ProviderResponse, ProviderResult};

/// Upstream-provider client bound to a provider id.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The provider id this adapter serves.
    fn id(&self) -> &str;

    /// The provider type tag.
    fn kind(&self) -> ProviderKind;

    /// Send a non-streaming chat completion.
    async fn send(&self, request: &ChatRequest) -> ProviderResult<ProviderResponse>;

    /// Open a streaming chat completion. Dropping the stream cancels the
    /// upstream read.
    async fn send_stream(&self, request: ChatRequest) -> ProviderResult<ChunkStream>;

    /// Classify an upstream HTTP error into the retry taxonomy.
    fn classify_error(&self, status: u16, body: &str) -> ProviderError;

    /// Full URL the health prober GETs, if the provider exposes one.
    fn health_endpoint(&self) -> Option<String>;
}
