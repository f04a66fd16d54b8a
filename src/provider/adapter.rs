//! The uniform capability every backing provider exposes.

use crate::models::{GenerationError, ProviderConfig, ProviderKind, Result};
use crate::provider::{ChatCompletionsAdapter, MessagesAdapter, OutputSchema, StructuredResult};
use async_trait::async_trait;
use std::sync::Arc;

/// A backing text-generation service.
///
/// One call is one attempt. Retries, timeouts and concurrency limits are
/// applied around the adapter by the provider pool.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Identifier recorded with every result.
    fn id(&self) -> &str;

    /// Generate one result satisfying `schema`, or classify the failure.
    async fn generate(
        &self,
        rendered_prompt: &str,
        schema: &OutputSchema,
    ) -> std::result::Result<StructuredResult, GenerationError>;
}

/// Build the adapter for a configured provider.
pub fn build_adapter(config: &ProviderConfig) -> Result<Arc<dyn ProviderAdapter>> {
    match config.kind {
        ProviderKind::OpenaiCompatible => Ok(Arc::new(ChatCompletionsAdapter::from_config(config)?)),
        ProviderKind::AnthropicMessages => Ok(Arc::new(MessagesAdapter::from_config(config)?)),
    }
}
