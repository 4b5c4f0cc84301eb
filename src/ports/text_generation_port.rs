//! Text-generation capability port.

use async_trait::async_trait;

use crate::domain::error::GenerationError;

/// Prompt in, text out. One call per invocation; implementations bound the
/// call with their own timeout and never retry.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}
