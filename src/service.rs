use crate::error::ServiceError;
use async_trait::async_trait;
use std::sync::Arc;

/// Anything that turns a text prompt into a text completion.
///
/// Implementations are shared by every stage of a pipeline and must not keep
/// per-call state that changes the result of later calls.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Complete a single prompt.
    async fn complete(&self, prompt: &str) -> Result<String, ServiceError>;

    /// Short backend name used in log output.
    fn name(&self) -> &str {
        "completion-service"
    }
}

#[async_trait]
impl<S> CompletionService for Arc<S>
where
    S: CompletionService + ?Sized,
{
    async fn complete(&self, prompt: &str) -> Result<String, ServiceError> {
        (**self).complete(prompt).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
