use crate::{
    error::{ServiceError, ServiceFailure},
    service::CompletionService,
};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

type Responder = dyn Fn(&str) -> Result<String, String> + Send + Sync;

/// Scripted completion service for tests and offline demos.
///
/// Every prompt is recorded, and the reply is produced by a plain closure.
/// An `Err(message)` from the closure becomes a [`ServiceError`].
pub struct MockService {
    responder: Box<Responder>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl MockService {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `prefix` followed by the prompt.
    pub fn echo(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::new(move |prompt| Ok(format!("{}{}", prefix, prompt)))
    }

    /// Reply with the same text to every prompt.
    pub fn always(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(move |_| Ok(reply.clone()))
    }

    /// Fail every call.
    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |_| Err(message.clone()))
    }

    /// Wait this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Prompts received so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

impl std::fmt::Debug for MockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockService")
            .field("delay", &self.delay)
            .field("calls", &self.call_count())
            .finish()
    }
}

#[async_trait]
impl CompletionService for MockService {
    async fn complete(&self, prompt: &str) -> Result<String, ServiceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(prompt.to_string());
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        (self.responder)(prompt).map_err(|msg| ServiceError::new(prompt, ServiceFailure::Other(msg)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
