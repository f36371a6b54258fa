use std::time::Duration;
use thiserror::Error;

/// Why a single completion call failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceFailure {
    #[error("configuration error: environment variable {0} is not set")]
    MissingApiKey(String),

    #[error("failed to connect to {url}: {message}")]
    Connection { url: String, message: String },

    #[error("LLM returned error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    InvalidResponse(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

impl ServiceFailure {
    /// True when the failure comes from missing or bad configuration rather
    /// than from the backend itself.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ServiceFailure::MissingApiKey(_))
    }
}

/// A failed call to a [`CompletionService`](crate::CompletionService).
///
/// Carries the prompt that was being completed so that per-item failures can
/// be traced back to the template, item or operation that produced them.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("completion failed: {cause}")]
pub struct ServiceError {
    pub prompt: String,
    #[source]
    pub cause: ServiceFailure,
}

impl ServiceError {
    pub fn new(prompt: impl Into<String>, cause: ServiceFailure) -> Self {
        Self {
            prompt: prompt.into(),
            cause,
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage {stage} ({kind}) failed on item {item}")]
    ItemFailed {
        stage: usize,
        kind: &'static str,
        item: usize,
        #[source]
        source: ServiceError,
    },

    #[error("Stage {stage} ({kind}) expects {expected} input, found {found}")]
    TypeMismatch {
        stage: usize,
        kind: &'static str,
        expected: String,
        found: String,
    },

    #[error("Stage {stage} ({kind}) failed: {message}")]
    StageExecution {
        stage: usize,
        kind: &'static str,
        message: String,
    },

    #[error("Pipeline was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
