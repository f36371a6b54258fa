use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two shapes a present value can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Scalar,
    Sequence,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Scalar => f.write_str("scalar"),
            Shape::Sequence => f.write_str("sequence"),
        }
    }
}

/// The datum threaded from one stage to the next.
///
/// A pipeline starts from a `Scalar` seed. Map and filter stages produce a
/// `Sequence`, reduce collapses it back to a `Scalar`. A reduce whose single
/// call fails leaves `Missing` behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Scalar(String),
    Sequence(Vec<String>),
    Missing,
}

impl Value {
    pub fn shape(&self) -> Option<Shape> {
        match self {
            Value::Scalar(_) => Some(Shape::Scalar),
            Value::Sequence(_) => Some(Shape::Sequence),
            Value::Missing => None,
        }
    }

    /// Describe the value's shape for error messages.
    pub fn shape_name(&self) -> String {
        self.shape()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "missing".to_string())
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[String]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// The value read as one piece of text.
    ///
    /// Sequences are joined with `","`. `Missing` has no text.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Scalar(s) => Some(s.clone()),
            Value::Sequence(items) => Some(items.join(",")),
            Value::Missing => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(s)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::Sequence(items)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(s) => f.write_str(s),
            Value::Sequence(items) => f.write_str(&items.join("\n")),
            Value::Missing => Ok(()),
        }
    }
}

/// Progress update emitted when a stage starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineProgress {
    /// Current stage index (0-based).
    pub stage_index: usize,

    /// Total number of stages in the pipeline.
    pub total_stages: usize,

    /// Kind of the current stage (`map`, `filter`, ...).
    pub stage: String,
}

/// One failure recorded while running a pipeline.
#[derive(Debug)]
pub struct Failure {
    pub stage_index: usize,
    pub stage: &'static str,

    /// Position of the failed item within the stage, or `None` when the
    /// stage as a whole failed.
    pub item: Option<usize>,

    pub error: PipelineError,
}

/// Everything a lenient run observed.
#[derive(Debug)]
pub struct PipelineReport {
    /// Final value, possibly degraded by the failures below.
    pub output: Value,

    /// Per-item and stage-level failures in the order they happened.
    pub failures: Vec<Failure>,

    /// Number of stages that were started.
    pub stages_run: usize,

    pub cancelled: bool,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}
