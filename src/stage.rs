//! Stage functions and the constructors that build them.
//!
//! A stage receives the value produced by the previous stage and returns the
//! next one. The four built-in stages fan a value out into completions
//! ([`map`], [`map_before`]), narrow a sequence ([`filter`]) or collapse it
//! into one text ([`reduce`]). Failures of single completions are isolated:
//! they are logged, returned as [`ItemFailure`]s and never abort the stage.

use crate::{
    error::{PipelineError, Result, ServiceError, ServiceFailure},
    prompt,
    service::CompletionService,
    types::{Shape, Value},
};
use async_trait::async_trait;
use futures::{future::BoxFuture, stream, Future, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

const ANY_SHAPE: &[Shape] = &[Shape::Scalar, Shape::Sequence];
const SEQUENCE_ONLY: &[Shape] = &[Shape::Sequence];

/// Input shapes a stage accepts and the shape it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub accepts: &'static [Shape],

    /// `None` when the output shape is only known at run time.
    pub produces: Option<Shape>,
}

impl Signature {
    pub fn accepts_shape(&self, shape: Shape) -> bool {
        self.accepts.contains(&shape)
    }

    /// Human readable list of accepted shapes.
    pub fn expected(&self) -> String {
        self.accepts
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

/// A completion that failed inside a stage.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    /// Position of the template or item that failed.
    pub item: usize,
    pub error: ServiceError,
}

/// What a stage hands back to the pipeline.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub value: Value,
    pub failures: Vec<ItemFailure>,
}

impl StageOutput {
    pub fn clean(value: Value) -> Self {
        Self {
            value,
            failures: Vec::new(),
        }
    }
}

/// A unit of deferred work in a pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short name used in logs and errors (`map`, `filter`, ...).
    fn kind(&self) -> &'static str;

    fn signature(&self) -> Signature;

    /// Produce the next value from `input`.
    ///
    /// An `Err` means the stage as a whole failed. Failures of individual
    /// completions belong in [`StageOutput::failures`].
    async fn run(&self, ctx: &StageContext<'_>, input: &Value) -> Result<StageOutput>;
}

/// Everything a stage needs to talk to the completion service.
pub struct StageContext<'a> {
    service: &'a dyn CompletionService,
    stage_index: usize,
    call_timeout: Option<Duration>,
    concurrency: usize,
    fail_fast: bool,
    cancellation: Option<&'a AtomicBool>,
}

impl<'a> StageContext<'a> {
    pub fn new(service: &'a dyn CompletionService, stage_index: usize) -> Self {
        Self {
            service,
            stage_index,
            call_timeout: None,
            concurrency: 1,
            fail_fast: false,
            cancellation: None,
        }
    }

    /// Give up on a single call after `limit`.
    pub fn call_timeout(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }

    /// Number of calls allowed in flight at once. Results keep input order.
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    /// Turn the first failed call into a stage error.
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    pub fn cancellation(mut self, flag: Option<&'a AtomicBool>) -> Self {
        self.cancellation = flag;
        self
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn service(&self) -> &dyn CompletionService {
        self.service
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Complete one prompt, honouring the call timeout.
    pub async fn complete(&self, prompt: &str) -> std::result::Result<String, ServiceError> {
        debug!(
            stage = self.stage_index,
            service = self.service.name(),
            prompt = %prompt,
            "calling completion service"
        );

        let reply = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.service.complete(prompt)).await {
                Ok(reply) => reply,
                Err(_) => Err(ServiceError::new(prompt, ServiceFailure::Timeout(limit))),
            },
            None => self.service.complete(prompt).await,
        };

        match &reply {
            Ok(text) => debug!(stage = self.stage_index, response = %text, "completion received"),
            Err(err) => error!(stage = self.stage_index, prompt = %prompt, error = %err, "completion failed"),
        }
        reply
    }

    /// Complete every prompt and return the replies in prompt order.
    ///
    /// Returns `Err` only on cancellation, or on the first failed call when
    /// fail-fast is set.
    pub async fn complete_each(
        &self,
        kind: &'static str,
        prompts: Vec<String>,
    ) -> Result<Vec<std::result::Result<String, ServiceError>>> {
        let total = prompts.len();
        let mut replies = stream::iter(prompts)
            .map(|prompt| async move {
                if self.is_cancelled() {
                    return None;
                }
                Some(self.complete(&prompt).await)
            })
            .buffered(self.concurrency);

        let mut results = Vec::with_capacity(total);
        while let Some(reply) = replies.next().await {
            let Some(reply) = reply else {
                return Err(PipelineError::Cancelled);
            };
            if self.fail_fast {
                if let Err(err) = &reply {
                    return Err(PipelineError::ItemFailed {
                        stage: self.stage_index,
                        kind,
                        item: results.len(),
                        source: err.clone(),
                    });
                }
            }
            results.push(reply);
        }
        Ok(results)
    }

    fn type_mismatch(&self, kind: &'static str, signature: Signature, input: &Value) -> PipelineError {
        PipelineError::TypeMismatch {
            stage: self.stage_index,
            kind,
            expected: signature.expected(),
            found: input.shape_name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Template after the input.
    After,
    /// Template before the input.
    Before,
}

/// One completion per template, collected into a sequence.
#[derive(Debug, Clone)]
pub struct Map {
    templates: Vec<String>,
    placement: Placement,
}

impl Map {
    fn prompt_for(&self, input: &str, template: &str) -> String {
        match self.placement {
            Placement::After => prompt::append(input, template),
            Placement::Before => prompt::prepend(template, input),
        }
    }
}

#[async_trait]
impl Stage for Map {
    fn kind(&self) -> &'static str {
        match self.placement {
            Placement::After => "map",
            Placement::Before => "map_before",
        }
    }

    fn signature(&self) -> Signature {
        Signature {
            accepts: ANY_SHAPE,
            produces: Some(Shape::Sequence),
        }
    }

    async fn run(&self, ctx: &StageContext<'_>, input: &Value) -> Result<StageOutput> {
        let text = input
            .as_text()
            .ok_or_else(|| ctx.type_mismatch(self.kind(), self.signature(), input))?;
        debug!(templates = ?self.templates, "mapping");

        let prompts = self
            .templates
            .iter()
            .map(|template| self.prompt_for(&text, template))
            .collect();
        let replies = ctx.complete_each(self.kind(), prompts).await?;

        let mut values = Vec::with_capacity(replies.len());
        let mut failures = Vec::new();
        for (idx, reply) in replies.into_iter().enumerate() {
            match reply {
                Ok(text) => values.push(text),
                Err(error) => {
                    warn!(template = %self.templates[idx], error = %error, "dropping failed map item");
                    failures.push(ItemFailure { item: idx, error });
                }
            }
        }

        Ok(StageOutput {
            value: Value::Sequence(values),
            failures,
        })
    }
}

/// Keeps the items the model judges to satisfy a condition.
#[derive(Debug, Clone)]
pub struct Filter {
    condition: String,
}

#[async_trait]
impl Stage for Filter {
    fn kind(&self) -> &'static str {
        "filter"
    }

    fn signature(&self) -> Signature {
        Signature {
            accepts: SEQUENCE_ONLY,
            produces: Some(Shape::Sequence),
        }
    }

    async fn run(&self, ctx: &StageContext<'_>, input: &Value) -> Result<StageOutput> {
        let items = input
            .as_sequence()
            .ok_or_else(|| ctx.type_mismatch(self.kind(), self.signature(), input))?;
        debug!(condition = %self.condition, items = items.len(), "filtering");

        let prompts = items
            .iter()
            .map(|item| prompt::judgment(item, &self.condition))
            .collect();
        let replies = ctx.complete_each(self.kind(), prompts).await?;

        let mut kept = Vec::new();
        let mut failures = Vec::new();
        for ((idx, item), reply) in items.iter().enumerate().zip(replies) {
            match reply {
                Ok(answer) if prompt::is_affirmative(&answer) => kept.push(item.clone()),
                Ok(answer) => debug!(item = idx, answer = %answer, "item excluded"),
                Err(error) => {
                    warn!(condition = %self.condition, item = idx, error = %error, "excluding item after failed judgment");
                    failures.push(ItemFailure { item: idx, error });
                }
            }
        }

        Ok(StageOutput {
            value: Value::Sequence(kept),
            failures,
        })
    }
}

/// Collapses a sequence into one text with a single completion.
#[derive(Debug, Clone)]
pub struct Reduce {
    operation: String,
}

#[async_trait]
impl Stage for Reduce {
    fn kind(&self) -> &'static str {
        "reduce"
    }

    fn signature(&self) -> Signature {
        Signature {
            accepts: SEQUENCE_ONLY,
            produces: Some(Shape::Scalar),
        }
    }

    async fn run(&self, ctx: &StageContext<'_>, input: &Value) -> Result<StageOutput> {
        let items = input
            .as_sequence()
            .ok_or_else(|| ctx.type_mismatch(self.kind(), self.signature(), input))?;
        debug!(operation = %self.operation, items = items.len(), "reducing");

        let content = prompt::reduction(&self.operation, items);
        let mut replies = ctx.complete_each(self.kind(), vec![content]).await?;

        match replies.pop() {
            Some(Ok(text)) => Ok(StageOutput::clean(Value::Scalar(text))),
            Some(Err(error)) => {
                warn!(operation = %self.operation, error = %error, "reduce failed, stage yields no value");
                Ok(StageOutput {
                    value: Value::Missing,
                    failures: vec![ItemFailure { item: 0, error }],
                })
            }
            None => Ok(StageOutput::clean(Value::Missing)),
        }
    }
}

type StageFn = dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// A stage backed by a plain async closure.
pub struct FnStage {
    kind: &'static str,
    f: Box<StageFn>,
}

impl std::fmt::Debug for FnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("kind", &self.kind).finish()
    }
}

#[async_trait]
impl Stage for FnStage {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn signature(&self) -> Signature {
        Signature {
            accepts: ANY_SHAPE,
            produces: None,
        }
    }

    async fn run(&self, ctx: &StageContext<'_>, input: &Value) -> Result<StageOutput> {
        let value = (self.f)(input.clone())
            .await
            .map_err(|e| PipelineError::StageExecution {
                stage: ctx.stage_index(),
                kind: self.kind,
                message: format!("{:#}", e),
            })?;
        Ok(StageOutput::clean(value))
    }
}

fn owned<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Prompt `"<input> <template>"` for every template.
pub fn map<I, S>(templates: I) -> Box<dyn Stage>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Box::new(Map {
        templates: owned(templates),
        placement: Placement::After,
    })
}

/// Prompt `"<template> <input>"` for every template.
pub fn map_before<I, S>(templates: I) -> Box<dyn Stage>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Box::new(Map {
        templates: owned(templates),
        placement: Placement::Before,
    })
}

/// Keep the items for which the model answers "yes" to `condition`.
pub fn filter(condition: impl Into<String>) -> Box<dyn Stage> {
    Box::new(Filter {
        condition: condition.into(),
    })
}

/// Collapse all items into one text described by `operation`.
pub fn reduce(operation: impl Into<String>) -> Box<dyn Stage> {
    Box::new(Reduce {
        operation: operation.into(),
    })
}

/// Wrap an async closure as a stage. Errors it returns fail the whole stage.
pub fn from_fn<F, Fut>(kind: &'static str, f: F) -> Box<dyn Stage>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Box::new(FnStage {
        kind,
        f: Box::new(move |value| Box::pin(f(value))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockService;

    fn seq(items: &[&str]) -> Value {
        Value::Sequence(items.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn test_map_prompt_order() {
        let service = MockService::echo("");
        let ctx = StageContext::new(&service, 0);
        let out = map(["a", "b"]).run(&ctx, &Value::from("X")).await.unwrap();
        assert_eq!(out.value, seq(&["X a", "X b"]));

        let out = map_before(["a", "b"]).run(&ctx, &Value::from("X")).await.unwrap();
        assert_eq!(out.value, seq(&["a X", "b X"]));
    }

    #[tokio::test]
    async fn test_map_drops_failed_templates_without_placeholder() {
        let service = MockService::new(|p| {
            if p.ends_with("bad") {
                Err("nope".to_string())
            } else {
                Ok(p.to_uppercase())
            }
        });
        let ctx = StageContext::new(&service, 3);
        let out = map(["one", "bad", "two"]).run(&ctx, &Value::from("x")).await.unwrap();
        assert_eq!(out.value, seq(&["X ONE", "X TWO"]));
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].item, 1);
        assert_eq!(out.failures[0].error.prompt, "x bad");
    }

    #[tokio::test]
    async fn test_map_empty_templates() {
        let service = MockService::always("unused");
        let ctx = StageContext::new(&service, 0);
        let out = map(Vec::<String>::new()).run(&ctx, &Value::from("x")).await.unwrap();
        assert_eq!(out.value, seq(&[]));
        assert_eq!(service.call_count(), 0);
    }

    #[tokio::test]
    async fn test_map_reads_sequence_as_joined_text() {
        let service = MockService::echo("");
        let ctx = StageContext::new(&service, 0);
        let out = map(["t"]).run(&ctx, &seq(&["a", "b"])).await.unwrap();
        assert_eq!(out.value, seq(&["a,b t"]));
    }

    #[tokio::test]
    async fn test_filter_rejects_scalar() {
        let service = MockService::always("yes");
        let ctx = StageContext::new(&service, 2);
        let err = filter("c").run(&ctx, &Value::from("x")).await.unwrap_err();
        match err {
            PipelineError::TypeMismatch { stage, kind, found, .. } => {
                assert_eq!(stage, 2);
                assert_eq!(kind, "filter");
                assert_eq!(found, "scalar");
            }
            other => panic!("Expected TypeMismatch, got {other:?}"),
        }
        assert_eq!(service.call_count(), 0);
    }

    #[tokio::test]
    async fn test_filter_fail_closed() {
        let service = MockService::new(|p| match p.split(prompt::SEPARATOR).next() {
            Some("keep") => Ok(" Yes. ".to_string()),
            Some("maybe") => Ok("Yes, definitely".to_string()),
            Some("broken") => Err("timeout".to_string()),
            _ => Ok("no".to_string()),
        });
        let ctx = StageContext::new(&service, 1);
        let out = filter("cond")
            .run(&ctx, &seq(&["keep", "maybe", "broken", "drop", "keep"]))
            .await
            .unwrap();
        assert_eq!(out.value, seq(&["keep", "keep"]));
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].item, 2);
    }

    #[tokio::test]
    async fn test_reduce_failure_yields_missing() {
        let service = MockService::failing("down");
        let ctx = StageContext::new(&service, 0);
        let out = reduce("summary").run(&ctx, &seq(&["a"])).await.unwrap();
        assert_eq!(out.value, Value::Missing);
        assert_eq!(out.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_reduce_fail_fast_reports_item() {
        let service = MockService::failing("down");
        let ctx = StageContext::new(&service, 4).fail_fast(true);
        let err = reduce("summary").run(&ctx, &seq(&["a"])).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ItemFailed { stage: 4, kind: "reduce", item: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_fail_fast_stops_issuing_calls() {
        let service = MockService::failing("down");
        let ctx = StageContext::new(&service, 0).fail_fast(true);
        let result = map(["a", "b", "c"]).run(&ctx, &Value::from("x")).await;
        assert!(result.is_err());
        assert_eq!(service.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_makes_no_calls() {
        let service = MockService::always("yes");
        let flag = AtomicBool::new(true);
        let ctx = StageContext::new(&service, 0).cancellation(Some(&flag));
        let err = map(["a"]).run(&ctx, &Value::from("x")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(service.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout() {
        let service = MockService::always("late").with_delay(Duration::from_secs(30));
        let ctx = StageContext::new(&service, 0).call_timeout(Some(Duration::from_secs(1)));
        let err = ctx.complete("p").await.unwrap_err();
        assert_eq!(err.cause, ServiceFailure::Timeout(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_from_fn_error_is_stage_error() {
        let service = MockService::always("unused");
        let ctx = StageContext::new(&service, 5);
        let stage = from_fn("explode", |_| async { Err(anyhow::anyhow!("kaboom")) });
        let err = stage.run(&ctx, &Value::from("x")).await.unwrap_err();
        assert_eq!(err.to_string(), "Stage 5 (explode) failed: kaboom");
    }

    #[test]
    fn test_signatures() {
        assert_eq!(map(["a"]).signature().produces, Some(Shape::Sequence));
        assert!(map_before(["a"]).signature().accepts_shape(Shape::Scalar));
        assert!(!filter("c").signature().accepts_shape(Shape::Scalar));
        assert_eq!(reduce("r").signature().produces, Some(Shape::Scalar));
        assert_eq!(map(["a"]).signature().expected(), "scalar or sequence");
        assert_eq!(from_fn("f", |v| async move { Ok(v) }).signature().produces, None);
    }
}
