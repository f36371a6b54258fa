use crate::{
    error::Result,
    service::CompletionService,
    stage::{self, Stage, StageContext},
    types::{Failure, PipelineProgress, PipelineReport, Shape, Value},
    PipelineError,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tracing::{debug, debug_span, error, warn, Instrument};

/// An ordered chain of stages over a completion service.
///
/// The seed text enters the first stage, each stage's output feeds the next,
/// and the last output is the result. Stages run in the order they were
/// added and every completion inside a stage is issued one at a time unless
/// [`with_concurrency`](Pipeline::with_concurrency) says otherwise.
pub struct Pipeline {
    seed: String,
    stages: Vec<Box<dyn Stage>>,
    service: Arc<dyn CompletionService>,
    call_timeout: Option<Duration>,
    concurrency: usize,
    cancellation: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("seed", &self.seed)
            .field("stages", &self.stage_kinds())
            .field("service", &self.service.name())
            .field("call_timeout", &self.call_timeout)
            .field("concurrency", &self.concurrency)
            .field("has_cancellation", &self.cancellation.is_some())
            .finish()
    }
}

impl Pipeline {
    /// Create a pipeline seeded with `seed` and no stages.
    pub fn new(seed: impl Into<String>, service: Arc<dyn CompletionService>) -> Self {
        let seed = seed.into();
        debug!(seed = %seed, service = service.name(), "initialized pipeline");
        Self {
            seed,
            stages: Vec::new(),
            service,
            call_timeout: None,
            concurrency: 1,
            cancellation: None,
        }
    }

    /// Append a stage.
    pub fn add_stage(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn map<I, S>(self, templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_stage(stage::map(templates))
    }

    pub fn map_before<I, S>(self, templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_stage(stage::map_before(templates))
    }

    pub fn filter(self, condition: impl Into<String>) -> Self {
        self.add_stage(stage::filter(condition))
    }

    pub fn reduce(self, operation: impl Into<String>) -> Self {
        self.add_stage(stage::reduce(operation))
    }

    /// Fail any single completion that takes longer than `limit`.
    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = Some(limit);
        self
    }

    /// Allow up to `limit` completions of one stage in flight at once.
    ///
    /// Output order still follows input order. `1` (the default) keeps calls
    /// strictly sequential; `0` is treated as `1`.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    /// Set a cancellation flag that can be used to abort execution.
    ///
    /// The flag is checked before every stage and before every call. When it
    /// trips partway through a stage, the replies that stage already received
    /// are discarded and the run ends with the value from before the stage.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(cancel);
        self
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_kinds(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    /// Check that every stage accepts the shape its predecessor produces.
    ///
    /// Stages with a run-time output shape end the check for their successor.
    pub fn validate(&self) -> Result<()> {
        let mut current = Some(Shape::Scalar);
        for (idx, stage) in self.stages.iter().enumerate() {
            let signature = stage.signature();
            if let Some(shape) = current {
                if !signature.accepts_shape(shape) {
                    return Err(PipelineError::TypeMismatch {
                        stage: idx,
                        kind: stage.kind(),
                        expected: signature.expected(),
                        found: shape.to_string(),
                    });
                }
            }
            current = signature.produces;
        }
        Ok(())
    }

    /// Run every stage and return the final value.
    ///
    /// Never fails. Failed completions are dropped from their stage's output
    /// and a failed stage leaves the value as it was before that stage.
    pub async fn execute(&self) -> Value {
        self.run().await.output
    }

    /// Like [`execute`](Pipeline::execute), also returning every failure
    /// that was swallowed along the way.
    ///
    /// A cancelled run sets [`PipelineReport::cancelled`] and keeps the value
    /// as it stood before the interrupted stage; that stage's partial
    /// replies are not kept.
    pub async fn run(&self) -> PipelineReport {
        self.run_with_progress(|_| {}).await
    }

    /// Lenient run with a callback invoked at the start of each stage.
    pub async fn run_with_progress<F>(&self, on_progress: F) -> PipelineReport
    where
        F: FnMut(PipelineProgress),
    {
        if let Err(err) = self.validate() {
            warn!(error = %err, "pipeline stages do not line up, continuing anyway");
        }
        self.drive(false, on_progress).await
    }

    /// Run every stage, stopping at the first failure of any kind.
    pub async fn execute_strict(&self) -> Result<Value> {
        self.validate()?;
        let mut report = self.drive(true, |_| {}).await;
        if let Some(failure) = report.failures.pop() {
            return Err(failure.error);
        }
        if report.cancelled {
            return Err(PipelineError::Cancelled);
        }
        Ok(report.output)
    }

    /// Check whether cancellation has been requested.
    fn check_cancelled(&self) -> Result<()> {
        if let Some(ref cancel) = self.cancellation {
            if cancel.load(Ordering::Relaxed) {
                return Err(PipelineError::Cancelled);
            }
        }
        Ok(())
    }

    fn context(&self, stage_index: usize, strict: bool) -> StageContext<'_> {
        StageContext::new(self.service.as_ref(), stage_index)
            .call_timeout(self.call_timeout)
            .concurrency(self.concurrency)
            .fail_fast(strict)
            .cancellation(self.cancellation.as_deref())
    }

    /// Thread the value through the stages. In strict mode the first
    /// recorded failure ends the run.
    async fn drive<F>(&self, strict: bool, mut on_progress: F) -> PipelineReport
    where
        F: FnMut(PipelineProgress),
    {
        debug!(stages = self.stages.len(), strict, "executing pipeline");

        let mut data = Value::Scalar(self.seed.clone());
        let mut failures = Vec::new();
        let mut stages_run = 0;
        let mut cancelled = false;
        let total_stages = self.stages.len();

        for (idx, stage) in self.stages.iter().enumerate() {
            if self.check_cancelled().is_err() {
                warn!(stage = idx, "pipeline cancelled");
                cancelled = true;
                break;
            }

            on_progress(PipelineProgress {
                stage_index: idx,
                total_stages,
                stage: stage.kind().to_string(),
            });
            stages_run += 1;

            let ctx = self.context(idx, strict);
            let span = debug_span!("stage", index = idx, kind = stage.kind());
            match stage.run(&ctx, &data).instrument(span).await {
                Ok(output) => {
                    failures.extend(output.failures.into_iter().map(|f| Failure {
                        stage_index: idx,
                        stage: stage.kind(),
                        item: Some(f.item),
                        error: PipelineError::ItemFailed {
                            stage: idx,
                            kind: stage.kind(),
                            item: f.item,
                            source: f.error,
                        },
                    }));
                    data = output.value;
                }
                Err(PipelineError::Cancelled) => {
                    warn!(stage = idx, "pipeline cancelled");
                    cancelled = true;
                    break;
                }
                Err(err) => {
                    error!(stage = idx, kind = stage.kind(), error = %err, "stage failed, keeping previous value");
                    let item = match &err {
                        PipelineError::ItemFailed { item, .. } => Some(*item),
                        _ => None,
                    };
                    failures.push(Failure {
                        stage_index: idx,
                        stage: stage.kind(),
                        item,
                        error: err,
                    });
                    if strict {
                        break;
                    }
                }
            }
        }

        debug!(
            stages_run,
            failures = failures.len(),
            cancelled,
            "pipeline execution complete"
        );

        PipelineReport {
            output: data,
            failures,
            stages_run,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockService;

    fn service() -> Arc<dyn CompletionService> {
        Arc::new(MockService::always("yes"))
    }

    #[test]
    fn test_builder_keeps_stage_order() {
        let pipeline = Pipeline::new("seed", service())
            .map(["a"])
            .map_before(["b"])
            .filter("c")
            .reduce("d");
        assert_eq!(pipeline.len(), 4);
        assert_eq!(
            pipeline.stage_kinds(),
            vec!["map", "map_before", "filter", "reduce"]
        );
        assert_eq!(pipeline.seed(), "seed");
    }

    #[test]
    fn test_validate_accepts_reference_chain() {
        let pipeline = Pipeline::new("seed", service())
            .map(["a", "b"])
            .filter("c")
            .reduce("d")
            .map(["again"]);
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_filter_on_seed() {
        let pipeline = Pipeline::new("seed", service()).filter("c");
        match pipeline.validate().unwrap_err() {
            PipelineError::TypeMismatch {
                stage,
                kind,
                expected,
                found,
            } => {
                assert_eq!(stage, 0);
                assert_eq!(kind, "filter");
                assert_eq!(expected, "sequence");
                assert_eq!(found, "scalar");
            }
            other => panic!("Expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_skips_check_after_dynamic_stage() {
        let pipeline = Pipeline::new("seed", service())
            .add_stage(stage::from_fn("split", |v| async move { Ok(v) }))
            .reduce("d");
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_sequential() {
        let pipeline = Pipeline::new("seed", service()).with_concurrency(0);
        assert_eq!(pipeline.concurrency, 1);
    }

    #[test]
    fn test_pipeline_with_cancellation() {
        let cancel = Arc::new(AtomicBool::new(false));
        let pipeline = Pipeline::new("seed", service()).with_cancellation(cancel.clone());

        assert!(pipeline.check_cancelled().is_ok());

        cancel.store(true, Ordering::Relaxed);
        match pipeline.check_cancelled().unwrap_err() {
            PipelineError::Cancelled => {}
            other => panic!("Expected Cancelled error, got {other:?}"),
        }
    }

    #[test]
    fn test_debug_lists_stage_kinds() {
        let pipeline = Pipeline::new("seed", service()).map(["a"]).reduce("r");
        let shown = format!("{:?}", pipeline);
        assert!(shown.contains("\"map\""));
        assert!(shown.contains("\"reduce\""));
        assert!(shown.contains("mock"));
    }
}
