//! # Prompt Pipe
//!
//! Composable map / filter / reduce pipelines over LLM completions.
//!
//! A [`Pipeline`] starts from a seed text and threads it through an ordered
//! list of stages. Each stage turns the current [`Value`] into the next one by
//! calling a [`CompletionService`]:
//!
//! - **map** / **map_before** — one completion per template, giving a sequence
//! - **filter** — keep the items the model answers "yes" for
//! - **reduce** — collapse a sequence into a single text
//!
//! ## Failure model
//!
//! Execution is best-effort by default. A failed completion inside map or
//! filter drops that item; a failed reduce leaves [`Value::Missing`]; a stage
//! that fails as a whole leaves the value untouched and the next stage runs on
//! it. [`Pipeline::execute`] never returns an error. Use [`Pipeline::run`] to
//! see what was swallowed, or [`Pipeline::execute_strict`] to stop at the
//! first failure.
//!
//! ## Quick Start
//!
//! ```no_run
//! use prompt_pipe::{OpenAiClient, Pipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = Arc::new(OpenAiClient::from_env());
//!
//!     let output = Pipeline::new("nietzsche thoughts about", service)
//!         .map(["apples", "cats", "magnets", "orange juice"])
//!         .filter("mentions any fruit")
//!         .reduce("twitter post")
//!         .execute()
//!         .await;
//!
//!     println!("{}", output);
//! }
//! ```

pub mod client;
pub mod error;
pub mod mock;
pub mod pipeline;
pub mod prompt;
pub mod service;
pub mod stage;
pub mod types;

pub use client::{LlmConfig, OllamaClient, OpenAiClient};
pub use error::{PipelineError, Result, ServiceError, ServiceFailure};
pub use mock::MockService;
pub use pipeline::Pipeline;
pub use service::CompletionService;
pub use stage::{Stage, StageContext, StageOutput};
pub use types::{Failure, PipelineProgress, PipelineReport, Shape, Value};
