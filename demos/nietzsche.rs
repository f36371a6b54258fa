//! Reference pipeline: musings on a few topics, keep the fruity ones,
//! fold them into a single post.
//!
//! ```text
//! OPENAI_API_KEY=... cargo run --example nietzsche
//! PROMPT_PIPE_BACKEND=ollama OLLAMA_MODEL=llama3.2 cargo run --example nietzsche
//! RUST_LOG=prompt_pipe=debug cargo run --example nietzsche
//! ```

use prompt_pipe::{CompletionService, OllamaClient, OpenAiClient, Pipeline, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let service: Arc<dyn CompletionService> = match std::env::var("PROMPT_PIPE_BACKEND").as_deref() {
        Ok("ollama") => Arc::new(OllamaClient::from_env()),
        _ => Arc::new(OpenAiClient::from_env()),
    };

    let report = Pipeline::new("nietzsche thoughts about", service)
        .with_call_timeout(Duration::from_secs(120))
        .map(["apples", "cats", "magnets", "orange juice"])
        .filter("mentions any fruit")
        .reduce("twitter post")
        .run()
        .await;

    for failure in &report.failures {
        tracing::warn!(stage = failure.stage, error = %failure.error, "swallowed failure");
    }

    match report.output {
        Value::Missing => anyhow::bail!("pipeline produced no value"),
        output => println!("{}", output),
    }
    Ok(())
}
