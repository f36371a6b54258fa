use crate::{
    error::{ServiceError, ServiceFailure},
    service::CompletionService,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::fmt;

pub const OPENAI_API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";

/// Sampling configuration shared by the HTTP backends.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f64,

    /// Maximum tokens to generate. `None` leaves it to the backend.
    pub max_tokens: Option<u32>,

    /// Remove a `<think>...</think>` block from replies before returning
    /// them. On by default, so replies from reasoning models reach the stages
    /// rewritten (block removed, remainder trimmed). Replies without a block
    /// are passed through as-is.
    pub strip_thinking: bool,

    /// Custom fields merged into the request (top level for OpenAI, the
    /// `options` object for Ollama).
    pub options: Option<Value>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: None,
            strip_thinking: true,
            options: None,
        }
    }
}

impl LlmConfig {
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn with_strip_thinking(mut self, enabled: bool) -> Self {
        self.strip_thinking = enabled;
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }
}

/// Where an API key comes from. Environment keys are read on every call so
/// a missing key only surfaces once a completion is attempted.
#[derive(Clone)]
enum ApiKey {
    Env(String),
    Literal(String),
}

impl ApiKey {
    fn resolve(&self) -> Result<String, ServiceFailure> {
        match self {
            ApiKey::Literal(key) => Ok(key.clone()),
            ApiKey::Env(var) => match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => Ok(key),
                _ => Err(ServiceFailure::MissingApiKey(var.clone())),
            },
        }
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiKey::Env(var) => write!(f, "Env({})", var),
            ApiKey::Literal(_) => f.write_str("Literal(***)"),
        }
    }
}

/// Single-turn chat completions against an OpenAI-compatible API.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: ApiKey,
    config: LlmConfig,
}

impl OpenAiClient {
    /// Client for `model` on the public OpenAI endpoint, keyed by
    /// `OPENAI_API_KEY`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: model.into(),
            api_key: ApiKey::Env(OPENAI_API_KEY_VAR.to_string()),
            config: LlmConfig::default(),
        }
    }

    /// Client configured from `OPENAI_BASE_URL` and `OPENAI_MODEL`, falling
    /// back to defaults. Never fails; the key is checked on first use.
    pub fn from_env() -> Self {
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_OPENAI_MODEL.into());
        let mut client = Self::new(model);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            client.base_url = url;
        }
        client
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = ApiKey::Literal(key.into());
        self
    }

    /// Read the key from a different environment variable.
    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key = ApiKey::Env(var.into());
        self
    }

    pub fn with_config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }

    /// Reuse an existing `reqwest::Client` (connection pool, proxies, ...).
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, prompt: &str) -> Result<String, ServiceFailure> {
        let key = self.api_key.resolve()?;
        let body = openai_request_body(&self.model, prompt, &self.config);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let json_response = post_json(&self.http, &url, &body, Some(&key)).await?;
        let raw = parse_openai_response(&json_response)?;
        Ok(finish_reply(raw, &self.config))
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn complete(&self, prompt: &str) -> Result<String, ServiceError> {
        self.call(prompt)
            .await
            .map_err(|cause| ServiceError::new(prompt, cause))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Non-streaming chat completions against a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: Client,
    endpoint: String,
    model: String,
    config: LlmConfig,
}

impl OllamaClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            config: LlmConfig::default(),
        }
    }

    /// Client configured from `OLLAMA_HOST` and `OLLAMA_MODEL`.
    pub fn from_env() -> Self {
        let endpoint = std::env::var("OLLAMA_HOST")
            .map(|host| {
                if host.starts_with("http://") || host.starts_with("https://") {
                    host
                } else {
                    format!("http://{}", host)
                }
            })
            .unwrap_or_else(|_| DEFAULT_OLLAMA_ENDPOINT.to_string());
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_OLLAMA_MODEL.into());
        Self::new(endpoint, model)
    }

    pub fn with_config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, prompt: &str) -> Result<String, ServiceFailure> {
        let body = ollama_request_body(&self.model, prompt, &self.config);
        let url = format!("{}/api/chat", self.endpoint.trim_end_matches('/'));
        let json_response = post_json(&self.http, &url, &body, None).await?;
        let raw = parse_ollama_response(&json_response)?;
        Ok(finish_reply(raw, &self.config))
    }
}

#[async_trait]
impl CompletionService for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String, ServiceError> {
        self.call(prompt)
            .await
            .map_err(|cause| ServiceError::new(prompt, cause))
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

/// POST a JSON body and return the decoded JSON reply.
async fn post_json(
    client: &Client,
    url: &str,
    body: &Value,
    bearer: Option<&str>,
) -> Result<Value, ServiceFailure> {
    let mut request = client.post(url).json(body);
    if let Some(key) = bearer {
        request = request.bearer_auth(key);
    }

    let resp = request.send().await.map_err(|e| ServiceFailure::Connection {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(ServiceFailure::Status { status, body: text });
    }

    resp.json::<Value>()
        .await
        .map_err(|e| ServiceFailure::InvalidResponse(e.to_string()))
}

fn user_message(prompt: &str) -> Value {
    json!([{ "role": "user", "content": prompt }])
}

/// Request body for `/chat/completions`.
pub fn openai_request_body(model: &str, prompt: &str, config: &LlmConfig) -> Value {
    let mut body = json!({
        "model": model,
        "messages": user_message(prompt),
        "temperature": config.temperature,
    });

    if let Some(max) = config.max_tokens {
        body["max_tokens"] = json!(max);
    }

    if let (Some(target), Some(custom)) = (
        body.as_object_mut(),
        config.options.as_ref().and_then(|o| o.as_object()),
    ) {
        for (k, v) in custom {
            target.insert(k.clone(), v.clone());
        }
    }

    body
}

/// Request body for Ollama's `/api/chat`.
pub fn ollama_request_body(model: &str, prompt: &str, config: &LlmConfig) -> Value {
    let mut body = json!({
        "model": model,
        "messages": user_message(prompt),
        "stream": false,
        "options": {
            "temperature": config.temperature,
        },
    });

    if let Some(max) = config.max_tokens {
        body["options"]["num_predict"] = json!(max);
    }

    merge_custom_options(&mut body, config);
    body
}

/// Pull `choices[0].message.content` out of a chat completion reply.
pub fn parse_openai_response(json_response: &Value) -> Result<String, ServiceFailure> {
    json_response
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ServiceFailure::InvalidResponse("missing choices[0].message.content".to_string())
        })
}

/// Pull `message.content` out of an Ollama chat reply.
pub fn parse_ollama_response(json_response: &Value) -> Result<String, ServiceFailure> {
    json_response
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ServiceFailure::InvalidResponse("missing message.content".to_string()))
}

fn finish_reply(raw: String, config: &LlmConfig) -> String {
    if config.strip_thinking {
        strip_think_block(&raw)
    } else {
        raw
    }
}

/// Drop a `<think>...</think>` block (DeepSeek R1 style) and trim what is
/// left. Replies without a complete block come back untouched.
fn strip_think_block(text: &str) -> String {
    let think_start = "<think>";
    let think_end = "</think>";

    match (text.find(think_start), text.find(think_end)) {
        (Some(start_idx), Some(end_idx)) if end_idx > start_idx => {
            let mut cleaned = String::with_capacity(text.len());
            cleaned.push_str(&text[..start_idx]);
            cleaned.push_str(&text[end_idx + think_end.len()..]);
            cleaned.trim().to_string()
        }
        _ => text.to_string(),
    }
}

/// Merge custom options into the body's options object.
fn merge_custom_options(body: &mut Value, config: &LlmConfig) {
    if let Some(ref opts) = config.options {
        if let Some(options) = body["options"].as_object_mut() {
            if let Some(custom) = opts.as_object() {
                for (k, v) in custom {
                    options.insert(k.clone(), v.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_think_block_present() {
        let text = "Before <think>my reasoning here</think> after";
        assert_eq!(strip_think_block(text), "Before  after");
    }

    #[test]
    fn test_strip_think_block_leaves_plain_reply_untouched() {
        assert_eq!(strip_think_block("  no thinking tags here\n"), "  no thinking tags here\n");
        assert_eq!(strip_think_block("</think> odd <think>"), "</think> odd <think>");
    }

    #[test]
    fn test_finish_reply_strips_think_block_for_judgments() {
        let config = LlmConfig::default();
        assert_eq!(finish_reply("<think>hmm</think>\nyes".into(), &config), "yes");

        let keep = LlmConfig::default().with_strip_thinking(false);
        assert_eq!(
            finish_reply("<think>hmm</think>yes".into(), &keep),
            "<think>hmm</think>yes"
        );
    }

    #[test]
    fn test_openai_body() {
        let config = LlmConfig::default()
            .with_max_tokens(64)
            .with_options(json!({"seed": 7}));
        let body = openai_request_body("gpt-3.5-turbo", "X a", &config);
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "X a");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["seed"], 7);
        assert_eq!(body["messages"].as_array().map(|m| m.len()), Some(1));
    }

    #[test]
    fn test_ollama_body() {
        let config = LlmConfig::default()
            .with_temperature(0.2)
            .with_max_tokens(128)
            .with_options(json!({"top_k": 10}));
        let body = ollama_request_body("llama3.2", "hello", &config);
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["temperature"], 0.2);
        assert_eq!(body["options"]["num_predict"], 128);
        assert_eq!(body["options"]["top_k"], 10);
        assert_eq!(body["messages"][0]["content"], "hello");
    }

    #[test]
    fn test_parse_openai_response() {
        let reply = json!({
            "choices": [{ "message": { "role": "assistant", "content": "yes" } }]
        });
        assert_eq!(parse_openai_response(&reply).unwrap(), "yes");

        let err = parse_openai_response(&json!({ "choices": [] })).unwrap_err();
        assert!(matches!(err, ServiceFailure::InvalidResponse(_)));
    }

    #[test]
    fn test_parse_ollama_response() {
        let reply = json!({ "message": { "role": "assistant", "content": "no" }, "done": true });
        assert_eq!(parse_ollama_response(&reply).unwrap(), "no");
        assert!(parse_ollama_response(&json!({ "response": "x" })).is_err());
    }

    #[test]
    fn test_llm_config_defaults() {
        let config = LlmConfig::default();
        assert_eq!(config.temperature, 0.0);
        assert!(config.max_tokens.is_none());
        assert!(config.strip_thinking);
        assert!(config.options.is_none());
    }

    #[tokio::test]
    async fn test_missing_key_surfaces_on_first_call() {
        let client = OpenAiClient::new("gpt-3.5-turbo")
            .with_api_key_env("PROMPT_PIPE_TEST_KEY_THAT_IS_NEVER_SET");
        let err = client.complete("X a").await.unwrap_err();
        assert_eq!(err.prompt, "X a");
        assert!(err.cause.is_configuration());
    }

    #[test]
    fn test_debug_hides_literal_key() {
        let client = OpenAiClient::new("m").with_api_key("sk-secret");
        let shown = format!("{:?}", client);
        assert!(!shown.contains("sk-secret"));
    }
}
