use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

const VERDICT_TOOL: &str = "submit_verdict";

/// Failures of one LLM request
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    /// The attempt did not finish within the per-call timeout
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    /// Rate limiting, overload or a dropped connection
    #[error("transient LLM error: {0}")]
    Transient(String),

    /// Backend cannot serve requests (bad credentials, unknown model, unreachable)
    #[error("LLM backend unavailable: {0}")]
    Unavailable(String),

    /// Response arrived but did not contain a usable verdict
    #[error("malformed LLM response: {0}")]
    Malformed(String),
}

/// Structured answer of the model for one detection point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the behavior occurred
    pub verdict: bool,
    /// Verbatim excerpt of the dialogue
    #[serde(default)]
    pub evidence: String,
    /// Self-reported confidence, 0-1 or a percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Verdict {
    pub fn yes(evidence: impl Into<String>, confidence: f64) -> Self {
        Self {
            verdict: true,
            evidence: evidence.into(),
            confidence: Some(confidence),
            reasoning: None,
        }
    }

    pub fn no() -> Self {
        Self {
            verdict: false,
            evidence: String::new(),
            confidence: None,
            reasoning: None,
        }
    }
}

/// A language model that can be asked for a verdict
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// One request; retries and rate limiting are the caller's concern
    async fn submit_verdict(&self, system: &str, user: &str) -> Result<Verdict, LlmError>;

    /// Name recorded in logs
    fn model_name(&self) -> &str;
}

/// Configuration for the Anthropic API client
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// API key (from ANTHROPIC_API_KEY env var)
    pub api_key: String,
    /// Model to use (ANTHROPIC_MODEL env var)
    pub model: String,
    /// Temperature (0-1, lower = more deterministic)
    pub temperature: f64,
    /// Maximum tokens in response
    pub max_tokens: u32,
}

impl AnthropicConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set")?;
        let model = std::env::var("ANTHROPIC_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

        Ok(Self::new(api_key, model))
    }

    /// Create with custom settings
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            temperature: 0.1,
            max_tokens: 1024,
        }
    }
}

/// Anthropic API client
pub struct AnthropicClient {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn verdict_tool() -> Tool {
        Tool {
            name: VERDICT_TOOL.to_string(),
            description: "Submit whether the behavior occurred, with a verbatim quote as evidence"
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "verdict": {
                        "type": "boolean",
                        "description": "true only if the dialogue clearly shows the behavior"
                    },
                    "evidence": {
                        "type": "string",
                        "description": "Exact excerpt copied from a single utterance; empty when verdict is false"
                    },
                    "confidence": {
                        "type": "number",
                        "minimum": 0,
                        "maximum": 1
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "One or two sentences"
                    }
                },
                "required": ["verdict", "evidence"]
            }),
        }
    }
}

fn classify_status(status: StatusCode, body: String) -> LlmError {
    let message = format!("Anthropic API error: {} - {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() || status.as_u16() == 529
    {
        LlmError::Transient(message)
    } else {
        LlmError::Unavailable(message)
    }
}

fn classify_send_error(error: reqwest::Error) -> LlmError {
    if error.is_timeout() {
        LlmError::Transient(format!("request timed out: {}", error))
    } else if error.is_connect() {
        LlmError::Unavailable(format!("failed to connect to Anthropic API: {}", error))
    } else {
        LlmError::Transient(format!("failed to send request to Anthropic API: {}", error))
    }
}

#[async_trait]
impl LlmBackend for AnthropicClient {
    /// Send a message with the verdict tool forced
    async fn submit_verdict(&self, system: &str, user: &str) -> Result<Verdict, LlmError> {
        let request = AnthropicToolRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: Some(self.config.temperature),
            system: Some(system.to_string()),
            messages: vec![Message {
                role: "user".to_string(),
                content: user.to_string(),
            }],
            tools: vec![Self::verdict_tool()],
            tool_choice: Some(ToolChoice {
                choice_type: "tool".to_string(),
                name: VERDICT_TOOL.to_string(),
            }),
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(classify_send_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(format!("unparseable response body: {}", e)))?;

        parse_tool_response(response)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Find the verdict tool call in a response
fn parse_tool_response(response: AnthropicResponse) -> Result<Verdict, LlmError> {
    for content in response.content {
        if content.content_type == "tool_use" && content.name.as_deref() == Some(VERDICT_TOOL) {
            if let Some(input) = content.input {
                return serde_json::from_value(input).map_err(|e| {
                    LlmError::Malformed(format!("tool input is not a verdict: {}", e))
                });
            }
        }
    }

    Err(LlmError::Malformed("no tool_use response found".to_string()))
}

/// Scripted backend for tests and dry runs
///
/// Replies are consumed in order; the last one repeats once the script is
/// exhausted.
pub struct MockBackend {
    script: Mutex<VecDeque<Result<Verdict, LlmError>>>,
    last: Mutex<Option<Result<Verdict, LlmError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockBackend {
    /// Always answer with the same verdict
    pub fn replying(verdict: Verdict) -> Self {
        Self::scripted(vec![Ok(verdict)])
    }

    /// Always fail with the same error
    pub fn failing(error: LlmError) -> Self {
        Self::scripted(vec![Err(error)])
    }

    pub fn scripted(replies: Vec<Result<Verdict, LlmError>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            last: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of requests seen at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// User prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn next_reply(&self) -> Result<Verdict, LlmError> {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reply) = script.pop_front() {
            *last = Some(reply.clone());
            return reply;
        }
        last.clone()
            .unwrap_or_else(|| Err(LlmError::Unavailable("mock has no replies".to_string())))
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn submit_verdict(&self, _system: &str, user: &str) -> Result<Verdict, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(user.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.next_reply();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[derive(Debug, Serialize)]
struct AnthropicToolRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct Tool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ToolChoice {
    #[serde(rename = "type")]
    choice_type: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}
