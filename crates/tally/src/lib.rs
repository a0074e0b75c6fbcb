//! Conversational CSV analysis with a policy-checked Python sandbox.
//!
//! `tally` answers questions about a tabular dataset by asking an LLM (via
//! [OpenRouter](https://openrouter.ai/)) for pandas code, checking that code
//! statically, running it in a restricted Python namespace, and repairing it
//! automatically when it fails. The conversation is kept inside the model's
//! context window by compacting old turns.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use tally::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AnalystConfig::default();
//!     let client = Arc::new(OpenRouterClient::new(AnalystConfig::api_key()?)?);
//!
//!     let mut sandbox = PythonSandbox::start(config.sandbox_config()).await?;
//!     let dataset = sandbox.bind_dataset("sales.csv".as_ref()).await?;
//!     let global = GlobalContext::new(dataset, describe_capabilities(&sandbox.capabilities()));
//!
//!     let generator = Arc::new(LlmGenerator::from_config(client.clone(), &config));
//!     let mut orchestrator =
//!         Orchestrator::new(generator, &mut sandbox, &global, config.orchestrator_config())
//!             .with_explainer(Arc::new(LlmExplainer::from_config(client, &config)))
//!             .with_event_handler(&LoggingHandler);
//!
//!     let report = orchestrator.analyze_question("Which region sells most?").await?;
//!     println!("{}", report.turn.explanation);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`sandbox`] | [`PolicyEnforcer`](sandbox::PolicyEnforcer), [`PythonSandbox`](sandbox::PythonSandbox), [`ExecutionOutcome`](sandbox::ExecutionOutcome) |
//! | [`context`] | [`ContextBudget`](context::ContextBudget), [`GlobalContext`](context::GlobalContext), history compaction |
//! | [`agent`] | [`Orchestrator`](agent::Orchestrator), generation and explanation services, events, sessions, config |
//! | [`api`] | Retry with backoff for API calls |
//! | [`error`] | Error types for every fallible edge |
//!
//! The crate root holds the OpenRouter wire types and [`OpenRouterClient`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub mod agent;
pub mod api;
pub mod context;
pub mod error;
pub mod prelude;
pub mod sandbox;

// ── Constants ──────────────────────────────────────────────────────

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// ── Schema generation ──────────────────────────────────────────────

/// JSON Schema for a `schemars::JsonSchema` type, as the function-calling
/// API expects it in a tool's `parameters`.
///
/// ```
/// use tally::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct SubmitArgs {
///     code: String,
///     #[serde(default)]
///     note: Option<String>,
/// }
///
/// let schema = json_schema_for::<SubmitArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"code".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body. Unset optional fields are omitted.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub messages: Vec<Message>,

    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,

    // Reasoning / extended thinking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
}

/// Reasoning effort level for extended thinking models.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    High,
    Medium,
    Low,
}

/// Configuration for reasoning tokens.
///
/// Use `effort` for OpenAI-style models or `max_tokens` for Anthropic/Gemini.
/// Do not set both.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReasoningConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Reason internally but omit the reasoning from the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<bool>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

// ── Message types ──────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
        }
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the API (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call returned by the model.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionCallData {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    pub arguments: String,
}

// ── Response types ─────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
    reasoning: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Clean return type from [`OpenRouterClient::chat`].
#[derive(Debug)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
    /// Reasoning content, when the model returns it.
    pub reasoning: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
///
/// Errors are plain strings so [`api::retry`] can classify them as
/// transient (`HTTP 429`, `HTTP 5xx`, network) or permanent.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, String> {
        Self::with_headers(api_key, "https://github.com/tally-rs/tally", "tally")
    }

    /// Create a client with custom `HTTP-Referer` and `X-Title` headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    /// Send a chat completion request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, String> {
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}, temp={}, reasoning={}",
            body.model.as_deref().unwrap_or("(none)"),
            body.messages.len(),
            body.tools.as_ref().map_or(0, |t| t.len()),
            body.max_tokens,
            body.temperature,
            body.reasoning.is_some(),
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }
        parse_chat_response(&text)
    }
}

/// Decode a response body into a [`ChatCompletion`]. A response with no
/// choices decodes to an empty completion rather than an error.
fn parse_chat_response(text: &str) -> Result<ChatCompletion, String> {
    let parsed: RawChatResponse =
        serde_json::from_str(text).map_err(|e| format!("failed to parse response: {e}"))?;

    if let Some(err) = parsed.error {
        return Err(format!("OpenRouter API error: {}", err.message));
    }
    if let Some(ref usage) = parsed.usage {
        debug!(
            "Token usage: prompt={}, completion={}, total={}",
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
            usage.total_tokens.unwrap_or(0),
        );
    }

    match parsed.choices.and_then(|c| c.into_iter().next()) {
        Some(c) => Ok(ChatCompletion {
            content: c.message.content,
            tool_calls: c.message.tool_calls.unwrap_or_default(),
            usage: parsed.usage,
            finish_reason: c.finish_reason,
            reasoning: c.message.reasoning,
        }),
        None => {
            debug!("LLM output: empty (no choices)");
            Ok(ChatCompletion {
                content: None,
                tool_calls: vec![],
                usage: parsed.usage,
                finish_reason: None,
                reasoning: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.content.as_deref(), Some("hello"));
        assert_eq!(Message::user("q").role, MessageRole::User);
        let echoed: Message =
            serde_json::from_str(r#"{"role":"assistant","content":"a"}"#).unwrap();
        assert_eq!(echoed.role, MessageRole::Assistant);
    }

    #[test]
    fn chat_request_default_skips_unset_fields() {
        let req = ChatRequest {
            model: Some("test-model".into()),
            messages: vec![Message::user("hi")],
            max_tokens: 100,
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("top_p").is_none());
        assert!(json.get("tools").is_none());
        assert!(json.get("reasoning").is_none());
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn parses_tool_call_response() {
        let body = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "generate_python_code", "arguments": "{\"code\": \"print(1)\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let completion = parse_chat_response(body).unwrap();
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].function.name, "generate_python_code");
        assert_eq!(completion.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn api_error_body_is_an_error() {
        let err = parse_chat_response(r#"{"error": {"message": "quota"}}"#).unwrap_err();
        assert!(err.contains("quota"));
        let empty = parse_chat_response(r#"{"choices": []}"#).unwrap();
        assert!(empty.content.is_none());
    }
}
