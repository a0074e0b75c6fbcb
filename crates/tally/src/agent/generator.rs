//! Code generation: the [`CodeGenerator`] trait and its OpenRouter
//! implementation.
//!
//! Three paths produce code:
//!
//! | Path | Method | Model call |
//! |------|--------|------------|
//! | Primary | [`CodeGenerator::generate`] | `generate_python_code` tool |
//! | Fix | [`CodeGenerator::generate_fix`] | `analyze_and_fix_code_error` tool |
//! | Deep analysis | [`CodeGenerator::deep_analysis`] | no tools, reasoning on, one fenced block |
//!
//! Every path returns `Err` rather than an empty string, so the orchestrator
//! can tell "the service failed" apart from "the code failed".

use crate::agent::config::AnalystConfig;
use crate::agent::prompts;
use crate::agent::session::ConversationTurn;
use crate::api::retry::{RetryConfig, retry_api_call};
use crate::error::GenerationError;
use crate::sandbox::{ErrorKind, ExecutionOutcome};
use crate::{
    ChatCompletion, ChatRequest, Message, OpenRouterClient, ReasoningConfig, ReasoningEffort,
    ToolDef, json_schema_for,
};
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const GENERATE_TOOL: &str = "generate_python_code";
pub const FIX_TOOL: &str = "analyze_and_fix_code_error";

// ── Submissions ────────────────────────────────────────────────────

/// Which generation path produced a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Primary,
    FixRetry,
    DeepAnalysis,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::FixRetry => write!(f, "fix"),
            Self::DeepAnalysis => write!(f, "deep analysis"),
        }
    }
}

/// A piece of generated code and where it came from. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSubmission {
    text: String,
    origin: Origin,
}

impl CodeSubmission {
    pub fn new(text: impl Into<String>, origin: Origin) -> Self {
        Self {
            text: text.into(),
            origin,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }
}

/// What the fix and deep-analysis paths learn about the failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFeedback {
    pub code: String,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub traceback: Option<String>,
}

impl ErrorFeedback {
    /// Feedback for a failed outcome, or `None` if it succeeded.
    pub fn from_outcome(code: &str, outcome: &ExecutionOutcome) -> Option<Self> {
        let kind = outcome.error_kind()?;
        Some(Self {
            code: code.to_string(),
            error_kind: kind.clone(),
            error_message: outcome.error_message().unwrap_or_default().to_string(),
            traceback: outcome.traceback().map(str::to_string),
        })
    }
}

/// Everything a generation path needs for one call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub question: String,
    /// Rendered [`GlobalContext`](crate::context::GlobalContext).
    pub context_prompt: String,
    /// History as it should appear in the prompt (possibly compacted).
    pub history: Vec<ConversationTurn>,
    pub feedback: Option<ErrorFeedback>,
    /// Where a chart should be saved, if the code draws one.
    pub artifact_path: Option<String>,
}

// ── Trait ──────────────────────────────────────────────────────────

/// Future returned by [`CodeGenerator`] methods.
pub type GenerationFuture<'a> = BoxFuture<'a, Result<String, GenerationError>>;

pub trait CodeGenerator: Send + Sync {
    /// First attempt for a question.
    fn generate<'a>(&'a self, request: &'a GenerationRequest) -> GenerationFuture<'a>;

    /// A later attempt, seeded with `request.feedback`.
    fn generate_fix<'a>(&'a self, request: &'a GenerationRequest) -> GenerationFuture<'a>;

    /// One alternative candidate after the first attempt failed.
    fn deep_analysis<'a>(&'a self, request: &'a GenerationRequest) -> GenerationFuture<'a>;
}

/// Run the deep-analysis path as its own task.
///
/// The orchestrator awaits deep analysis inline; this is for callers that
/// want to start it and collect the candidate later.
pub fn spawn_deep_analysis(
    generator: Arc<dyn CodeGenerator>,
    request: GenerationRequest,
) -> JoinHandle<Result<String, GenerationError>> {
    tokio::spawn(async move { generator.deep_analysis(&request).await })
}

/// Await a handle from [`spawn_deep_analysis`], folding a panicked or
/// cancelled task into [`GenerationError::Join`].
pub async fn join_deep_analysis(
    handle: JoinHandle<Result<String, GenerationError>>,
) -> Result<String, GenerationError> {
    handle
        .await
        .map_err(|e| GenerationError::Join(e.to_string()))?
}

// ── Tool schemas ───────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema, Debug)]
struct GenerateCodeArgs {
    /// One or two sentences on how the question will be answered.
    #[serde(default)]
    analysis_approach: Option<String>,
    /// Complete Python program. No imports, no markdown fences.
    code: String,
    /// What the printed output will show.
    #[serde(default)]
    expected_output: Option<String>,
}

#[derive(Deserialize, JsonSchema, Debug)]
struct ErrorAnalysis {
    /// The underlying cause of the error.
    root_cause: String,
    /// Why the previous code triggered it.
    why_it_failed: String,
    /// How the fixed code avoids it.
    solution_approach: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
struct FixCodeArgs {
    error_analysis: ErrorAnalysis,
    /// Complete corrected Python program. No imports, no markdown fences.
    fixed_code: String,
    /// Short list of what changed.
    #[serde(default)]
    changes_made: Vec<String>,
}

fn generate_tool() -> ToolDef {
    ToolDef::new(
        GENERATE_TOOL,
        "Submit Python code that answers the question using the preloaded DataFrame `df`.",
        json_schema_for::<GenerateCodeArgs>(),
    )
}

fn fix_tool() -> ToolDef {
    ToolDef::new(
        FIX_TOOL,
        "Analyse why the previous code failed and submit a corrected program.",
        json_schema_for::<FixCodeArgs>(),
    )
}

/// Validate tool-call arguments against the tool's schema.
fn validate_arguments(tool: &ToolDef, args: &serde_json::Value) -> Result<(), GenerationError> {
    let validator = match jsonschema::validator_for(&tool.function.parameters) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(GenerationError::InvalidArguments(format!(
            "{}: {}",
            tool.function.name,
            errors.join("; ")
        )))
    }
}

fn parse_tool_args<T: for<'de> Deserialize<'de>>(
    completion: &ChatCompletion,
    tool: &ToolDef,
) -> Option<Result<T, GenerationError>> {
    let call = completion
        .tool_calls
        .iter()
        .find(|c| c.function.name == tool.function.name)?;
    let parsed = serde_json::from_str::<serde_json::Value>(&call.function.arguments)
        .map_err(|e| GenerationError::InvalidArguments(format!("{}: {e}", tool.function.name)))
        .and_then(|value| {
            validate_arguments(tool, &value)?;
            serde_json::from_value::<T>(value).map_err(|e| {
                GenerationError::InvalidArguments(format!("{}: {e}", tool.function.name))
            })
        });
    Some(parsed)
}

// ── Code extraction ────────────────────────────────────────────────

/// The body of the first fenced code block in `text`, if any.
pub fn extract_code_block(text: &str) -> Option<String> {
    let mut lines = text.lines();
    lines.by_ref().find(|l| l.trim_start().starts_with("```"))?;
    let body: Vec<&str> = lines.take_while(|l| l.trim() != "```").collect();
    let code = body.join("\n").trim().to_string();
    if code.is_empty() { None } else { Some(code) }
}

/// Substrings that mark a line as Python rather than prose.
const CODE_LINE_MARKERS: &[&str] = &[
    "df[", "df.", "print(", "plt.", "pd.", "np.", " = ", " += ", ".groupby(", ".sum(",
    ".mean(", ".apply(",
];

/// Statement keywords that open an indented block.
const BLOCK_KEYWORDS: &[&str] = &[
    "if ", "elif ", "else:", "for ", "while ", "def ", "try:", "except", "finally:", "with ",
];

fn looks_like_code(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('#')
        || CODE_LINE_MARKERS.iter().any(|m| t.contains(m))
        || (BLOCK_KEYWORDS.iter().any(|k| t.starts_with(k)) && t.ends_with(':'))
}

/// Pull code-like lines out of an answer that has no fenced block.
///
/// Indented lines under a kept `...:` line are kept with it. Returns `None`
/// unless at least one kept line is more than a comment.
pub fn extract_code_lines(text: &str) -> Option<String> {
    let mut kept = Vec::new();
    let mut in_block = false;
    for line in text.lines() {
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        let indented = line.starts_with([' ', '\t']);
        if looks_like_code(line) || (in_block && indented) {
            kept.push(line.trim_end());
            if t.ends_with(':') {
                in_block = true;
            } else if !indented {
                in_block = false;
            }
        } else {
            in_block = false;
        }
    }
    if kept.iter().all(|l| l.trim_start().starts_with('#')) {
        return None;
    }
    Some(kept.join("\n"))
}

/// Strip a leading ```` ```python ```` line and a trailing ```` ``` ```` line.
pub fn strip_code_fences(text: &str) -> String {
    let mut lines: Vec<&str> = text.trim().lines().collect();
    if lines.first().is_some_and(|l| l.trim().starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

fn non_empty(code: String) -> Result<String, GenerationError> {
    if code.trim().is_empty() {
        Err(GenerationError::EmptyResponse)
    } else {
        Ok(code)
    }
}

/// Code from a primary-path completion: the tool call if present, else
/// the text content with fences stripped.
pub fn code_from_generate(completion: &ChatCompletion) -> Result<String, GenerationError> {
    if let Some(args) = parse_tool_args::<GenerateCodeArgs>(completion, &generate_tool()) {
        let args = args?;
        debug!(
            "Approach: {:?}; expected output: {:?}",
            args.analysis_approach, args.expected_output
        );
        return non_empty(strip_code_fences(&args.code));
    }
    let content = completion.content.as_deref().unwrap_or_default();
    non_empty(strip_code_fences(content))
}

/// Code from a fix-path completion.
pub fn code_from_fix(completion: &ChatCompletion) -> Result<String, GenerationError> {
    if let Some(args) = parse_tool_args::<FixCodeArgs>(completion, &fix_tool()) {
        let args = args?;
        debug!(
            "Fix analysis: root cause={:?}, why={:?}, approach={:?}, {} change(s)",
            args.error_analysis.root_cause,
            args.error_analysis.why_it_failed,
            args.error_analysis.solution_approach,
            args.changes_made.len()
        );
        return non_empty(strip_code_fences(&args.fixed_code));
    }
    let content = completion.content.as_deref().unwrap_or_default();
    non_empty(strip_code_fences(content))
}

/// Code from a deep-analysis completion: the first fenced block of the
/// answer, then of the reasoning text, then the code-like lines of an
/// unfenced answer.
pub fn code_from_deep_analysis(completion: &ChatCompletion) -> Result<String, GenerationError> {
    let content = completion.content.as_deref();
    content
        .and_then(extract_code_block)
        .or_else(|| completion.reasoning.as_deref().and_then(extract_code_block))
        .or_else(|| content.and_then(extract_code_lines))
        .ok_or(GenerationError::EmptyResponse)
}

// ── LlmGenerator ───────────────────────────────────────────────────

/// [`CodeGenerator`] over the OpenRouter chat completions API.
pub struct LlmGenerator {
    client: Arc<OpenRouterClient>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    deep_temperature: f32,
    deep_max_tokens: u32,
    retry: RetryConfig,
}

impl LlmGenerator {
    pub fn new(client: Arc<OpenRouterClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: 0.1,
            max_tokens: 2000,
            deep_temperature: 0.3,
            deep_max_tokens: 6000,
            retry: RetryConfig::default(),
        }
    }

    pub fn from_config(client: Arc<OpenRouterClient>, config: &AnalystConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            deep_temperature: config.deep_analysis_temperature,
            deep_max_tokens: config.deep_analysis_max_tokens,
            retry: config.api_retry.clone(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn complete(&self, body: ChatRequest) -> Result<ChatCompletion, GenerationError> {
        retry_api_call(&self.retry, || self.client.chat(&body))
            .await
            .map_err(GenerationError::Api)
    }

    fn tool_request(&self, system: String, user: String, tool: ToolDef) -> ChatRequest {
        ChatRequest {
            model: Some(self.model.clone()),
            messages: vec![Message::system(system), Message::user(user)],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: Some(vec![tool]),
            ..Default::default()
        }
    }
}

impl CodeGenerator for LlmGenerator {
    fn generate<'a>(&'a self, request: &'a GenerationRequest) -> GenerationFuture<'a> {
        Box::pin(async move {
            let body = self.tool_request(
                prompts::system_prompt(&request.context_prompt),
                prompts::generation_prompt(request),
                generate_tool(),
            );
            let completion = self.complete(body).await?;
            code_from_generate(&completion)
        })
    }

    fn generate_fix<'a>(&'a self, request: &'a GenerationRequest) -> GenerationFuture<'a> {
        Box::pin(async move {
            if request.feedback.is_none() {
                warn!("Fix requested without error feedback; using the primary prompt");
            }
            let body = self.tool_request(
                prompts::system_prompt(&request.context_prompt),
                prompts::generation_prompt(request),
                fix_tool(),
            );
            let completion = self.complete(body).await?;
            code_from_fix(&completion)
        })
    }

    fn deep_analysis<'a>(&'a self, request: &'a GenerationRequest) -> GenerationFuture<'a> {
        Box::pin(async move {
            let body = ChatRequest {
                model: Some(self.model.clone()),
                messages: vec![
                    Message::system(prompts::deep_analysis_system_prompt(&request.context_prompt)),
                    Message::user(prompts::deep_analysis_prompt(request)),
                ],
                max_tokens: self.deep_max_tokens,
                temperature: self.deep_temperature,
                reasoning: Some(ReasoningConfig {
                    effort: Some(ReasoningEffort::High),
                    max_tokens: None,
                    exclude: Some(false),
                }),
                ..Default::default()
            };
            let completion = self.complete(body).await?;
            let code = code_from_deep_analysis(&completion)?;
            debug!("Deep analysis produced {} chars of code", code.chars().count());
            Ok(code)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExceptionClass;
    use crate::{CallType, FunctionCallData, ToolCall};

    fn completion(content: Option<&str>, calls: Vec<(&str, &str)>) -> ChatCompletion {
        ChatCompletion {
            content: content.map(str::to_string),
            tool_calls: calls
                .into_iter()
                .enumerate()
                .map(|(i, (name, args))| ToolCall {
                    id: format!("call_{i}"),
                    call_type: CallType::Function,
                    function: FunctionCallData {
                        name: name.to_string(),
                        arguments: args.to_string(),
                    },
                })
                .collect(),
            usage: None,
            finish_reason: None,
            reasoning: None,
        }
    }

    #[test]
    fn tool_schemas_require_code() {
        let schema = generate_tool().function.parameters;
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&"code".into()));

        let fix = fix_tool().function.parameters;
        let required = fix["required"].as_array().unwrap();
        assert!(required.contains(&"fixed_code".into()));
        assert!(required.contains(&"error_analysis".into()));
    }

    #[test]
    fn primary_code_from_tool_call() {
        let c = completion(
            None,
            vec![(GENERATE_TOOL, r#"{"analysis_approach": "sum", "code": "print(df['a'].sum())"}"#)],
        );
        assert_eq!(code_from_generate(&c).unwrap(), "print(df['a'].sum())");
    }

    #[test]
    fn primary_falls_back_to_fenced_content() {
        let c = completion(Some("```python\nprint(len(df))\n```"), vec![]);
        assert_eq!(code_from_generate(&c).unwrap(), "print(len(df))");
    }

    #[test]
    fn empty_output_is_an_error() {
        let c = completion(Some("   "), vec![]);
        assert!(matches!(code_from_generate(&c), Err(GenerationError::EmptyResponse)));
        let c = completion(None, vec![(GENERATE_TOOL, r#"{"code": ""}"#)]);
        assert!(matches!(code_from_generate(&c), Err(GenerationError::EmptyResponse)));
    }

    #[test]
    fn schema_violations_are_rejected() {
        let c = completion(None, vec![(GENERATE_TOOL, r#"{"analysis_approach": "x"}"#)]);
        assert!(matches!(
            code_from_generate(&c),
            Err(GenerationError::InvalidArguments(_))
        ));
        let c = completion(None, vec![(GENERATE_TOOL, "not json")]);
        assert!(matches!(
            code_from_generate(&c),
            Err(GenerationError::InvalidArguments(_))
        ));
    }

    #[test]
    fn fix_code_from_tool_call() {
        let args = r#"{
            "error_analysis": {
                "root_cause": "Sales is text",
                "why_it_failed": "sum of strings",
                "solution_approach": "strip $ and convert"
            },
            "fixed_code": "df['Sales'] = pd.to_numeric(df['Sales'])\nprint(df['Sales'].sum())",
            "changes_made": ["convert Sales"]
        }"#;
        let c = completion(None, vec![(FIX_TOOL, args)]);
        assert!(code_from_fix(&c).unwrap().starts_with("df['Sales'] = pd.to_numeric"));
    }

    #[test]
    fn deep_analysis_takes_first_block() {
        let text = "The column is text.\n```python\nprint(1)\n```\nAlso:\n```python\nprint(2)\n```";
        let c = completion(Some(text), vec![]);
        assert_eq!(code_from_deep_analysis(&c).unwrap(), "print(1)");

        let mut c = completion(Some("no code here"), vec![]);
        assert!(code_from_deep_analysis(&c).is_err());
        c.reasoning = Some("thinking...\n```\nprint(3)\n```".into());
        assert_eq!(code_from_deep_analysis(&c).unwrap(), "print(3)");
    }

    #[test]
    fn deep_analysis_without_fences_keeps_code_lines() {
        let text = "The Sales column holds strings like '$1,200'.\n\n\
# clean the column first\n\
df['Sales'] = pd.to_numeric(df['Sales'].str.replace('$', '').str.replace(',', ''))\n\
for region, total in df.groupby('Region')['Sales'].sum().items():\n    print(region, total)\n\n\
This converts the column before summing.";
        let c = completion(Some(text), vec![]);
        assert_eq!(
            code_from_deep_analysis(&c).unwrap(),
            "# clean the column first\n\
df['Sales'] = pd.to_numeric(df['Sales'].str.replace('$', '').str.replace(',', ''))\n\
for region, total in df.groupby('Region')['Sales'].sum().items():\n    print(region, total)"
        );
    }

    #[test]
    fn prose_or_comments_alone_are_not_code() {
        assert!(extract_code_lines("I could not find the cause of the failure.").is_none());
        assert!(extract_code_lines("# Root cause\nThe column is text.").is_none());
    }

    #[test]
    fn feedback_only_for_failures() {
        let ok = ExecutionOutcome::success("1", "");
        assert!(ErrorFeedback::from_outcome("print(1)", &ok).is_none());

        let failed = ExecutionOutcome::failure(
            ErrorKind::RuntimeFault(ExceptionClass::KeyError),
            "'amount'",
        )
        .with_traceback("Traceback\n  line 1\nKeyError: 'amount'", 5);
        let fb = ErrorFeedback::from_outcome("df['amount']", &failed).unwrap();
        assert_eq!(fb.error_message, "'amount'");
        assert!(fb.traceback.unwrap().ends_with("KeyError: 'amount'"));
    }

    struct Fixed;

    impl CodeGenerator for Fixed {
        fn generate<'a>(&'a self, _: &'a GenerationRequest) -> GenerationFuture<'a> {
            Box::pin(async { Ok("a".to_string()) })
        }
        fn generate_fix<'a>(&'a self, _: &'a GenerationRequest) -> GenerationFuture<'a> {
            Box::pin(async { Ok("b".to_string()) })
        }
        fn deep_analysis<'a>(&'a self, _: &'a GenerationRequest) -> GenerationFuture<'a> {
            Box::pin(async { Ok("print('deep')".to_string()) })
        }
    }

    #[tokio::test]
    async fn spawned_deep_analysis_is_awaitable() {
        let request = GenerationRequest {
            question: "q".into(),
            context_prompt: String::new(),
            history: vec![],
            feedback: None,
            artifact_path: None,
        };
        let handle = spawn_deep_analysis(Arc::new(Fixed), request);
        assert_eq!(join_deep_analysis(handle).await.unwrap(), "print('deep')");
    }
}
