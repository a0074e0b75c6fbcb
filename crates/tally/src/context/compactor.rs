//! History compaction: replaces an old prefix of the turn history with a
//! single structured summary turn, keeping the most recent turns verbatim.
//!
//! Two strategies sit behind the [`Compactor`] trait:
//!
//! - [`RuleCompactor`] (default): keyword and pattern extraction. Pure and
//!   deterministic; identical input gives identical output.
//! - [`ModelCompactor`]: asks the LLM to write the summary, and falls back
//!   to the rule-based summary when the call fails or returns nothing.
//!
//! Both return `history` unchanged when `history.len() <= keep_recent`, and
//! otherwise exactly `keep_recent + 1` turns: the summary followed by the
//! untouched tail.

use crate::agent::session::ConversationTurn;
use crate::api::retry::{RetryConfig, retry_api_call};
use crate::sandbox::ExecutionOutcome;
use crate::{ChatRequest, Message, OpenRouterClient};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Question text of a synthetic summary turn.
pub const SUMMARY_MARKER: &str = "[Conversation summary]";

const MAX_DECISIONS: usize = 5;
const MAX_CODE_OPS: usize = 5;
const MAX_ERRORS: usize = 3;
const MAX_FINDINGS: usize = 5;

const DECISION_KEYWORDS: &[&str] = &[
    "decided", "decide", "chose", "choose", "instead", "决定", "选择", "采用",
];
const FINDING_KEYWORDS: &[&str] = &[
    "found", "shows", "indicates", "reveals", "发现", "结果显示", "数据表明",
];

/// Code shorter than this is not worth summarising.
const MIN_CODE_CHARS: usize = 50;
const MAX_CODE_LINES: usize = 3;
const CODE_LINE_CHARS: usize = 60;
const ASSIGNMENT_WINDOW: usize = 30;
const DECISION_CHARS: usize = 100;
const ERROR_CHARS: usize = 100;
const FINDING_CHARS: usize = 150;

/// Which compaction strategy to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Rules,
    Model,
}

impl std::str::FromStr for CompactionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rules" | "rule" => Ok(Self::Rules),
            "model" | "llm" => Ok(Self::Model),
            other => Err(format!("unknown compaction strategy: {other}")),
        }
    }
}

/// Future returned by [`Compactor::compact`].
pub type CompactFuture<'a> = BoxFuture<'a, Vec<ConversationTurn>>;

/// Shrinks a turn history into `summary + tail`.
pub trait Compactor: Send + Sync {
    fn compact<'a>(
        &'a self,
        history: &'a [ConversationTurn],
        keep_recent: usize,
        instruction: Option<&'a str>,
    ) -> CompactFuture<'a>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Pick the compactor for a strategy. The model strategy needs a client;
/// without one it degrades to rules.
pub fn build_compactor(
    strategy: CompactionStrategy,
    client: Option<Arc<OpenRouterClient>>,
    model: &str,
) -> Box<dyn Compactor> {
    match (strategy, client) {
        (CompactionStrategy::Model, Some(client)) => Box::new(ModelCompactor::new(client, model)),
        (CompactionStrategy::Model, None) => {
            warn!("Model compaction requested without a client; using rules");
            Box::new(RuleCompactor)
        }
        (CompactionStrategy::Rules, _) => Box::new(RuleCompactor),
    }
}

// ── Rule-based ─────────────────────────────────────────────────────

/// Deterministic keyword/pattern summariser.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleCompactor;

impl RuleCompactor {
    /// Synchronous form of [`Compactor::compact`].
    pub fn compact_turns(
        &self,
        history: &[ConversationTurn],
        keep_recent: usize,
        instruction: Option<&str>,
    ) -> Vec<ConversationTurn> {
        let Some((to_compress, to_keep)) = split_history(history, keep_recent) else {
            return history.to_vec();
        };
        let summary = render_summary(&extract(to_compress), instruction);
        info!(
            "Compacted history: {} turns -> {} (summarised {}, kept {})",
            history.len(),
            to_keep.len() + 1,
            to_compress.len(),
            to_keep.len()
        );
        assemble(to_compress, to_keep, summary)
    }
}

impl Compactor for RuleCompactor {
    fn compact<'a>(
        &'a self,
        history: &'a [ConversationTurn],
        keep_recent: usize,
        instruction: Option<&'a str>,
    ) -> CompactFuture<'a> {
        Box::pin(async move { self.compact_turns(history, keep_recent, instruction) })
    }

    fn name(&self) -> &str {
        "rules"
    }
}

/// Signals pulled out of the compressed prefix. Each item carries the
/// 1-based position of the turn it came from.
#[derive(Debug, Default, PartialEq, Eq)]
struct KeyInformation {
    decisions: Vec<(usize, String)>,
    code_ops: Vec<(usize, String)>,
    errors: Vec<(usize, String)>,
    findings: Vec<(usize, String)>,
}

fn extract(turns: &[ConversationTurn]) -> KeyInformation {
    let mut info = KeyInformation::default();
    for (i, turn) in turns.iter().enumerate() {
        // Earlier summaries are already condensed; don't mine them again.
        if turn.is_summary() {
            continue;
        }
        let position = i + 1;
        let question = turn.question.to_lowercase();
        let explanation = turn.explanation.to_lowercase();

        if contains_any(&question, DECISION_KEYWORDS) || contains_any(&explanation, DECISION_KEYWORDS)
        {
            info.decisions
                .push((position, truncate_chars(&turn.question, DECISION_CHARS)));
        }

        if turn.code.chars().count() > MIN_CODE_CHARS {
            let key_lines: Vec<String> = turn
                .code
                .lines()
                .map(str::trim)
                .filter(|line| {
                    line.starts_with("def ")
                        || line.chars().take(ASSIGNMENT_WINDOW).any(|c| c == '=')
                })
                .take(MAX_CODE_LINES)
                .map(|line| truncate_chars(line, CODE_LINE_CHARS))
                .collect();
            if !key_lines.is_empty() {
                info.code_ops.push((position, key_lines.join("; ")));
            }
        }

        if !turn.outcome.is_success() {
            let kind = turn
                .outcome
                .error_kind()
                .map_or_else(|| "Unknown".to_string(), ToString::to_string);
            let message = truncate_chars(turn.outcome.error_message().unwrap_or_default(), ERROR_CHARS);
            info.errors.push((position, format!("{kind}: {message}")));
        }

        if contains_any(&explanation, FINDING_KEYWORDS) {
            info.findings
                .push((position, truncate_chars(&turn.explanation, FINDING_CHARS)));
        }
    }
    info
}

fn render_summary(info: &KeyInformation, instruction: Option<&str>) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(instruction) = instruction.filter(|s| !s.trim().is_empty()) {
        parts.push(format!("**Compaction note**: {instruction}\n"));
    }
    parts.push("## Earlier conversation\n".to_string());
    let header_len = parts.len();

    let sections: [(&str, &[(usize, String)], usize); 4] = [
        ("### Decisions", &info.decisions, MAX_DECISIONS),
        ("### Code operations", &info.code_ops, MAX_CODE_OPS),
        ("### Errors encountered", &info.errors, MAX_ERRORS),
        ("### Findings", &info.findings, MAX_FINDINGS),
    ];
    for (title, items, cap) in sections {
        if items.is_empty() {
            continue;
        }
        parts.push(title.to_string());
        for (turn, text) in items.iter().take(cap) {
            parts.push(format!("- Turn {turn}: {text}"));
        }
        parts.push(String::new());
    }

    if parts.len() == header_len {
        parts.push("*(nothing notable in the earlier turns)*".to_string());
    }
    parts.join("\n")
}

// ── Model-assisted ─────────────────────────────────────────────────

const SUMMARIZATION_PROMPT: &str = "\
Summarize the following data-analysis conversation turns concisely. Focus on:
- Questions asked and what the user decided along the way
- Code operations that changed the DataFrame or defined helpers (keep variable and column names)
- Errors encountered and how they were resolved
- Numerical findings, verbatim

Rules:
- Only include facts explicitly stated in the turns. Do not infer or extrapolate.
- Preserve column names, variable names, and error messages verbatim.
- Use Markdown bullet lists under short headings.
- Be concise. Every token must earn its place.";

/// LLM-written summary with a rule-based fallback.
pub struct ModelCompactor {
    client: Arc<OpenRouterClient>,
    model: String,
    max_summary_tokens: u32,
    retry: RetryConfig,
}

impl ModelCompactor {
    pub fn new(client: Arc<OpenRouterClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            max_summary_tokens: 1024,
            retry: RetryConfig::with_retries(2),
        }
    }

    pub fn with_max_summary_tokens(mut self, tokens: u32) -> Self {
        self.max_summary_tokens = tokens;
        self
    }

    async fn summarize(&self, span: &[ConversationTurn], instruction: Option<&str>) -> Option<String> {
        let (system, user) = build_summarization_request(span, instruction);
        let body = ChatRequest {
            model: Some(self.model.clone()),
            messages: vec![Message::system(system), Message::user(user)],
            max_tokens: self.max_summary_tokens,
            temperature: 0.2,
            ..Default::default()
        };
        match retry_api_call(&self.retry, || self.client.chat(&body)).await {
            Ok(completion) => completion.content.filter(|c| !c.trim().is_empty()),
            Err(e) => {
                warn!("Model compaction failed, falling back to rules: {e}");
                None
            }
        }
    }
}

impl Compactor for ModelCompactor {
    fn compact<'a>(
        &'a self,
        history: &'a [ConversationTurn],
        keep_recent: usize,
        instruction: Option<&'a str>,
    ) -> CompactFuture<'a> {
        Box::pin(async move {
            let Some((to_compress, to_keep)) = split_history(history, keep_recent) else {
                return history.to_vec();
            };
            let summary = match self.summarize(to_compress, instruction).await {
                Some(text) => {
                    debug!("Model summary: {} chars", text.len());
                    text
                }
                None => render_summary(&extract(to_compress), instruction),
            };
            info!(
                "Compacted history with model: {} turns -> {}",
                history.len(),
                to_keep.len() + 1
            );
            assemble(to_compress, to_keep, summary)
        })
    }

    fn name(&self) -> &str {
        "model"
    }
}

/// Build the `(system, user)` pair for a summarization call.
pub fn build_summarization_request(
    span: &[ConversationTurn],
    instruction: Option<&str>,
) -> (String, String) {
    let mut content = String::new();
    if let Some(instruction) = instruction {
        content.push_str(&format!("Additional instruction: {instruction}\n\n"));
    }
    for (i, turn) in span.iter().enumerate() {
        content.push_str(&format!("=== Turn {} ===\nQuestion: {}\n", i + 1, turn.question));
        if !turn.code.is_empty() {
            content.push_str(&format!("Code:\n{}\n", turn.code));
        }
        match turn.outcome.error_summary() {
            Some(err) => content.push_str(&format!("Result: failed ({err})\n")),
            None => content.push_str(&format!("Result:\n{}\n", turn.outcome.stdout())),
        }
        if !turn.explanation.is_empty() {
            content.push_str(&format!("Explanation: {}\n", turn.explanation));
        }
        content.push('\n');
    }
    (SUMMARIZATION_PROMPT.to_string(), content)
}

// ── Shared helpers ─────────────────────────────────────────────────

fn split_history(
    history: &[ConversationTurn],
    keep_recent: usize,
) -> Option<(&[ConversationTurn], &[ConversationTurn])> {
    if history.len() <= keep_recent {
        return None;
    }
    Some(history.split_at(history.len() - keep_recent))
}

fn assemble(
    to_compress: &[ConversationTurn],
    to_keep: &[ConversationTurn],
    summary: String,
) -> Vec<ConversationTurn> {
    let mut out = Vec::with_capacity(to_keep.len() + 1);
    out.push(summary_turn(to_compress, summary));
    out.extend_from_slice(to_keep);
    out
}

/// The synthetic turn standing in for `compressed`. Its timestamp is the
/// last compressed turn's, so the result depends only on the input.
fn summary_turn(compressed: &[ConversationTurn], summary: String) -> ConversationTurn {
    ConversationTurn {
        index: 0,
        timestamp: compressed
            .last()
            .map(|t| t.timestamp.clone())
            .unwrap_or_default(),
        question: SUMMARY_MARKER.to_string(),
        code: String::new(),
        outcome: ExecutionOutcome::success("", ""),
        explanation: summary,
        retry_count: 0,
        artifact_path: None,
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
