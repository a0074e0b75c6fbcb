//! Context budget: estimates the token cost of the next request and decides
//! when the conversation history must be compacted.
//!
//! The estimate is a character heuristic, not a tokenizer. It only needs to
//! be stable and roughly proportional, because it drives one decision
//! (compact or not) against a ceiling that already leaves generous headroom
//! below the model's real limit.
//!
//! | Characters | Weight |
//! |------------|--------|
//! | CJK ideographs (`U+4E00..=U+9FFF`) | 1.5 per char |
//! | everything else, prose | 0.25 per char |
//! | everything else, code-dense text | 0.4 per char |
//!
//! Text counts as code-dense when it contains more than
//! [`CODE_MARKER_THRESHOLD`] occurrences of [`CODE_MARKERS`].

use crate::agent::session::ConversationTurn;
use crate::context::global::GlobalContext;
use serde::Serialize;
use std::fmt;

/// Default model context window in tokens.
pub const DEFAULT_MODEL_MAX_TOKENS: usize = 128_000;

/// Default fraction of the window usable before compaction kicks in.
pub const DEFAULT_THRESHOLD_RATIO: f64 = 0.7;

/// Substrings that mark text as source code.
pub const CODE_MARKERS: &[&str] = &["def ", "import ", "print(", "if ", "for ", "while "];

/// More marker hits than this switches to the code weight.
pub const CODE_MARKER_THRESHOLD: usize = 5;

const WIDE_WEIGHT: f64 = 1.5;
const PROSE_WEIGHT: f64 = 0.25;
const CODE_WEIGHT: f64 = 0.4;

const WARNING_PCT: f64 = 80.0;
const NORMAL_PCT: f64 = 50.0;
const CRITICAL_PCT: f64 = 100.0;

/// Coarse health of the context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Healthy,
    Normal,
    Warning,
    Critical,
}

impl BudgetStatus {
    fn from_usage_pct(pct: f64) -> Self {
        if pct >= CRITICAL_PCT {
            Self::Critical
        } else if pct >= WARNING_PCT {
            Self::Warning
        } else if pct >= NORMAL_PCT {
            Self::Normal
        } else {
            Self::Healthy
        }
    }
}

impl fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Normal => write!(f, "normal"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One evaluation of the token accounting for a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub question_tokens: usize,
    pub global_tokens: usize,
    pub history_tokens: usize,
    pub total: usize,
    pub safe_ceiling: usize,
    /// `total / safe_ceiling * 100`.
    pub usage_pct: f64,
    pub status: BudgetStatus,
}

impl BudgetSnapshot {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.1}% of {}, {}) [question {}, global {}, history {}]",
            thousands(self.total),
            self.usage_pct,
            thousands(self.safe_ceiling),
            self.status,
            thousands(self.question_tokens),
            thousands(self.global_tokens),
            thousands(self.history_tokens),
        )
    }
}

/// Stateless token accountant.
#[derive(Debug, Clone)]
pub struct ContextBudget {
    model_max_tokens: usize,
    threshold_ratio: f64,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            model_max_tokens: DEFAULT_MODEL_MAX_TOKENS,
            threshold_ratio: DEFAULT_THRESHOLD_RATIO,
        }
    }
}

impl ContextBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the model context window (in tokens).
    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.model_max_tokens = max;
        self
    }

    /// Override the usable fraction of the window. Clamped to `0.0..=1.0`.
    pub fn with_threshold_ratio(mut self, ratio: f64) -> Self {
        self.threshold_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.model_max_tokens
    }

    /// `floor(model_max_tokens * threshold_ratio)`.
    pub fn safe_ceiling(&self) -> usize {
        (self.model_max_tokens as f64 * self.threshold_ratio).floor() as usize
    }

    /// Heuristic token count for `text`.
    pub fn estimate(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    /// Token cost of one recorded turn as it appears in a prompt.
    /// Output only counts for successful turns.
    pub fn turn_tokens(&self, turn: &ConversationTurn) -> usize {
        let mut tokens = estimate_tokens(&turn.question)
            + estimate_tokens(&turn.code)
            + estimate_tokens(&turn.explanation);
        if turn.outcome.is_success() {
            tokens += estimate_tokens(turn.outcome.stdout());
        }
        tokens
    }

    pub fn compute_context(
        &self,
        question: &str,
        global: &GlobalContext,
        history: &[ConversationTurn],
    ) -> BudgetSnapshot {
        let question_tokens = estimate_tokens(question);
        let global_tokens = estimate_tokens(&global.render());
        let history_tokens = history.iter().map(|t| self.turn_tokens(t)).sum::<usize>();
        let total = question_tokens + global_tokens + history_tokens;
        let safe_ceiling = self.safe_ceiling();
        let usage_pct = if safe_ceiling > 0 {
            total as f64 / safe_ceiling as f64 * 100.0
        } else {
            CRITICAL_PCT
        };

        BudgetSnapshot {
            question_tokens,
            global_tokens,
            history_tokens,
            total,
            safe_ceiling,
            usage_pct,
            status: BudgetStatus::from_usage_pct(usage_pct),
        }
    }

    /// True iff `total` has reached the safe ceiling.
    pub fn should_compact(&self, total: usize) -> bool {
        total >= self.safe_ceiling()
    }
}

/// Heuristic token count; see the module docs for the weights.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let mut wide = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            wide += 1;
        } else {
            other += 1;
        }
    }
    let markers: usize = CODE_MARKERS.iter().map(|m| text.matches(m).count()).sum();
    let other_weight = if markers > CODE_MARKER_THRESHOLD {
        CODE_WEIGHT
    } else {
        PROSE_WEIGHT
    };
    (wide as f64 * WIDE_WEIGHT + other as f64 * other_weight).floor() as usize
}

fn thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
