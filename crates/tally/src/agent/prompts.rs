//! Prompt text for code generation, fixes, deep analysis, and explanations.
//!
//! Everything here is a pure function of its inputs, so the exact text a
//! model receives can be asserted in tests. Truncation is by characters.

use crate::agent::generator::{ErrorFeedback, GenerationRequest};
use crate::agent::session::ConversationTurn;
use crate::sandbox::ExecutionOutcome;

const HISTORY_CODE_CHARS: usize = 300;
const HISTORY_STDOUT_CHARS: usize = 200;
const HISTORY_ERROR_CHARS: usize = 100;
const HISTORY_TURN_CHARS: usize = 500;
const HISTORY_TOTAL_CHARS: usize = 2000;
const SUMMARY_CHARS: usize = 1200;

/// Earlier turns shown to the deep-analysis path.
const DEEP_HISTORY_TURNS: usize = 2;

/// Sent as `explanation` when the explanation service fails.
pub const EXPLANATION_PLACEHOLDER: &str = "(explanation unavailable)";

const GENERATION_RULES: &str = "\
You are a data analysis assistant. You answer questions about a CSV dataset by \
writing Python code that runs in a restricted sandbox.

Rules:
1. `df` already holds the dataset as a pandas DataFrame. Use it directly.
2. Never write import statements. The preloaded names listed below are all \
that is available.
3. Print every result you want to show with print().
4. If a chart helps, draw it with matplotlib and save it with plt.savefig(path) \
to the path you are given. Never call plt.show().
5. Clean columns before numeric work: strip currency symbols, thousands \
separators and percent signs with str.replace(), then convert with \
pd.to_numeric() or astype(float).
6. Never call eval, exec, open, getattr or similar, and never touch dunder \
attributes.
7. Keep the code short and direct.";

const DEEP_ANALYSIS_RULES: &str = "\
You are a Python debugging expert. A first attempt at answering a data \
question failed inside a restricted sandbox.

Diagnose in three steps:
1. Classify the failure: a sandbox limitation (an import, a missing builtin, \
file access) or a logic problem (wrong column name, dirty numeric data, type \
mismatch).
2. Find the root cause, not the symptom. NameError usually means a name the \
sandbox does not provide. KeyError usually means a misspelled column. \
TypeError on numeric columns usually means currency or comma characters.
3. Write the corrected, complete program.

Output format: exactly one ```python fenced block containing only code and \
code comments. Explanations may go outside the block.";

const EXPLANATION_RULES: &str = "\
You are a data analysis expert. Explain analysis results clearly and in \
depth, backing every point with concrete numbers from the output.";

/// System prompt for the primary and fix paths.
pub fn system_prompt(context_prompt: &str) -> String {
    format!("{GENERATION_RULES}\n\n{context_prompt}")
}

/// System prompt for the deep-analysis path.
pub fn deep_analysis_system_prompt(context_prompt: &str) -> String {
    format!("{DEEP_ANALYSIS_RULES}\n\n{context_prompt}")
}

pub fn explanation_system_prompt() -> &'static str {
    EXPLANATION_RULES
}

/// Render earlier turns for a generation prompt, newest last.
///
/// Each turn is capped. The overall cap is filled from the newest turn
/// backwards, so a follow-up question always sees the turn it refers to;
/// a leading summary turn is kept when it still fits. Omitted turns are
/// always older than every turn shown.
pub fn format_history(turns: &[ConversationTurn]) -> String {
    if turns.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = turns
        .iter()
        .enumerate()
        .map(|(i, turn)| render_turn(i + 1, turn))
        .collect();

    let mut total = 0;
    let mut first_kept = rendered.len();
    for (i, text) in rendered.iter().enumerate().rev() {
        let len = text.chars().count();
        if total + len > HISTORY_TOTAL_CHARS {
            break;
        }
        total += len;
        first_kept = i;
    }

    let mut parts = vec!["## Conversation so far".to_string()];
    if first_kept > 0 {
        let summary_fits = turns[0].is_summary()
            && total + rendered[0].chars().count() <= HISTORY_TOTAL_CHARS;
        if summary_fits {
            parts.push(rendered[0].clone());
        }
        let skipped = first_kept - usize::from(summary_fits);
        if skipped > 0 {
            let noun = if skipped == 1 { "turn" } else { "turns" };
            parts.push(format!("\n... ({skipped} older {noun} omitted)"));
        }
    }
    parts.extend(rendered.into_iter().skip(first_kept));
    parts.join("\n")
}

fn render_turn(number: usize, turn: &ConversationTurn) -> String {
    if turn.is_summary() {
        return format!(
            "\n{}\n{}",
            turn.question,
            truncate(&turn.explanation, SUMMARY_CHARS, "")
        );
    }
    let mut lines = vec![
        format!("\nTurn {number}:"),
        format!("Question: {}", turn.question),
        format!(
            "Code:\n{}",
            truncate(&turn.code, HISTORY_CODE_CHARS, "\n... (code truncated)")
        ),
    ];
    if turn.outcome.is_success() {
        let stdout = turn.outcome.stdout().trim();
        if !stdout.is_empty() {
            lines.push(format!(
                "Result: {}",
                truncate(stdout, HISTORY_STDOUT_CHARS, "... (output truncated)")
            ));
        }
    } else {
        let error = turn.outcome.error_summary().unwrap_or_default();
        lines.push(format!(
            "Error: {}",
            truncate(&error, HISTORY_ERROR_CHARS, "...")
        ));
    }
    truncate(&lines.join("\n"), HISTORY_TURN_CHARS, "\n... (turn truncated)")
}

/// Error feedback block with step-by-step repair guidance.
pub fn format_error_feedback(feedback: &ErrorFeedback) -> String {
    let mut parts = vec![
        "## The previous code failed".to_string(),
        format!("Code:\n{}", feedback.code),
        format!("\nError type: {}", feedback.error_kind),
        format!("Error message: {}", feedback.error_message),
    ];
    if let Some(tb) = &feedback.traceback {
        parts.push(format!("\nTraceback (last lines):\n{tb}"));
    }
    parts.push(
        "\nFix it step by step:\n\
         1. Work out why the error happened: data, syntax, or logic.\n\
         2. Choose the simplest fix that addresses the root cause.\n\
         3. Return the complete corrected program, ready to run."
            .to_string(),
    );
    parts.join("\n")
}

fn requirements(artifact_path: Option<&str>) -> String {
    let mut lines = vec![
        "## Requirements".to_string(),
        "1. Return only executable Python code.".to_string(),
        "2. `df` is loaded; use it directly.".to_string(),
        "3. print() the key results.".to_string(),
    ];
    if let Some(path) = artifact_path {
        lines.push(format!("4. If you draw a chart, save it with plt.savefig('{path}')."));
    }
    lines.join("\n")
}

/// User message for the primary path, or for the fix path when the
/// request carries feedback.
pub fn generation_prompt(request: &GenerationRequest) -> String {
    let mut parts = Vec::new();
    let history = format_history(&request.history);
    if !history.is_empty() {
        parts.push(history);
    }
    if let Some(feedback) = &request.feedback {
        parts.push(format_error_feedback(feedback));
    }
    parts.push(format!("## Question\n{}", request.question));
    parts.push(requirements(request.artifact_path.as_deref()));
    parts.join("\n\n")
}

/// User message for the deep-analysis path: recent turn statuses, the
/// question, and the failed code with its error.
pub fn deep_analysis_prompt(request: &GenerationRequest) -> String {
    let mut parts = Vec::new();

    let recent: Vec<&ConversationTurn> = request
        .history
        .iter()
        .filter(|t| !t.is_summary())
        .collect();
    let skip = recent.len().saturating_sub(DEEP_HISTORY_TURNS);
    if recent.len() > skip {
        let mut lines = vec!["## Recent turns".to_string()];
        for (i, turn) in recent[skip..].iter().enumerate() {
            let status = if turn.outcome.is_success() { "succeeded" } else { "failed" };
            lines.push(format!("{}. {} ({status})", i + 1, turn.question));
        }
        parts.push(lines.join("\n"));
    }

    parts.push(format!("## Question\n{}", request.question));

    if let Some(feedback) = &request.feedback {
        let mut lines = vec![
            format!("## Failed code\n```python\n{}\n```", feedback.code),
            format!(
                "## Error\nType: {}\nMessage: {}",
                feedback.error_kind, feedback.error_message
            ),
        ];
        if let Some(tb) = &feedback.traceback {
            lines.push(format!("Traceback (last lines):\n{tb}"));
        }
        parts.push(lines.join("\n\n"));
    }

    let mut task = vec![
        "## Task".to_string(),
        "Classify the failure, find its root cause, then write the corrected program in a single ```python block.".to_string(),
        "Do not import anything; use only the preloaded names.".to_string(),
        "Clean numeric columns before computing with them.".to_string(),
    ];
    if let Some(path) = &request.artifact_path {
        task.push(format!("Save any chart with plt.savefig('{path}')."));
    }
    parts.push(task.join("\n"));
    parts.join("\n\n")
}

/// User message for the explanation service.
pub fn explanation_prompt(question: &str, code: &str, outcome: &ExecutionOutcome) -> String {
    let mut parts = vec![
        format!("Question: {question}"),
        format!("\nCode that ran:\n{code}"),
    ];
    if outcome.is_success() {
        parts.push(format!("\nOutput:\n{}", outcome.stdout().trim()));
        for artifact in outcome.artifact_refs() {
            parts.push(format!("\nChart saved to: {artifact}"));
        }
    }
    parts.push(
        "\nAnswer the question from this output:\n\
         1. Answer it directly.\n\
         2. Describe trends, relationships and anomalies in the data.\n\
         3. Support each point with specific numbers, rates or percentages.\n\
         4. Close with conclusions and practical recommendations.\n\
         Use Markdown headings and lists. Focus on what the data means, not on \
         chart mechanics."
            .to_string(),
    );
    parts.join("\n")
}

fn truncate(text: &str, max_chars: usize, marker: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}{marker}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RuleCompactor, SUMMARY_MARKER};
    use crate::sandbox::{ErrorKind, ExceptionClass};

    fn turn(index: u32, code: &str, outcome: ExecutionOutcome) -> ConversationTurn {
        ConversationTurn::new(index, format!("question {index}"), code, outcome, "", 0)
    }

    fn request(feedback: Option<ErrorFeedback>) -> GenerationRequest {
        GenerationRequest {
            question: "Which region sells most?".into(),
            context_prompt: "## Dataset".into(),
            history: vec![
                turn(1, "print(1)", ExecutionOutcome::success("1", "")),
                turn(
                    2,
                    "df['x']",
                    ExecutionOutcome::failure(
                        ErrorKind::RuntimeFault(ExceptionClass::KeyError),
                        "'x'",
                    ),
                ),
                turn(3, "print(3)", ExecutionOutcome::success("3", "")),
            ],
            feedback,
            artifact_path: Some("output/plots/plot_s_4.png".into()),
        }
    }

    fn feedback() -> ErrorFeedback {
        ErrorFeedback {
            code: "df['Sales'].sum()".into(),
            error_kind: ErrorKind::RuntimeFault(ExceptionClass::TypeError),
            error_message: "can only concatenate str".into(),
            traceback: Some("line 1\nTypeError: can only concatenate str".into()),
        }
    }

    #[test]
    fn history_truncates_long_code_and_output() {
        let long_code = "x = 1\n".repeat(100);
        let long_out = "9".repeat(500);
        let text = format_history(&[turn(1, &long_code, ExecutionOutcome::success(long_out, ""))]);
        assert!(text.contains("(code truncated)"));
        assert!(text.chars().count() < 700);
    }

    #[test]
    fn history_shows_errors_for_failed_turns() {
        let text = format_history(&request(None).history);
        assert!(text.contains("Error: KeyError: 'x'"));
        assert!(text.contains("Result: 1"));
    }

    #[test]
    fn history_total_is_capped() {
        let turns: Vec<_> = (1..=20)
            .map(|i| turn(i, &"y = 2\n".repeat(60), ExecutionOutcome::success("ok", "")))
            .collect();
        let text = format_history(&turns);
        assert!(text.contains("older turns omitted"));
        assert!(text.chars().count() <= HISTORY_TOTAL_CHARS + 100);
        assert!(text.contains("Question: question 20"));
        assert!(!text.contains("Question: question 1\n"));
    }

    #[test]
    fn newest_turn_survives_a_large_summary() {
        let mut turns = RuleCompactor.compact_turns(
            &(1..=6)
                .map(|i| {
                    ConversationTurn::new(
                        i,
                        format!("QUESTION-{i}: {}", "why are sales down ".repeat(12)),
                        "t = df.groupby('Region')['Sales'].sum()\nprint(t)\n".repeat(6),
                        ExecutionOutcome::success("North 1200\n".repeat(20), ""),
                        "We decided to group by region. The data shows North leads.",
                        0,
                    )
                })
                .collect::<Vec<_>>(),
            3,
            None,
        );
        assert!(turns[0].is_summary());
        // Pad the summary so it and the kept turns cannot all fit.
        turns[0].explanation = "finding ".repeat(150);

        let text = format_history(&turns);
        assert!(text.contains("QUESTION-6"));
        assert!(text.contains("QUESTION-5"));
        let newest = text.find("QUESTION-6").unwrap();
        let older = text.find("QUESTION-5").unwrap();
        assert!(older < newest, "chronological order");
        assert!(text.chars().count() <= HISTORY_TOTAL_CHARS + 100);
    }

    #[test]
    fn summary_is_kept_when_it_fits() {
        let mut turns = RuleCompactor.compact_turns(
            &(1..=5)
                .map(|i| turn(i, "print(1)", ExecutionOutcome::success("1", "")))
                .collect::<Vec<_>>(),
            2,
            None,
        );
        turns[0].explanation = "Grouped sales by region.".into();
        turns.extend((6..=12).map(|i| turn(i, &"z = 3\n".repeat(60), ExecutionOutcome::success("ok", ""))));

        let text = format_history(&turns);
        assert!(text.contains(SUMMARY_MARKER));
        assert!(text.contains("Question: question 12"));
        assert!(text.contains("older turns omitted"));
        let summary = text.find(SUMMARY_MARKER).unwrap();
        let omitted = text.find("older turns omitted").unwrap();
        assert!(summary < omitted);
    }

    #[test]
    fn primary_prompt_has_question_and_plot_path() {
        let text = generation_prompt(&request(None));
        assert!(text.contains("## Question\nWhich region sells most?"));
        assert!(text.contains("plt.savefig('output/plots/plot_s_4.png')"));
        assert!(!text.contains("previous code failed"));
    }

    #[test]
    fn fix_prompt_includes_feedback() {
        let text = generation_prompt(&request(Some(feedback())));
        assert!(text.contains("## The previous code failed"));
        assert!(text.contains("Error type: TypeError"));
        assert!(text.contains("Traceback (last lines)"));
    }

    #[test]
    fn deep_prompt_shows_last_two_turns_only() {
        let text = deep_analysis_prompt(&request(Some(feedback())));
        assert!(!text.contains("question 1"));
        assert!(text.contains("1. question 2 (failed)"));
        assert!(text.contains("2. question 3 (succeeded)"));
        assert!(text.contains("```python\ndf['Sales'].sum()\n```"));
    }

    #[test]
    fn explanation_prompt_omits_output_on_failure() {
        let failed = ExecutionOutcome::failure(ErrorKind::TimeoutError, "too slow");
        let text = explanation_prompt("q", "code", &failed);
        assert!(!text.contains("Output:"));
        let ok = ExecutionOutcome::success("total 42\n", "");
        assert!(explanation_prompt("q", "code", &ok).contains("Output:\ntotal 42"));
    }
}
