//! Events and handlers for the [`Orchestrator`](super::orchestrator::Orchestrator).
//!
//! The orchestrator reports everything it decides through [`AnalysisEvent`]
//! variants: the question, the budget snapshot, each submission, each
//! outcome, each retry, and the end-of-session statistics. Handlers are a
//! one-way sink. `on_event` returns nothing, so a handler can render or log
//! but can never steer the retry loop.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or batch runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Terminal rendering, metrics |

use crate::agent::generator::{CodeSubmission, Origin};
use crate::agent::session::{ConversationTurn, SessionStats};
use crate::context::BudgetSnapshot;
use crate::error::{ExplanationError, GenerationError, SessionError};
use crate::sandbox::{ExecutionOutcome, PolicyViolation};
use std::path::Path;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted while a question is analysed.
///
/// `attempt` is 1-based. The deep-analysis candidate reports the attempt
/// it is recovering (always 1), since it does not take a slot of its own.
#[derive(Debug)]
pub enum AnalysisEvent<'a> {
    /// A new question is about to be analysed.
    QuestionReceived { index: u32, question: &'a str },
    /// Token accounting for this request.
    BudgetChecked(&'a BudgetSnapshot),
    /// The history sent to the model was compacted.
    HistoryCompacted {
        strategy: &'a str,
        before: usize,
        after: usize,
    },
    /// A code submission was produced and is about to be checked.
    CodeGenerated {
        attempt: u32,
        submission: &'a CodeSubmission,
    },
    /// The static policy check rejected a submission. It was not executed.
    PolicyRejected {
        attempt: u32,
        violation: &'a PolicyViolation,
    },
    /// A submission finished executing (or was rejected before it could).
    ExecutionFinished {
        attempt: u32,
        origin: Origin,
        outcome: &'a ExecutionOutcome,
    },
    /// A submission failed. Emitted before anything else is attempted.
    AttemptFailed {
        attempt: u32,
        origin: Origin,
        outcome: &'a ExecutionOutcome,
    },
    /// Another fix attempt follows.
    RetryScheduled { next_attempt: u32, max_retries: u32 },
    /// The first attempt failed; asking for a deep-analysis candidate.
    DeepAnalysisStarted,
    /// The generation service failed for this attempt.
    GenerationFailed {
        attempt: u32,
        origin: Origin,
        error: &'a GenerationError,
    },
    /// Every attempt failed.
    RetriesExhausted { max_retries: u32 },
    /// Explanation text for a successful turn.
    ExplanationReady(&'a str),
    /// The explanation service failed; a placeholder was recorded.
    ExplanationFailed { error: &'a ExplanationError },
    /// The turn was appended to the session record.
    TurnRecorded(&'a ConversationTurn),
    /// Persisting the session failed. The turn is still in memory.
    SessionSaveFailed { error: &'a SessionError },
    /// End-of-session statistics.
    SessionFinished {
        stats: &'a SessionStats,
        report_path: Option<&'a Path>,
    },
}

/// Handler for analysis events.
///
/// # Example
///
/// ```ignore
/// struct Printer;
///
/// impl EventHandler for Printer {
///     fn on_event(&self, event: &AnalysisEvent<'_>) {
///         if let AnalysisEvent::ExecutionFinished { outcome, .. } = event {
///             println!("{}", outcome.stdout());
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &AnalysisEvent<'_>) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let AnalysisEvent::RetryScheduled { next_attempt, .. } = event {
///         eprintln!("retrying ({next_attempt})");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&AnalysisEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&AnalysisEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&AnalysisEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &AnalysisEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler, in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(interactive, ConsoleHandler);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add `handler` only when `condition` holds.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &AnalysisEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &AnalysisEvent<'_>) {
        match event {
            AnalysisEvent::QuestionReceived { index, question } => {
                info!("[turn {index}] {}", preview(question, 200));
            }
            AnalysisEvent::BudgetChecked(snapshot) => {
                info!("{}", snapshot.to_log_string());
            }
            AnalysisEvent::HistoryCompacted {
                strategy,
                before,
                after,
            } => {
                info!("History compacted ({strategy}): {before} -> {after} turns");
            }
            AnalysisEvent::CodeGenerated {
                attempt,
                submission,
            } => {
                debug!(
                    "Attempt {attempt} ({}): {} chars of code",
                    submission.origin(),
                    submission.text().chars().count()
                );
            }
            AnalysisEvent::PolicyRejected { attempt, violation } => {
                warn!("Attempt {attempt} rejected by policy: {violation}");
            }
            AnalysisEvent::ExecutionFinished {
                attempt,
                origin,
                outcome,
            } => {
                if outcome.is_success() {
                    info!(
                        "Attempt {attempt} ({origin}) succeeded in {}ms",
                        outcome.elapsed_ms()
                    );
                } else {
                    debug!("Attempt {attempt} ({origin}) finished with an error");
                }
            }
            AnalysisEvent::AttemptFailed {
                attempt,
                origin,
                outcome,
            } => {
                let summary = outcome.error_summary().unwrap_or_default();
                warn!("Attempt {attempt} ({origin}) failed: {}", preview(&summary, 200));
            }
            AnalysisEvent::RetryScheduled {
                next_attempt,
                max_retries,
            } => {
                info!("Retrying with error feedback ({next_attempt}/{max_retries})");
            }
            AnalysisEvent::DeepAnalysisStarted => {
                info!("First attempt failed; running deep analysis");
            }
            AnalysisEvent::GenerationFailed {
                attempt,
                origin,
                error,
            } => {
                warn!("Generation failed on attempt {attempt} ({origin}): {error}");
            }
            AnalysisEvent::RetriesExhausted { max_retries } => {
                warn!("All {max_retries} attempts failed");
            }
            AnalysisEvent::ExplanationReady(text) => {
                debug!("Explanation: {}", preview(text, 200));
            }
            AnalysisEvent::ExplanationFailed { error } => {
                warn!("Explanation unavailable: {error}");
            }
            AnalysisEvent::TurnRecorded(turn) => {
                debug!(
                    "Recorded turn {} (success={}, retries={})",
                    turn.index,
                    turn.outcome.is_success(),
                    turn.retry_count
                );
            }
            AnalysisEvent::SessionSaveFailed { error } => {
                warn!("Failed to save session: {error}");
            }
            AnalysisEvent::SessionFinished { stats, report_path } => {
                info!(
                    "Session finished: {} turns, {} succeeded, {} failed, {} retries",
                    stats.total_turns, stats.success_count, stats.failed_count, stats.total_retries
                );
                if let Some(path) = report_path {
                    info!("Report written to {}", path.display());
                }
            }
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let head: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn composite_dispatches_to_all_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = seen.clone();
        let b = seen.clone();
        let handler = CompositeEventHandler::new()
            .with(FnEventHandler::new(move |_| a.lock().unwrap().push("a")))
            .with_if(false, NoopHandler)
            .with_opt(None::<NoopHandler>)
            .with(FnEventHandler::new(move |_| b.lock().unwrap().push("b")));

        handler.on_event(&AnalysisEvent::DeepAnalysisStarted);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn logging_handler_accepts_every_event() {
        let outcome = ExecutionOutcome::success("42\n", "");
        LoggingHandler.on_event(&AnalysisEvent::ExecutionFinished {
            attempt: 1,
            origin: Origin::Primary,
            outcome: &outcome,
        });
        LoggingHandler.on_event(&AnalysisEvent::RetriesExhausted { max_retries: 3 });
    }

    #[test]
    fn preview_cuts_on_chars() {
        assert_eq!(preview("数据分析", 2), "数据...");
        assert_eq!(preview("ok", 5), "ok");
    }
}
