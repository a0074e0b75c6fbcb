//! The retry/self-healing loop that turns a question into a recorded turn.
//!
//! For each question the [`Orchestrator`]:
//!
//! 1. computes a [`BudgetSnapshot`] for question + global context + history;
//! 2. compacts the history for the prompt when the budget says so, or else
//!    takes the last `history_window` turns;
//! 3. runs the attempt loop below;
//! 4. asks the [`Explainer`] about a successful result;
//! 5. appends the turn to the [`SessionRecord`] and saves it.
//!
//! # Attempt loop
//!
//! ```text
//! attempt 0: generate ──► policy ──► execute ──► success? ──► Succeeded (retry_count 0)
//!                                                   │ no
//!                                                   ▼
//!            deep analysis ──► policy ──► execute ──► success? ──► Succeeded (retry_count 0)
//!                                                   │ no
//!                                                   ▼
//! attempt n: generate_fix(feedback) ──► policy ──► execute ──► success? ──► Succeeded (retry_count n)
//!                                                   │ no, n + 1 == max_retries
//!                                                   ▼
//!                                                 Failed (retry_count max_retries)
//! ```
//!
//! Deep analysis runs once, only after attempt 0, and does not take an
//! attempt slot. A generation error on attempt 0 aborts the question with
//! [`AnalysisError::Generation`]; on later attempts it uses up the slot and
//! the previous outcome stays the one reported.

use crate::agent::events::{AnalysisEvent, EventHandler, NoopHandler};
use crate::agent::explainer::Explainer;
use crate::agent::generator::{
    CodeGenerator, CodeSubmission, ErrorFeedback, GenerationRequest, Origin,
};
use crate::agent::prompts::EXPLANATION_PLACEHOLDER;
use crate::agent::session::{ConversationTurn, SessionRecord, SessionStats, SessionStore};
use crate::context::{BudgetSnapshot, Compactor, ContextBudget, GlobalContext, RuleCompactor};
use crate::error::AnalysisError;
use crate::sandbox::{CodeExecutor, ErrorKind, ExecutionOutcome, PolicyEnforcer, Verdict};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

// ── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Attempt slots per question. Default: `3`.
    pub max_retries: u32,
    /// Turns kept verbatim when compacting. Default: `3`.
    pub keep_recent: usize,
    /// Turns sent when no compaction is needed. Default: `3`.
    pub history_window: usize,
    /// Try deep analysis after a failed first attempt. Default: `true`.
    pub deep_analysis: bool,
    pub compaction_instruction: Option<String>,
    /// Where charts are saved. `None` disables chart paths.
    pub plots_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            keep_recent: 3,
            history_window: 3,
            deep_analysis: true,
            compaction_instruction: None,
            plots_dir: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_deep_analysis(mut self, enabled: bool) -> Self {
        self.deep_analysis = enabled;
        self
    }

    pub fn with_keep_recent(mut self, keep_recent: usize) -> Self {
        self.keep_recent = keep_recent;
        self
    }

    pub fn with_history_window(mut self, turns: usize) -> Self {
        self.history_window = turns;
        self
    }

    pub fn with_plots_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plots_dir = Some(dir.into());
        self
    }
}

// ── Results ────────────────────────────────────────────────────────

/// How a question ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    /// Every attempt slot was used without a successful execution.
    Failed,
}

/// What [`Orchestrator::analyze_question`] returns.
#[derive(Debug, Clone)]
pub struct QuestionReport {
    pub resolution: Resolution,
    /// The recorded turn, with the winning (or last) code and outcome.
    pub turn: ConversationTurn,
    pub budget: BudgetSnapshot,
    /// Whether the prompt history was compacted.
    pub compacted: bool,
    /// Calls made to the generator, deep analysis included.
    pub generator_calls: u32,
}

/// What [`Orchestrator::finish`] returns.
#[derive(Debug)]
pub struct SessionSummary {
    pub record: SessionRecord,
    pub stats: SessionStats,
    pub report_path: Option<PathBuf>,
}

struct Resolved {
    resolution: Resolution,
    code: String,
    outcome: ExecutionOutcome,
    retry_count: u32,
    generator_calls: u32,
}

// ── Orchestrator ───────────────────────────────────────────────────

/// Drives generation, policy check, execution, and recording for one
/// session. Holds the executor `&mut` for its whole lifetime.
pub struct Orchestrator<'a> {
    generator: Arc<dyn CodeGenerator>,
    executor: &'a mut dyn CodeExecutor,
    global: &'a GlobalContext,
    config: OrchestratorConfig,
    budget: ContextBudget,
    compactor: Box<dyn Compactor>,
    policy: PolicyEnforcer,
    explainer: Option<Arc<dyn Explainer>>,
    event_handler: &'a dyn EventHandler,
    store: Option<SessionStore>,
    record: SessionRecord,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        executor: &'a mut dyn CodeExecutor,
        global: &'a GlobalContext,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            generator,
            executor,
            global,
            config,
            budget: ContextBudget::default(),
            compactor: Box::new(RuleCompactor),
            policy: PolicyEnforcer::default(),
            explainer: None,
            event_handler: &NoopHandler,
            store: None,
            record: SessionRecord::new(Some(global.dataset.path.clone())),
        }
    }

    pub fn with_budget(mut self, budget: ContextBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_compactor(mut self, compactor: Box<dyn Compactor>) -> Self {
        self.compactor = compactor;
        self
    }

    pub fn with_policy(mut self, policy: PolicyEnforcer) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_explainer(mut self, explainer: Arc<dyn Explainer>) -> Self {
        self.explainer = Some(explainer);
        self
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = handler;
        self
    }

    /// Persist the record after every question.
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Continue an existing session instead of starting a new one.
    pub fn with_record(mut self, record: SessionRecord) -> Self {
        self.record = record;
        self
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn session_id(&self) -> &str {
        &self.record.session_id
    }

    /// Analyse one question end to end and record the turn.
    pub async fn analyze_question(
        &mut self,
        question: &str,
    ) -> Result<QuestionReport, AnalysisError> {
        let events = self.event_handler;
        let index = self.record.next_index();
        events.on_event(&AnalysisEvent::QuestionReceived { index, question });

        let snapshot = self
            .budget
            .compute_context(question, self.global, self.record.turns());
        events.on_event(&AnalysisEvent::BudgetChecked(&snapshot));

        let (history, compacted) = self.history_view(&snapshot).await;
        let artifact_path = self.artifact_path(index);
        let mut request = GenerationRequest {
            question: question.to_string(),
            context_prompt: self.global.render(),
            history,
            feedback: None,
            artifact_path: artifact_path.as_ref().map(|p| p.display().to_string()),
        };

        let resolved = self.resolve(&mut request).await;
        if let Err(e) = self.executor.close_artifacts().await {
            warn!("Failed to close pending figures: {e}");
        }
        let resolved = resolved?;

        let explanation = match resolved.resolution {
            Resolution::Succeeded => {
                self.explain(question, &resolved.code, &resolved.outcome)
                    .await
            }
            Resolution::Failed => format!(
                "Analysis failed after {} attempts. Last error: {}",
                resolved.retry_count,
                resolved.outcome.error_summary().unwrap_or_default()
            ),
        };

        let mut turn = ConversationTurn::new(
            index,
            question,
            resolved.code,
            resolved.outcome,
            explanation,
            resolved.retry_count,
        );
        if resolved.resolution == Resolution::Succeeded
            && let Some(path) = artifact_path.filter(|p| p.exists())
        {
            turn = turn.with_artifact_path(path.display().to_string());
        }

        self.record_turn(turn.clone());

        Ok(QuestionReport {
            resolution: resolved.resolution,
            turn,
            budget: snapshot,
            compacted,
            generator_calls: resolved.generator_calls,
        })
    }

    /// Emit end-of-session statistics and export the report.
    pub fn finish(self) -> SessionSummary {
        let stats = self.record.statistics();
        let report_path = match &self.store {
            Some(store) => match store.export_report(&self.record) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Failed to export report: {e}");
                    None
                }
            },
            None => None,
        };
        self.event_handler.on_event(&AnalysisEvent::SessionFinished {
            stats: &stats,
            report_path: report_path.as_deref(),
        });
        SessionSummary {
            record: self.record,
            stats,
            report_path,
        }
    }

    // ── Internals ──

    async fn history_view(&self, snapshot: &BudgetSnapshot) -> (Vec<ConversationTurn>, bool) {
        let turns = self.record.turns();
        if !self.budget.should_compact(snapshot.total) {
            let start = turns.len().saturating_sub(self.config.history_window);
            return (turns[start..].to_vec(), false);
        }

        let compacted = self
            .compactor
            .compact(
                turns,
                self.config.keep_recent,
                self.config.compaction_instruction.as_deref(),
            )
            .await;
        self.event_handler
            .on_event(&AnalysisEvent::HistoryCompacted {
                strategy: self.compactor.name(),
                before: turns.len(),
                after: compacted.len(),
            });
        (compacted, true)
    }

    fn artifact_path(&self, index: u32) -> Option<PathBuf> {
        self.config
            .plots_dir
            .as_ref()
            .map(|dir| dir.join(format!("plot_{}_{index}.png", self.record.session_id)))
    }

    async fn resolve(&mut self, request: &mut GenerationRequest) -> Result<Resolved, AnalysisError> {
        let events = self.event_handler;
        let max_retries = self.config.max_retries.max(1);
        let mut last: Option<(String, ExecutionOutcome)> = None;
        let mut generator_calls = 0;

        for attempt in 0..max_retries {
            let number = attempt + 1;
            let origin = if attempt == 0 {
                Origin::Primary
            } else {
                Origin::FixRetry
            };
            request.feedback = last
                .as_ref()
                .and_then(|(code, outcome)| ErrorFeedback::from_outcome(code, outcome));

            generator_calls += 1;
            let generated = if attempt == 0 {
                self.generator.generate(request).await
            } else {
                self.generator.generate_fix(request).await
            };
            let code = match generated {
                Ok(code) => code,
                Err(error) => {
                    events.on_event(&AnalysisEvent::GenerationFailed {
                        attempt: number,
                        origin,
                        error: &error,
                    });
                    if attempt == 0 {
                        return Err(error.into());
                    }
                    if number < max_retries {
                        events.on_event(&AnalysisEvent::RetryScheduled {
                            next_attempt: number + 1,
                            max_retries,
                        });
                    }
                    continue;
                }
            };

            let submission = CodeSubmission::new(code, origin);
            let outcome = self.run_submission(number, &submission).await;
            if outcome.is_success() {
                return Ok(Resolved {
                    resolution: Resolution::Succeeded,
                    code: submission.text().to_string(),
                    outcome,
                    retry_count: attempt,
                    generator_calls,
                });
            }
            events.on_event(&AnalysisEvent::AttemptFailed {
                attempt: number,
                origin,
                outcome: &outcome,
            });
            last = Some((submission.text().to_string(), outcome));

            if attempt == 0 && self.config.deep_analysis {
                events.on_event(&AnalysisEvent::DeepAnalysisStarted);
                request.feedback = last
                    .as_ref()
                    .and_then(|(code, outcome)| ErrorFeedback::from_outcome(code, outcome));
                generator_calls += 1;
                match self.generator.deep_analysis(request).await {
                    Ok(code) => {
                        let candidate = CodeSubmission::new(code, Origin::DeepAnalysis);
                        let outcome = self.run_submission(number, &candidate).await;
                        if outcome.is_success() {
                            return Ok(Resolved {
                                resolution: Resolution::Succeeded,
                                code: candidate.text().to_string(),
                                outcome,
                                retry_count: 0,
                                generator_calls,
                            });
                        }
                        events.on_event(&AnalysisEvent::AttemptFailed {
                            attempt: number,
                            origin: Origin::DeepAnalysis,
                            outcome: &outcome,
                        });
                        last = Some((candidate.text().to_string(), outcome));
                    }
                    Err(error) => {
                        events.on_event(&AnalysisEvent::GenerationFailed {
                            attempt: number,
                            origin: Origin::DeepAnalysis,
                            error: &error,
                        });
                    }
                }
            }

            if number < max_retries {
                events.on_event(&AnalysisEvent::RetryScheduled {
                    next_attempt: number + 1,
                    max_retries,
                });
            }
        }

        events.on_event(&AnalysisEvent::RetriesExhausted { max_retries });
        // Attempt 0 either returns early or leaves an outcome behind.
        let (code, outcome) = last.unwrap_or_else(|| {
            (
                String::new(),
                ExecutionOutcome::failure(ErrorKind::SandboxFailure, "no code was executed"),
            )
        });
        Ok(Resolved {
            resolution: Resolution::Failed,
            code,
            outcome,
            retry_count: max_retries,
            generator_calls,
        })
    }

    /// Policy check, then execution. A rejected submission never reaches
    /// the executor.
    async fn run_submission(&mut self, attempt: u32, submission: &CodeSubmission) -> ExecutionOutcome {
        let events = self.event_handler;
        events.on_event(&AnalysisEvent::CodeGenerated {
            attempt,
            submission,
        });

        let outcome = match self.policy.validate(submission.text()) {
            Verdict::Accepted => self.executor.execute(submission.text()).await,
            Verdict::Violation(violation) => {
                events.on_event(&AnalysisEvent::PolicyRejected {
                    attempt,
                    violation: &violation,
                });
                ExecutionOutcome::failure(ErrorKind::PolicyViolation, violation.to_string())
            }
        };
        debug!(
            "Attempt {attempt} ({}) success={} in {}ms",
            submission.origin(),
            outcome.is_success(),
            outcome.elapsed_ms()
        );
        events.on_event(&AnalysisEvent::ExecutionFinished {
            attempt,
            origin: submission.origin(),
            outcome: &outcome,
        });
        outcome
    }

    async fn explain(&self, question: &str, code: &str, outcome: &ExecutionOutcome) -> String {
        let Some(explainer) = &self.explainer else {
            return EXPLANATION_PLACEHOLDER.to_string();
        };
        match explainer.explain(question, code, outcome).await {
            Ok(text) => {
                self.event_handler
                    .on_event(&AnalysisEvent::ExplanationReady(&text));
                text
            }
            Err(error) => {
                self.event_handler
                    .on_event(&AnalysisEvent::ExplanationFailed { error: &error });
                EXPLANATION_PLACEHOLDER.to_string()
            }
        }
    }

    fn record_turn(&mut self, turn: ConversationTurn) {
        let events = self.event_handler;
        if let Err(e) = self.record.push_turn(turn) {
            warn!("Turn not recorded: {e}");
            return;
        }
        if let Some(turn) = self.record.turns().last() {
            events.on_event(&AnalysisEvent::TurnRecorded(turn));
        }
        if let Some(store) = &self.store
            && let Err(error) = store.save(&self.record)
        {
            events.on_event(&AnalysisEvent::SessionSaveFailed { error: &error });
        }
    }
}
