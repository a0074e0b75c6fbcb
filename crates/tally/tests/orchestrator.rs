//! End-to-end behaviour of the retry loop with scripted services.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tally::agent::explainer::ExplainFuture;
use tally::agent::generator::GenerationFuture;
use tally::agent::prompts::EXPLANATION_PLACEHOLDER;
use tally::agent::{
    AnalysisEvent, CodeGenerator, ConversationTurn, Explainer, FnEventHandler, GenerationRequest,
    Orchestrator, OrchestratorConfig, Resolution, SessionRecord, SessionStore,
};
use tally::context::{ContextBudget, DatasetInfo, GlobalContext, SUMMARY_MARKER};
use tally::error::{AnalysisError, ExplanationError, GenerationError, SandboxError};
use tally::sandbox::{CodeExecutor, ErrorKind, ExceptionClass, ExecFuture, ExecutionOutcome};

// ── Doubles ────────────────────────────────────────────────────────

type Script = Mutex<VecDeque<Result<String, GenerationError>>>;

#[derive(Default)]
struct ScriptedGenerator {
    primary: Script,
    fixes: Script,
    deep: Script,
    primary_calls: AtomicU32,
    fix_calls: AtomicU32,
    deep_calls: AtomicU32,
    /// History length and whether feedback was present, per call.
    seen: Mutex<Vec<(usize, bool)>>,
    first_history_question: Mutex<Option<String>>,
}

impl ScriptedGenerator {
    fn primary(self, r: Result<&str, GenerationError>) -> Self {
        self.primary.lock().unwrap().push_back(r.map(str::to_string));
        self
    }

    fn fix(self, r: Result<&str, GenerationError>) -> Self {
        self.fixes.lock().unwrap().push_back(r.map(str::to_string));
        self
    }

    fn deep(self, r: Result<&str, GenerationError>) -> Self {
        self.deep.lock().unwrap().push_back(r.map(str::to_string));
        self
    }

    fn next(&self, script: &Script, counter: &AtomicU32, request: &GenerationRequest) -> Result<String, GenerationError> {
        counter.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((request.history.len(), request.feedback.is_some()));
        *self.first_history_question.lock().unwrap() =
            request.history.first().map(|t| t.question.clone());
        script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(GenerationError::EmptyResponse))
    }

    fn total_calls(&self) -> u32 {
        self.primary_calls.load(Ordering::SeqCst)
            + self.fix_calls.load(Ordering::SeqCst)
            + self.deep_calls.load(Ordering::SeqCst)
    }
}

impl CodeGenerator for ScriptedGenerator {
    fn generate<'a>(&'a self, request: &'a GenerationRequest) -> GenerationFuture<'a> {
        let result = self.next(&self.primary, &self.primary_calls, request);
        Box::pin(async move { result })
    }

    fn generate_fix<'a>(&'a self, request: &'a GenerationRequest) -> GenerationFuture<'a> {
        let result = self.next(&self.fixes, &self.fix_calls, request);
        Box::pin(async move { result })
    }

    fn deep_analysis<'a>(&'a self, request: &'a GenerationRequest) -> GenerationFuture<'a> {
        let result = self.next(&self.deep, &self.deep_calls, request);
        Box::pin(async move { result })
    }
}

/// Returns a fixed outcome per code string; unknown code raises NameError.
#[derive(Default)]
struct ScriptedExecutor {
    outcomes: HashMap<String, ExecutionOutcome>,
    executed: Vec<String>,
    closed: u32,
}

impl ScriptedExecutor {
    fn succeeds(mut self, code: &str, stdout: &str) -> Self {
        self.outcomes
            .insert(code.to_string(), ExecutionOutcome::success(stdout, ""));
        self
    }

    fn raises(mut self, code: &str, class: ExceptionClass, message: &str) -> Self {
        let outcome = ExecutionOutcome::failure(ErrorKind::RuntimeFault(class), message)
            .with_traceback(&format!("Traceback (most recent call last):\n  line 1\n{message}"), 5);
        self.outcomes.insert(code.to_string(), outcome);
        self
    }
}

impl CodeExecutor for ScriptedExecutor {
    fn execute<'a>(&'a mut self, code: &'a str) -> ExecFuture<'a> {
        self.executed.push(code.to_string());
        let outcome = self.outcomes.get(code).cloned().unwrap_or_else(|| {
            ExecutionOutcome::failure(
                ErrorKind::RuntimeFault(ExceptionClass::NameError),
                format!("name not defined in {code}"),
            )
        });
        Box::pin(async move { outcome })
    }

    fn reset(&mut self) -> BoxFuture<'_, Result<(), SandboxError>> {
        Box::pin(async { Ok(()) })
    }

    fn close_artifacts(&mut self) -> BoxFuture<'_, Result<(), SandboxError>> {
        self.closed += 1;
        Box::pin(async { Ok(()) })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["pd".into(), "np".into()]
    }
}

struct StaticExplainer {
    fail: bool,
}

impl Explainer for StaticExplainer {
    fn explain<'a>(
        &'a self,
        _question: &'a str,
        _code: &'a str,
        outcome: &'a ExecutionOutcome,
    ) -> ExplainFuture<'a> {
        let result = if self.fail {
            Err(ExplanationError::Api("OpenRouter API HTTP 503: busy".into()))
        } else {
            Ok(format!("The answer is {}", outcome.stdout().trim()))
        };
        Box::pin(async move { result })
    }
}

fn global() -> GlobalContext {
    let mut dtypes = BTreeMap::new();
    dtypes.insert("Region".to_string(), "object".to_string());
    dtypes.insert("Sales".to_string(), "object".to_string());
    GlobalContext::new(
        DatasetInfo {
            path: "sales.csv".into(),
            columns: vec!["Region".into(), "Sales".into()],
            shape: (120, 2),
            dtypes,
            preview: "Region Sales\nNorth $1,200".into(),
        },
        "Preloaded names: pd, np",
    )
}

fn recorder() -> (Arc<Mutex<Vec<String>>>, impl tally::agent::EventHandler) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let handler = FnEventHandler::new(move |event| {
        let name = match event {
            AnalysisEvent::QuestionReceived { .. } => "question".to_string(),
            AnalysisEvent::BudgetChecked(_) => "budget".to_string(),
            AnalysisEvent::HistoryCompacted { .. } => "compacted".to_string(),
            AnalysisEvent::CodeGenerated { attempt, submission } => {
                format!("code:{attempt}:{}", submission.origin())
            }
            AnalysisEvent::PolicyRejected { .. } => "rejected".to_string(),
            AnalysisEvent::ExecutionFinished { .. } => "executed".to_string(),
            AnalysisEvent::AttemptFailed { attempt, origin, .. } => {
                format!("failed:{attempt}:{origin}")
            }
            AnalysisEvent::RetryScheduled { next_attempt, .. } => format!("retry:{next_attempt}"),
            AnalysisEvent::DeepAnalysisStarted => "deep".to_string(),
            AnalysisEvent::GenerationFailed { attempt, .. } => format!("genfail:{attempt}"),
            AnalysisEvent::RetriesExhausted { .. } => "exhausted".to_string(),
            AnalysisEvent::ExplanationReady(_) => "explained".to_string(),
            AnalysisEvent::ExplanationFailed { .. } => "explain_failed".to_string(),
            AnalysisEvent::TurnRecorded(_) => "recorded".to_string(),
            AnalysisEvent::SessionSaveFailed { .. } => "save_failed".to_string(),
            AnalysisEvent::SessionFinished { .. } => "finished".to_string(),
        };
        sink.lock().unwrap().push(name);
    });
    (log, handler)
}

const PRIMARY: &str = "print(df['Sales'].sum())";
const DEEP: &str = "print(pd.to_numeric(df['Sales'].str.replace('$', '').str.replace(',', '')).sum())";
const FIX_1: &str = "print(df['Sales'].astype(float).sum())";
const FIX_2: &str = "print(df['Sales'].str.strip().astype(float).sum())";

// ── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn deep_analysis_rescues_a_failed_first_attempt() {
    let generator = Arc::new(ScriptedGenerator::default().primary(Ok(PRIMARY)).deep(Ok(DEEP)));
    let mut executor = ScriptedExecutor::default()
        .raises(PRIMARY, ExceptionClass::TypeError, "can only concatenate str")
        .succeeds(DEEP, "144000.0\n");
    let global = global();
    let (log, handler) = recorder();

    let report = {
        let mut orchestrator = Orchestrator::new(
            generator.clone(),
            &mut executor,
            &global,
            OrchestratorConfig::default(),
        )
        .with_event_handler(&handler)
        .with_explainer(Arc::new(StaticExplainer { fail: false }));
        orchestrator.analyze_question("Total sales?").await.unwrap()
    };

    assert_eq!(report.resolution, Resolution::Succeeded);
    assert_eq!(report.turn.retry_count, 0);
    assert_eq!(report.turn.code, DEEP);
    assert_eq!(report.turn.explanation, "The answer is 144000.0");
    assert_eq!(report.generator_calls, 2);
    assert_eq!(generator.fix_calls.load(Ordering::SeqCst), 0);
    assert_eq!(executor.executed, vec![PRIMARY, DEEP]);
    assert_eq!(executor.closed, 1);

    let log = log.lock().unwrap();
    let failed = log.iter().position(|e| e == "failed:1:primary").unwrap();
    let deep = log.iter().position(|e| e == "deep").unwrap();
    assert!(failed < deep, "failure surfaced before deep analysis: {log:?}");
    assert!(log.contains(&"code:1:deep analysis".to_string()));
}

#[tokio::test]
async fn exhausted_retries_fail_with_max_retry_count() {
    let generator = Arc::new(
        ScriptedGenerator::default()
            .primary(Ok(PRIMARY))
            .deep(Ok(DEEP))
            .fix(Ok(FIX_1))
            .fix(Ok(FIX_2))
            .fix(Ok("print('never used')")),
    );
    let mut executor = ScriptedExecutor::default()
        .raises(PRIMARY, ExceptionClass::TypeError, "bad operand")
        .raises(DEEP, ExceptionClass::ValueError, "could not convert")
        .raises(FIX_1, ExceptionClass::ValueError, "could not convert string to float")
        .raises(FIX_2, ExceptionClass::ValueError, "could not convert string to float: '$1,200'");
    let global = global();
    let (log, handler) = recorder();

    let report = {
        let mut orchestrator = Orchestrator::new(
            generator.clone(),
            &mut executor,
            &global,
            OrchestratorConfig::default().with_max_retries(3),
        )
        .with_event_handler(&handler);
        orchestrator.analyze_question("Total sales?").await.unwrap()
    };

    assert_eq!(report.resolution, Resolution::Failed);
    assert_eq!(report.turn.retry_count, 3);
    assert_eq!(report.turn.code, FIX_2);
    assert!(
        report
            .turn
            .outcome
            .error_message()
            .unwrap()
            .contains("'$1,200'")
    );
    // Primary, deep analysis, two fixes. The third scripted fix is never requested.
    assert_eq!(generator.total_calls(), 4);
    assert_eq!(report.generator_calls, 4);
    assert_eq!(generator.fixes.lock().unwrap().len(), 1);

    let log = log.lock().unwrap();
    let failures: Vec<_> = log.iter().filter(|e| e.starts_with("failed:")).collect();
    assert_eq!(
        failures,
        vec!["failed:1:primary", "failed:1:deep analysis", "failed:2:fix", "failed:3:fix"]
    );
    assert_eq!(log.iter().filter(|e| e.starts_with("retry:")).count(), 2);
    assert!(log.contains(&"exhausted".to_string()));
}

#[tokio::test]
async fn fix_attempts_receive_error_feedback() {
    let generator = Arc::new(
        ScriptedGenerator::default()
            .primary(Ok(PRIMARY))
            .fix(Ok(FIX_1)),
    );
    let mut executor = ScriptedExecutor::default()
        .raises(PRIMARY, ExceptionClass::KeyError, "'Sales '")
        .succeeds(FIX_1, "12.0\n");
    let global = global();

    let report = {
        let mut orchestrator = Orchestrator::new(
            generator.clone(),
            &mut executor,
            &global,
            OrchestratorConfig::default().with_deep_analysis(false),
        );
        orchestrator.analyze_question("Total sales?").await.unwrap()
    };

    assert_eq!(report.resolution, Resolution::Succeeded);
    assert_eq!(report.turn.retry_count, 1);
    assert_eq!(generator.deep_calls.load(Ordering::SeqCst), 0);
    let seen = generator.seen.lock().unwrap();
    assert_eq!(*seen, vec![(0, false), (0, true)]);
}

#[tokio::test]
async fn first_generation_failure_aborts_the_question() {
    let generator = Arc::new(
        ScriptedGenerator::default()
            .primary(Err(GenerationError::Api("OpenRouter API HTTP 401: unauthorized".into()))),
    );
    let mut executor = ScriptedExecutor::default();
    let global = global();

    let (result, turns) = {
        let mut orchestrator = Orchestrator::new(
            generator.clone(),
            &mut executor,
            &global,
            OrchestratorConfig::default(),
        );
        let result = orchestrator.analyze_question("Total sales?").await;
        (result, orchestrator.record().len())
    };

    assert!(matches!(
        result,
        Err(AnalysisError::Generation(GenerationError::Api(_)))
    ));
    assert_eq!(turns, 0);
    assert!(executor.executed.is_empty());
    assert_eq!(generator.total_calls(), 1);
}

#[tokio::test]
async fn later_generation_failure_consumes_a_slot() {
    let generator = Arc::new(
        ScriptedGenerator::default()
            .primary(Ok(PRIMARY))
            .fix(Err(GenerationError::EmptyResponse))
            .fix(Ok(FIX_2)),
    );
    let mut executor = ScriptedExecutor::default()
        .raises(PRIMARY, ExceptionClass::TypeError, "bad operand")
        .succeeds(FIX_2, "1.0\n");
    let global = global();
    let (log, handler) = recorder();

    let report = {
        let mut orchestrator = Orchestrator::new(
            generator.clone(),
            &mut executor,
            &global,
            OrchestratorConfig::default().with_deep_analysis(false),
        )
        .with_event_handler(&handler);
        orchestrator.analyze_question("Total sales?").await.unwrap()
    };

    assert_eq!(report.resolution, Resolution::Succeeded);
    assert_eq!(report.turn.retry_count, 2);
    assert_eq!(executor.executed, vec![PRIMARY, FIX_2]);
    // The failed generation still sent feedback from the primary outcome,
    // and so did the attempt after it.
    assert_eq!(generator.seen.lock().unwrap()[2], (0, true));
    assert!(log.lock().unwrap().contains(&"genfail:2".to_string()));
}

#[tokio::test]
async fn policy_violation_is_never_executed() {
    let generator = Arc::new(
        ScriptedGenerator::default()
            .primary(Ok("import os\nprint(os.listdir('.'))"))
            .fix(Ok("print(len(df))")),
    );
    let mut executor = ScriptedExecutor::default().succeeds("print(len(df))", "120\n");
    let global = global();
    let (log, handler) = recorder();

    let report = {
        let mut orchestrator = Orchestrator::new(
            generator.clone(),
            &mut executor,
            &global,
            OrchestratorConfig::default().with_deep_analysis(false),
        )
        .with_event_handler(&handler);
        orchestrator.analyze_question("How many rows?").await.unwrap()
    };

    assert_eq!(report.resolution, Resolution::Succeeded);
    assert_eq!(report.turn.retry_count, 1);
    assert_eq!(executor.executed, vec!["print(len(df))"]);
    assert!(log.lock().unwrap().contains(&"rejected".to_string()));
}

#[tokio::test]
async fn rejected_only_attempts_report_policy_violation() {
    let generator = Arc::new(
        ScriptedGenerator::default()
            .primary(Ok("eval('1+1')"))
            .fix(Ok("x = df.__class__")),
    );
    let mut executor = ScriptedExecutor::default();
    let global = global();

    let report = {
        let mut orchestrator = Orchestrator::new(
            generator,
            &mut executor,
            &global,
            OrchestratorConfig::default()
                .with_deep_analysis(false)
                .with_max_retries(2),
        );
        orchestrator.analyze_question("anything").await.unwrap()
    };

    assert_eq!(report.resolution, Resolution::Failed);
    assert_eq!(
        report.turn.outcome.error_kind(),
        Some(&ErrorKind::PolicyViolation)
    );
    assert!(executor.executed.is_empty());
}

#[tokio::test]
async fn normalized_dunder_spelling_never_reaches_the_executor() {
    let escape = "sub = ()._\u{ff3f}class_\u{ff3f}._\u{ff3f}base_\u{ff3f}._\u{ff3f}subclasses_\u{ff3f}()\nprint(sub)";
    let generator = Arc::new(
        ScriptedGenerator::default()
            .primary(Ok(escape))
            .fix(Ok("print(df.shape)")),
    );
    let mut executor = ScriptedExecutor::default().succeeds("print(df.shape)", "(120, 2)\n");
    let global = global();
    let (log, handler) = recorder();

    let report = {
        let mut orchestrator = Orchestrator::new(
            generator,
            &mut executor,
            &global,
            OrchestratorConfig::default().with_deep_analysis(false),
        )
        .with_event_handler(&handler);
        orchestrator.analyze_question("What is the shape?").await.unwrap()
    };

    assert_eq!(report.resolution, Resolution::Succeeded);
    assert_eq!(executor.executed, vec!["print(df.shape)"]);
    assert!(log.lock().unwrap().contains(&"rejected".to_string()));
}

#[tokio::test]
async fn explanation_failure_records_placeholder() {
    let generator = Arc::new(ScriptedGenerator::default().primary(Ok("print(len(df))")));
    let mut executor = ScriptedExecutor::default().succeeds("print(len(df))", "120\n");
    let global = global();
    let (log, handler) = recorder();

    let report = {
        let mut orchestrator = Orchestrator::new(
            generator,
            &mut executor,
            &global,
            OrchestratorConfig::default(),
        )
        .with_event_handler(&handler)
        .with_explainer(Arc::new(StaticExplainer { fail: true }));
        orchestrator.analyze_question("How many rows?").await.unwrap()
    };

    assert_eq!(report.resolution, Resolution::Succeeded);
    assert_eq!(report.turn.explanation, EXPLANATION_PLACEHOLDER);
    let log = log.lock().unwrap();
    assert!(log.contains(&"explain_failed".to_string()));
    assert!(log.contains(&"recorded".to_string()));
}

#[tokio::test]
async fn turns_are_saved_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("sessions"), dir.path().join("reports")).unwrap();
    let generator = Arc::new(
        ScriptedGenerator::default()
            .primary(Ok("print(len(df))"))
            .primary(Ok("print(df.columns.tolist())")),
    );
    let mut executor = ScriptedExecutor::default()
        .succeeds("print(len(df))", "120\n")
        .succeeds("print(df.columns.tolist())", "['Region', 'Sales']\n");
    let global = global();

    let summary = {
        let mut orchestrator = Orchestrator::new(
            generator,
            &mut executor,
            &global,
            OrchestratorConfig::default(),
        )
        .with_store(store)
        .with_record(SessionRecord::new(Some("sales.csv".into())).with_id("20260301_120000"));
        orchestrator.analyze_question("How many rows?").await.unwrap();
        orchestrator.analyze_question("Which columns?").await.unwrap();
        orchestrator.finish()
    };

    assert_eq!(summary.stats.total_turns, 2);
    assert_eq!(summary.stats.success_count, 2);
    let report_path = summary.report_path.unwrap();
    assert!(report_path.ends_with("20260301_120000.md"));

    let store = SessionStore::new(dir.path().join("sessions"), dir.path().join("reports")).unwrap();
    let loaded = store.load("20260301_120000").unwrap().unwrap();
    assert_eq!(loaded, summary.record);
    let indices: Vec<u32> = loaded.turns().iter().map(|t| t.index).collect();
    assert_eq!(indices, vec![1, 2]);
}

#[tokio::test]
async fn history_is_compacted_when_over_budget() {
    let mut record = SessionRecord::new(Some("sales.csv".into()));
    for i in 1..=5 {
        record
            .push_turn(ConversationTurn::new(
                i,
                format!("question {i}: we decided to group by region"),
                "totals = df.groupby('Region')['Sales'].sum()\nprint(totals)",
                ExecutionOutcome::success("North 1200\n", ""),
                "The data shows North leads.",
                0,
            ))
            .unwrap();
    }
    let generator = Arc::new(ScriptedGenerator::default().primary(Ok("print(1)")));
    let mut executor = ScriptedExecutor::default().succeeds("print(1)", "1\n");
    let global = global();
    let (log, handler) = recorder();

    let report = {
        let mut orchestrator = Orchestrator::new(
            generator.clone(),
            &mut executor,
            &global,
            OrchestratorConfig::default().with_keep_recent(3),
        )
        .with_budget(ContextBudget::new().with_max_tokens(100))
        .with_event_handler(&handler)
        .with_record(record);
        orchestrator.analyze_question("And the south?").await.unwrap()
    };

    assert!(report.compacted);
    assert_eq!(report.turn.index, 6);
    assert_eq!(generator.seen.lock().unwrap()[0].0, 4);
    assert_eq!(
        generator.first_history_question.lock().unwrap().as_deref(),
        Some(SUMMARY_MARKER)
    );
    assert!(log.lock().unwrap().contains(&"compacted".to_string()));
}

#[tokio::test]
async fn history_window_limits_uncompacted_history() {
    let mut record = SessionRecord::new(None);
    for i in 1..=5 {
        record
            .push_turn(ConversationTurn::new(
                i,
                format!("q{i}"),
                "print(1)",
                ExecutionOutcome::success("1", ""),
                "",
                0,
            ))
            .unwrap();
    }
    let generator = Arc::new(ScriptedGenerator::default().primary(Ok("print(2)")));
    let mut executor = ScriptedExecutor::default().succeeds("print(2)", "2\n");
    let global = global();

    let report = {
        let mut orchestrator = Orchestrator::new(
            generator.clone(),
            &mut executor,
            &global,
            OrchestratorConfig::default().with_history_window(2),
        )
        .with_record(record);
        orchestrator.analyze_question("q6").await.unwrap()
    };

    assert!(!report.compacted);
    assert_eq!(generator.seen.lock().unwrap()[0].0, 2);
    assert_eq!(
        generator.first_history_question.lock().unwrap().as_deref(),
        Some("q4")
    );
}
