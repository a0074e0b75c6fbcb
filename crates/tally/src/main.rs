//! Ask questions about a CSV file and get answers computed in a sandbox.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Start a session
//! tally sales.csv
//!
//! # Pick a model, allow more repair attempts, write under ./runs
//! tally sales.csv --model openai/gpt-4o-mini --max-retries 5 --output-dir runs
//!
//! # Continue an earlier session with model-written summaries
//! tally sales.csv --resume 20260301_141502_318_4f1c --compaction model
//! ```
//!
//! Type `exit`, `quit` or `q` (or press Ctrl-D) to end the session. The
//! statistics are printed and a Markdown report is written on the way out.

use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tally::agent::{
    AnalysisEvent, AnalystConfig, CompositeEventHandler, EventHandler, LlmExplainer,
    LlmGenerator, LoggingHandler, Orchestrator, SessionStore,
};
use tally::context::{BudgetStatus, CompactionStrategy, GlobalContext, build_compactor};
use tally::sandbox::{CodeExecutor, PythonSandbox, describe_capabilities};
use tally::OpenRouterClient;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Ask questions about a CSV file and get answers computed in a sandbox.
///
/// Reads the API key from the OPENROUTER_KEY environment variable.
#[derive(Parser)]
#[command(name = "tally", version)]
struct Cli {
    /// CSV file to analyse
    csv: PathBuf,

    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model for code generation and explanations
    #[arg(long)]
    model: Option<String>,

    /// Attempts per question
    #[arg(long)]
    max_retries: Option<u32>,

    /// Per-execution timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Directory for sessions, plots and reports
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Continue the session with this id
    #[arg(long)]
    resume: Option<String>,

    /// History compaction strategy (rules or model)
    #[arg(long)]
    compaction: Option<CompactionStrategy>,

    /// Skip the deep-analysis fallback after a failed first attempt
    #[arg(long)]
    no_deep_analysis: bool,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("tally=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tally=info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_config(cli: &Cli) -> Result<AnalystConfig, Box<dyn std::error::Error>> {
    let mut config = AnalystConfig::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        config = config.with_model(model);
    }
    if let Some(n) = cli.max_retries {
        config = config.with_max_retries(n);
    }
    if let Some(secs) = cli.timeout {
        config = config.with_timeout_secs(secs);
    }
    if let Some(dir) = &cli.output_dir {
        config = config.with_output_dir(dir);
    }
    if let Some(strategy) = cli.compaction {
        config = config.with_compaction(strategy);
    }
    if cli.no_deep_analysis {
        config = config.with_deep_analysis(false);
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&cli)?;
    let client = Arc::new(OpenRouterClient::new(AnalystConfig::api_key()?)?);

    std::fs::create_dir_all(config.plots_dir())?;
    let store = SessionStore::new(config.sessions_dir(), config.reports_dir())?;
    let resumed = match &cli.resume {
        Some(id) => Some(
            store
                .load(id)?
                .ok_or_else(|| format!("no session `{id}` in {}", store.sessions_dir().display()))?,
        ),
        None => None,
    };

    let mut sandbox = PythonSandbox::start(config.sandbox_config()).await?;
    let dataset = match sandbox.bind_dataset(&cli.csv).await {
        Ok(d) => d,
        Err(e) => {
            sandbox.shutdown().await;
            return Err(e.into());
        }
    };
    let global = GlobalContext::new(dataset, describe_capabilities(&sandbox.capabilities()));
    println!(
        "Loaded {} ({} rows x {} columns)",
        global.dataset.path, global.dataset.shape.0, global.dataset.shape.1
    );

    let handler = CompositeEventHandler::new()
        .with_if(cli.verbose, LoggingHandler)
        .with(ConsoleHandler);

    let summary = {
        let generator = Arc::new(LlmGenerator::from_config(client.clone(), &config));
        let explainer = Arc::new(LlmExplainer::from_config(client.clone(), &config));
        let mut orchestrator = Orchestrator::new(
            generator,
            &mut sandbox,
            &global,
            config.orchestrator_config(),
        )
        .with_budget(config.budget())
        .with_compactor(build_compactor(config.compaction, Some(client), &config.model))
        .with_explainer(explainer)
        .with_event_handler(&handler)
        .with_store(store);
        if let Some(record) = resumed {
            println!("Resuming session {} ({} turns)", record.session_id, record.len());
            orchestrator = orchestrator.with_record(record);
        }
        println!("Session {}. Ask a question, or `exit` to finish.", orchestrator.session_id());

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("\n> ");
            std::io::stdout().flush()?;
            let Some(line) = lines.next_line().await? else {
                println!();
                break;
            };
            let question = line.trim();
            if question.is_empty() {
                continue;
            }
            if matches!(question.to_lowercase().as_str(), "exit" | "quit" | "q") {
                break;
            }
            if let Err(e) = orchestrator.analyze_question(question).await {
                eprintln!("Could not answer: {e}");
            }
        }
        orchestrator.finish()
    };

    sandbox.shutdown().await;
    if summary.stats.total_turns == 0 {
        println!("No questions asked.");
    }
    Ok(())
}

// ── Terminal output ────────────────────────────────────────────────

/// Renders analysis events on stdout.
struct ConsoleHandler;

impl EventHandler for ConsoleHandler {
    fn on_event(&self, event: &AnalysisEvent<'_>) {
        match event {
            AnalysisEvent::QuestionReceived { index, .. } => {
                println!("\n── Question {index} ──────────────────────────────");
            }
            AnalysisEvent::BudgetChecked(snapshot) => {
                if matches!(snapshot.status, BudgetStatus::Warning | BudgetStatus::Critical) {
                    println!("({})", snapshot.to_log_string());
                }
            }
            AnalysisEvent::HistoryCompacted { before, after, .. } => {
                println!("(history compacted: {before} -> {after} turns)");
            }
            AnalysisEvent::CodeGenerated {
                attempt,
                submission,
            } => {
                println!(
                    "\n[attempt {attempt}, {}]\n{}",
                    submission.origin(),
                    submission.text()
                );
            }
            AnalysisEvent::PolicyRejected { violation, .. } => {
                println!("\nRejected before running: {violation}");
            }
            AnalysisEvent::ExecutionFinished { outcome, .. } => {
                if outcome.is_success() && !outcome.stdout().trim().is_empty() {
                    println!("\n{}", outcome.stdout().trim_end());
                }
            }
            AnalysisEvent::AttemptFailed { outcome, .. } => {
                if let Some(summary) = outcome.error_summary() {
                    println!("\nFailed: {summary}");
                }
            }
            AnalysisEvent::RetryScheduled {
                next_attempt,
                max_retries,
            } => {
                println!("Retrying ({next_attempt}/{max_retries})...");
            }
            AnalysisEvent::DeepAnalysisStarted => {
                println!("Running deep analysis...");
            }
            AnalysisEvent::GenerationFailed { error, .. } => {
                println!("Generation failed: {error}");
            }
            AnalysisEvent::RetriesExhausted { max_retries } => {
                println!("\nGave up after {max_retries} attempts.");
            }
            AnalysisEvent::ExplanationReady(text) => {
                println!("\n{text}");
            }
            AnalysisEvent::ExplanationFailed { error } => {
                println!("\n(explanation unavailable: {error})");
            }
            AnalysisEvent::TurnRecorded(turn) => {
                if let Some(path) = &turn.artifact_path {
                    println!("\nChart saved to {path}");
                }
            }
            AnalysisEvent::SessionSaveFailed { error } => {
                eprintln!("Warning: session not saved: {error}");
            }
            AnalysisEvent::SessionFinished { stats, report_path } => {
                println!("\n── Session statistics ──");
                println!("Questions:  {}", stats.total_turns);
                println!(
                    "Succeeded:  {} ({:.1}%)",
                    stats.success_count,
                    stats.success_rate()
                );
                println!("Failed:     {}", stats.failed_count);
                println!("Retries:    {}", stats.total_retries);
                println!("Charts:     {}", stats.artifacts);
                if let Some(path) = report_path {
                    println!("Report:     {}", path.display());
                }
            }
        }
    }
}
