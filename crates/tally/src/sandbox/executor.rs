//! The execution sandbox.
//!
//! [`CodeExecutor`] is the seam the orchestrator talks to; [`PythonSandbox`]
//! is the real implementation, backed by one persistent worker process per
//! session. The namespace (capability handles, restricted builtins, the
//! bound `df`) lives inside that process and persists across calls.
//!
//! Timeouts are enforced twice. The worker arms a one-shot interval timer
//! around each execution and disarms it in a `finally` block. The Rust side
//! waits at most `timeout + kill_grace` for the worker's report; if that
//! deadline passes the worker is killed and a fresh one (with the dataset
//! re-bound) is started on the next call.

use crate::context::DatasetInfo;
use crate::error::SandboxError;
use crate::sandbox::outcome::{
    DEFAULT_TRACEBACK_LINES, ErrorKind, ExceptionClass, ExecutionOutcome, import_rewrite_message,
};
use crate::sandbox::worker::{Capture, Request, RunReport, RunStage, Worker};
use futures::future::BoxFuture;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Future returned by [`CodeExecutor::execute`].
pub type ExecFuture<'a> = BoxFuture<'a, ExecutionOutcome>;

/// Runs submitted code against a session namespace.
///
/// Methods take `&mut self`: one namespace, one writer. Implementations
/// never return a Rust error from `execute`; every failure is an
/// [`ExecutionOutcome`].
pub trait CodeExecutor: Send {
    fn execute<'a>(&'a mut self, code: &'a str) -> ExecFuture<'a>;

    /// Reinitialise capability handles and builtins, keeping the dataset.
    fn reset(&mut self) -> BoxFuture<'_, Result<(), SandboxError>>;

    /// Drop any figures that were opened but never saved.
    fn close_artifacts(&mut self) -> BoxFuture<'_, Result<(), SandboxError>>;

    /// Names bound in the namespace besides `df`.
    fn capabilities(&self) -> Vec<String>;
}

/// Sandbox limits and interpreter selection.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter to launch.
    pub python: String,
    /// Wall-clock limit per execution.
    pub timeout: Duration,
    /// Extra time given to the worker to report a timeout before it is killed.
    pub kill_grace: Duration,
    /// Cap on captured stdout and on captured stderr, each.
    pub max_output_bytes: usize,
    /// Trailing traceback lines kept on a runtime fault.
    pub traceback_lines: usize,
    /// How long to wait for a new worker to import its capabilities.
    pub startup_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: "python3".into(),
            timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
            max_output_bytes: 64 * 1024,
            traceback_lines: DEFAULT_TRACEBACK_LINES,
            startup_timeout: Duration::from_secs(60),
        }
    }
}

impl SandboxConfig {
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

/// Persistent Python sandbox.
pub struct PythonSandbox {
    config: SandboxConfig,
    worker: Option<Worker>,
    dataset_path: Option<String>,
    capabilities: Vec<String>,
}

impl PythonSandbox {
    /// Create a sandbox. The worker is started lazily.
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            worker: None,
            dataset_path: None,
            capabilities: Vec::new(),
        }
    }

    /// Start the worker now instead of on first use.
    pub async fn start(config: SandboxConfig) -> Result<Self, SandboxError> {
        let mut sandbox = Self::new(config);
        sandbox.ensure_worker().await?;
        Ok(sandbox)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Load a CSV into `df` and describe it. Empty datasets are rejected.
    pub async fn bind_dataset(&mut self, path: &Path) -> Result<DatasetInfo, SandboxError> {
        let path_str = path.to_string_lossy().into_owned();
        let worker = self.ensure_worker().await?;
        let report = worker.load(&path_str).await?;
        let info = DatasetInfo {
            path: report.path,
            columns: report.columns,
            shape: (report.rows, report.cols),
            dtypes: report.dtypes,
            preview: report.preview,
        };
        if info.is_empty() {
            return Err(SandboxError::EmptyDataset(path.to_path_buf()));
        }
        info!(
            "Bound dataset {} ({} rows x {} columns)",
            info.path, info.shape.0, info.shape.1
        );
        self.dataset_path = Some(path_str);
        Ok(info)
    }

    /// Stop the worker process.
    pub async fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown(self.config.kill_grace).await;
        }
    }

    async fn ensure_worker(&mut self) -> Result<&mut Worker, SandboxError> {
        if self.worker.is_none() {
            let mut worker = Worker::spawn(&self.config.python, self.config.startup_timeout).await?;
            if let Some(path) = &self.dataset_path {
                debug!("Re-binding dataset {path} in fresh worker");
                worker.load(path).await?;
            }
            self.capabilities = worker.capabilities().to_vec();
            self.worker = Some(worker);
        }
        self.worker
            .as_mut()
            .ok_or_else(|| SandboxError::Protocol("worker unavailable".into()))
    }

    async fn discard_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.kill().await;
        }
    }

    async fn run(&mut self, code: &str) -> ExecutionOutcome {
        let started = Instant::now();
        let timeout = self.config.timeout;
        let deadline = timeout + self.config.kill_grace;
        let mut capture = Capture::new(self.config.max_output_bytes);

        let worker = match self.ensure_worker().await {
            Ok(w) => w,
            Err(e) => {
                warn!("Sandbox unavailable: {e}");
                return ExecutionOutcome::failure(ErrorKind::SandboxFailure, e.to_string());
            }
        };
        let result = tokio::time::timeout(deadline, worker.run(code, timeout, &mut capture)).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        let outcome = match result {
            Ok(Ok(report)) => {
                let (stdout, stderr) = capture.finish();
                self.outcome_from_report(report, stdout, stderr)
            }
            Ok(Err(e)) => {
                warn!("Sandbox worker failed during execution: {e}");
                self.discard_worker().await;
                let (stdout, stderr) = capture.finish();
                ExecutionOutcome::failure(ErrorKind::SandboxFailure, e.to_string())
                    .with_output(stdout, stderr)
            }
            Err(_) => {
                warn!(
                    "Sandbox worker unresponsive after {:.1}s; killing it",
                    elapsed.as_secs_f64()
                );
                self.discard_worker().await;
                let (stdout, stderr) = capture.finish();
                timeout_outcome(timeout).with_output(stdout, stderr)
            }
        };

        let outcome = if outcome.is_success() && elapsed > timeout {
            // The worker's own timer did not fire in time; the limit still holds.
            timeout_outcome(timeout).with_output(outcome.stdout(), outcome.stderr())
        } else {
            outcome
        };
        outcome.with_elapsed_ms(elapsed_ms)
    }

    fn outcome_from_report(
        &self,
        report: RunReport,
        stdout: String,
        stderr: String,
    ) -> ExecutionOutcome {
        if report.success {
            return ExecutionOutcome::success(stdout, stderr);
        }
        let message = report.error.unwrap_or_default();
        let traceback = report.traceback.unwrap_or_default();
        let outcome = match report.stage {
            RunStage::Timeout => timeout_outcome(self.config.timeout),
            RunStage::Compile => ExecutionOutcome::failure(ErrorKind::SyntaxError, message),
            RunStage::Run => {
                let class_name = report.error_type.as_deref().unwrap_or("Exception");
                let fault = if message.contains("__import__") {
                    ExecutionOutcome::failure(
                        ErrorKind::RuntimeFault(ExceptionClass::ImportError),
                        import_rewrite_message(&self.capabilities),
                    )
                } else {
                    ExecutionOutcome::failure(
                        ErrorKind::RuntimeFault(ExceptionClass::from_name(class_name)),
                        message,
                    )
                };
                fault.with_traceback(&traceback, self.config.traceback_lines)
            }
        };
        outcome.with_output(stdout, stderr)
    }
}

fn timeout_outcome(timeout: Duration) -> ExecutionOutcome {
    ExecutionOutcome::failure(
        ErrorKind::TimeoutError,
        format!(
            "execution exceeded the {}s time limit",
            timeout.as_secs_f64()
        ),
    )
}

impl CodeExecutor for PythonSandbox {
    fn execute<'a>(&'a mut self, code: &'a str) -> ExecFuture<'a> {
        Box::pin(self.run(code))
    }

    fn reset(&mut self) -> BoxFuture<'_, Result<(), SandboxError>> {
        Box::pin(async move {
            match self.worker.as_mut() {
                Some(worker) => worker.command(&Request::Reset).await,
                None => Ok(()),
            }
        })
    }

    fn close_artifacts(&mut self) -> BoxFuture<'_, Result<(), SandboxError>> {
        Box::pin(async move {
            match self.worker.as_mut() {
                Some(worker) => worker.command(&Request::CloseArtifacts).await,
                None => Ok(()),
            }
        })
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }
}
