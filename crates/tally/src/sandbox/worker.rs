//! Child-process plumbing for the Python worker.
//!
//! The worker is started as `python3 -u -c <source>` and speaks
//! newline-delimited JSON: one [`Request`] per line on its stdin, one
//! [`WorkerEvent`] per line on its stdout. Its stderr is drained into
//! `tracing` at debug level.

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace, warn};

/// Source of the worker program.
pub const WORKER_SOURCE: &str = include_str!("worker.py");

#[derive(Serialize, Debug)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Request<'a> {
    Execute {
        code: &'a str,
        timeout: f64,
        max_output: usize,
    },
    Load {
        path: &'a str,
    },
    Reset,
    CloseArtifacts,
    Shutdown,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RunStage {
    Compile,
    Run,
    Timeout,
}

/// Final report for one `execute` request.
#[derive(Deserialize, Debug)]
pub(crate) struct RunReport {
    pub success: bool,
    pub stage: RunStage,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
}

#[derive(Deserialize, Debug)]
pub(crate) struct DatasetReport {
    pub path: String,
    pub columns: Vec<String>,
    pub rows: usize,
    pub cols: usize,
    pub dtypes: BTreeMap<String, String>,
    pub preview: String,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
pub(crate) enum WorkerEvent {
    Ready { capabilities: Vec<String> },
    Output { stream: OutputStream, data: String },
    Result(RunReport),
    Dataset(DatasetReport),
    Ok,
    Error { message: String },
}

/// Output collected during one execution, capped at a byte limit.
#[derive(Debug)]
pub(crate) struct BoundedBuffer {
    buf: String,
    limit: usize,
    truncated: bool,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, data: &str) {
        if self.truncated {
            return;
        }
        for c in data.chars() {
            if self.buf.len() + c.len_utf8() > self.limit {
                self.truncated = true;
                return;
            }
            self.buf.push(c);
        }
    }

    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    pub fn finish(self) -> String {
        if self.truncated {
            format!("{}\n[output truncated at {} bytes]", self.buf, self.limit)
        } else {
            self.buf
        }
    }
}

/// stdout/stderr buffers for a single call.
#[derive(Debug)]
pub(crate) struct Capture {
    pub stdout: BoundedBuffer,
    pub stderr: BoundedBuffer,
}

impl Capture {
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: BoundedBuffer::new(limit),
            stderr: BoundedBuffer::new(limit),
        }
    }

    /// Apply the worker's own truncation flags, stream by stream.
    pub fn note_report(&mut self, report: &RunReport) {
        if report.stdout_truncated {
            self.stdout.mark_truncated();
        }
        if report.stderr_truncated {
            self.stderr.mark_truncated();
        }
    }

    pub fn finish(self) -> (String, String) {
        (self.stdout.finish(), self.stderr.finish())
    }
}

/// A running worker process.
pub(crate) struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    capabilities: Vec<String>,
}

impl Worker {
    /// Start the interpreter and wait for its `ready` event.
    pub async fn spawn(python: &str, startup_timeout: Duration) -> Result<Self, SandboxError> {
        debug!("Starting sandbox worker with `{python}`");
        let mut child = Command::new(python)
            .arg("-u")
            .arg("-c")
            .arg(WORKER_SOURCE)
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                program: python.to_string(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Protocol("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Protocol("worker stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("sandbox worker stderr: {line}");
                }
            });
        }

        let mut worker = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            capabilities: Vec::new(),
        };

        let ready = tokio::time::timeout(startup_timeout, worker.recv())
            .await
            .map_err(|_| SandboxError::StartupTimeout(startup_timeout))??;
        match ready {
            WorkerEvent::Ready { capabilities } => {
                debug!("Sandbox worker ready; capabilities: {}", capabilities.join(", "));
                worker.capabilities = capabilities;
                Ok(worker)
            }
            other => Err(SandboxError::Protocol(format!(
                "expected ready event, got {other:?}"
            ))),
        }
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub async fn send(&mut self, request: &Request<'_>) -> Result<(), SandboxError> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| SandboxError::Protocol(format!("failed to encode request: {e}")))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Next protocol event. Lines that are not JSON events are skipped.
    pub async fn recv(&mut self) -> Result<WorkerEvent, SandboxError> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Err(SandboxError::Protocol("worker exited unexpectedly".into()));
            };
            match serde_json::from_str::<WorkerEvent>(&line) {
                Ok(event) => return Ok(event),
                Err(e) => trace!("Skipping non-protocol worker line ({e}): {line}"),
            }
        }
    }

    /// Send a request that is answered with a bare `ok`.
    pub async fn command(&mut self, request: &Request<'_>) -> Result<(), SandboxError> {
        self.send(request).await?;
        match self.recv().await? {
            WorkerEvent::Ok => Ok(()),
            WorkerEvent::Error { message } => Err(SandboxError::Worker(message)),
            other => Err(SandboxError::Protocol(format!("expected ok, got {other:?}"))),
        }
    }

    pub async fn load(&mut self, path: &str) -> Result<DatasetReport, SandboxError> {
        self.send(&Request::Load { path }).await?;
        match self.recv().await? {
            WorkerEvent::Dataset(report) => Ok(report),
            WorkerEvent::Error { message } => Err(SandboxError::Worker(message)),
            other => Err(SandboxError::Protocol(format!(
                "expected dataset event, got {other:?}"
            ))),
        }
    }

    /// Run code, streaming its output into `capture` until the final report.
    pub async fn run(
        &mut self,
        code: &str,
        timeout: Duration,
        capture: &mut Capture,
    ) -> Result<RunReport, SandboxError> {
        let max_output = capture.stdout.limit;
        self.send(&Request::Execute {
            code,
            timeout: timeout.as_secs_f64(),
            max_output,
        })
        .await?;
        loop {
            match self.recv().await? {
                WorkerEvent::Output { stream, data } => {
                    trace!("sandbox {stream:?}: {} bytes", data.len());
                    match stream {
                        OutputStream::Stdout => capture.stdout.push(&data),
                        OutputStream::Stderr => capture.stderr.push(&data),
                    }
                }
                WorkerEvent::Result(report) => {
                    capture.note_report(&report);
                    return Ok(report);
                }
                WorkerEvent::Error { message } => return Err(SandboxError::Worker(message)),
                other => {
                    return Err(SandboxError::Protocol(format!(
                        "unexpected event during execution: {other:?}"
                    )));
                }
            }
        }
    }

    /// Ask the worker to exit, killing it if it does not within `grace`.
    pub async fn shutdown(mut self, grace: Duration) {
        if self.send(&Request::Shutdown).await.is_ok() {
            if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
                debug!("Sandbox worker exited: {status}");
                return;
            }
        }
        self.kill().await;
    }

    pub async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill sandbox worker: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_buffer_truncates_on_char_boundary() {
        let mut buf = BoundedBuffer::new(5);
        buf.push("ab");
        buf.push("c\u{00e9}d");
        let out = buf.finish();
        assert!(out.starts_with("abc\u{00e9}"));
        assert!(out.contains("[output truncated at 5 bytes]"));
    }

    #[test]
    fn bounded_buffer_untouched_under_limit() {
        let mut buf = BoundedBuffer::new(64);
        buf.push("hello\n");
        assert_eq!(buf.finish(), "hello\n");
    }

    #[test]
    fn truncation_is_reported_on_the_stream_that_overflowed() {
        let line = r#"{"event":"result","success":true,"stage":"run","stdout_truncated":false,"stderr_truncated":true}"#;
        let WorkerEvent::Result(report) = serde_json::from_str::<WorkerEvent>(line).unwrap() else {
            panic!("expected a result event");
        };
        let mut capture = Capture::new(64);
        capture.stdout.push("42\n");
        capture.stderr.push("FutureWarning: ...\n");
        capture.note_report(&report);

        let (stdout, stderr) = capture.finish();
        assert_eq!(stdout, "42\n");
        assert!(stderr.contains("[output truncated at 64 bytes]"));
    }

    #[test]
    fn request_wire_format() {
        let json = serde_json::to_value(Request::Execute {
            code: "print(1)",
            timeout: 30.0,
            max_output: 10,
        })
        .unwrap();
        assert_eq!(json["op"], "execute");
        assert_eq!(json["code"], "print(1)");
        assert_eq!(
            serde_json::to_value(Request::CloseArtifacts).unwrap()["op"],
            "close_artifacts"
        );
    }

    #[test]
    fn result_event_parses() {
        let line = r#"{"event":"result","success":false,"stage":"run","error_type":"KeyError","error":"'x'","traceback":"tb","elapsed_ms":3,"stdout_truncated":false,"stderr_truncated":false}"#;
        match serde_json::from_str::<WorkerEvent>(line).unwrap() {
            WorkerEvent::Result(r) => {
                assert!(!r.success);
                assert_eq!(r.stage, RunStage::Run);
                assert_eq!(r.error_type.as_deref(), Some("KeyError"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
