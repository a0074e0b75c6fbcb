//! Execution outcomes and the closed error taxonomy.
//!
//! The Python worker reports exception class *names*; they are mapped onto
//! [`ExceptionClass`] here and nowhere else, so the rest of the crate matches
//! on an enum instead of comparing strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of trailing traceback lines kept on a runtime fault.
pub const DEFAULT_TRACEBACK_LINES: usize = 5;

/// Why an execution did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "class", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected by the policy check; the code never ran.
    PolicyViolation,
    /// Failed the compile stage; the code never ran.
    SyntaxError,
    /// Exceeded the wall-clock limit. Partial output is kept.
    TimeoutError,
    /// Raised an exception while running.
    RuntimeFault(ExceptionClass),
    /// The worker process crashed or broke protocol.
    SandboxFailure,
}

impl ErrorKind {
    /// Whether the submitted code is guaranteed to have had no side effects.
    pub fn is_pre_execution(&self) -> bool {
        matches!(self, Self::PolicyViolation | Self::SyntaxError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyViolation => write!(f, "PolicyViolation"),
            Self::SyntaxError => write!(f, "SyntaxError"),
            Self::TimeoutError => write!(f, "TimeoutError"),
            Self::RuntimeFault(class) => write!(f, "{class}"),
            Self::SandboxFailure => write!(f, "SandboxFailure"),
        }
    }
}

/// Python exception classes the agent knows how to talk about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionClass {
    NameError,
    KeyError,
    TypeError,
    ValueError,
    IndexError,
    AttributeError,
    ZeroDivisionError,
    ImportError,
    MemoryError,
    RecursionError,
    AssertionError,
    Other(String),
}

impl ExceptionClass {
    /// Map a Python class name (as reported by the worker) to the enum.
    pub fn from_name(name: &str) -> Self {
        match name {
            "NameError" | "UnboundLocalError" => Self::NameError,
            "KeyError" => Self::KeyError,
            "TypeError" => Self::TypeError,
            "ValueError" => Self::ValueError,
            "IndexError" => Self::IndexError,
            "AttributeError" => Self::AttributeError,
            "ZeroDivisionError" => Self::ZeroDivisionError,
            "ImportError" | "ModuleNotFoundError" => Self::ImportError,
            "MemoryError" => Self::MemoryError,
            "RecursionError" => Self::RecursionError,
            "AssertionError" => Self::AssertionError,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ExceptionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NameError => "NameError",
            Self::KeyError => "KeyError",
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
            Self::IndexError => "IndexError",
            Self::AttributeError => "AttributeError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::ImportError => "ImportError",
            Self::MemoryError => "MemoryError",
            Self::RecursionError => "RecursionError",
            Self::AssertionError => "AssertionError",
            Self::Other(name) => name,
        };
        f.write_str(name)
    }
}

/// Result of running one piece of code in the sandbox.
///
/// Fields are private so the success/failure invariant holds by
/// construction: a failed outcome always carries a kind and a non-empty
/// message, a successful one never carries either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    success: bool,
    stdout: String,
    stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    artifact_refs: Vec<String>,
    #[serde(default)]
    elapsed_ms: u64,
}

impl ExecutionOutcome {
    pub fn success(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: stderr.into(),
            error_kind: None,
            error_message: None,
            traceback: None,
            artifact_refs: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// A failed outcome. An empty message is replaced with the kind's name.
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = kind.to_string();
        }
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            error_kind: Some(kind),
            error_message: Some(message),
            traceback: None,
            artifact_refs: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Attach partial output to a failure (or output to a success).
    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    /// Attach a traceback, keeping only its last `max_lines` lines.
    /// Ignored on successful outcomes.
    pub fn with_traceback(mut self, traceback: &str, max_lines: usize) -> Self {
        if !self.success && !traceback.trim().is_empty() {
            self.traceback = Some(truncate_traceback(traceback, max_lines));
        }
        self
    }

    pub fn with_artifact(mut self, path: impl Into<String>) -> Self {
        self.artifact_refs.push(path.into());
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn error_kind(&self) -> Option<&ErrorKind> {
        self.error_kind.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }

    pub fn artifact_refs(&self) -> &[String] {
        &self.artifact_refs
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    /// `"KeyError: 'amount'"` style one-liner, or `None` on success.
    pub fn error_summary(&self) -> Option<String> {
        match (&self.error_kind, &self.error_message) {
            (Some(kind), Some(msg)) => Some(format!("{kind}: {msg}")),
            _ => None,
        }
    }
}

/// Keep the last `max_lines` non-empty lines of a traceback.
pub fn truncate_traceback(traceback: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = traceback
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// The message shown instead of the interpreter's own when submitted code
/// tries to reach the import machinery.
pub fn import_rewrite_message(capabilities: &[String]) -> String {
    let handles = if capabilities.is_empty() {
        "(none)".to_string()
    } else {
        capabilities.join(", ")
    };
    format!(
        "Imports are not available in the sandbox. Use the preloaded names instead: \
         df (the dataset), {handles}."
    )
}
