//! Error types for the fallible edges of the crate.
//!
//! Failures of the *submitted code* are not Rust errors: they are data,
//! carried by [`ExecutionOutcome`](crate::sandbox::ExecutionOutcome) and
//! classified by [`ErrorKind`](crate::sandbox::ErrorKind). The types here
//! cover everything else: the generation and explanation services, the
//! sandbox worker process, session persistence, and configuration.

use std::path::PathBuf;
use thiserror::Error;

/// The generation service failed or produced nothing usable.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Api(String),

    #[error("generation service returned no code")]
    EmptyResponse,

    #[error("invalid tool arguments from model: {0}")]
    InvalidArguments(String),

    #[error("deep analysis task failed: {0}")]
    Join(String),
}

/// The explanation service failed. Never fatal for a turn.
#[derive(Error, Debug)]
pub enum ExplanationError {
    #[error("explanation request failed: {0}")]
    Api(String),

    #[error("explanation service returned an empty response")]
    EmptyResponse,
}

/// The sandbox worker could not be started or talked to.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to spawn sandbox worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox worker I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox protocol error: {0}")]
    Protocol(String),

    #[error("sandbox worker reported an error: {0}")]
    Worker(String),

    #[error("sandbox worker did not become ready within {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("dataset is empty: {0}")]
    EmptyDataset(PathBuf),
}

/// Session persistence failed.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize session: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("turn index {got} does not follow {last}")]
    IndexOrder { last: u32, got: u32 },
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A question could not be answered at all.
///
/// Exhausted retries are *not* an error: they produce a
/// [`Resolution::Failed`](crate::agent::Resolution::Failed) report. Only a
/// generation failure on the very first attempt aborts the question.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("code generation failed on the first attempt: {0}")]
    Generation(#[from] GenerationError),
}
