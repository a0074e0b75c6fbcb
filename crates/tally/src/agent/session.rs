//! Session record, persistence, and report export.
//!
//! A session is an append-only sequence of [`ConversationTurn`]s. The
//! [`SessionStore`] writes one JSON file per session and renders a Markdown
//! report from the same record:
//!
//! ```text
//! output_dir/
//!   sessions/20260301_141502_318_4f1c.json
//!   reports/20260301_141502_318_4f1c.md
//!   plots/plot_20260301_141502_318_4f1c_1.png
//! ```
//!
//! Session ids are local time to the millisecond plus a 4-hex-digit suffix
//! that differs for every record created by one process, so two sessions
//! started together never share a file.

use crate::error::SessionError;
use crate::sandbox::ExecutionOutcome;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

static SESSION_SEQ: AtomicU32 = AtomicU32::new(0);

fn new_session_id(now: &chrono::DateTime<Local>) -> String {
    // Odd multiplier: distinct sequence numbers map to distinct suffixes
    // modulo 2^16.
    let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    let suffix = (std::process::id() ^ seq.wrapping_mul(0x9e37)) & 0xffff;
    format!("{}_{suffix:04x}", now.format("%Y%m%d_%H%M%S_%3f"))
}

// ── ConversationTurn ───────────────────────────────────────────────

/// One question/code/outcome/explanation cycle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    /// Position in the session, starting at 1.
    pub index: u32,
    /// RFC 3339 local time when the turn was recorded.
    pub timestamp: String,
    pub question: String,
    pub code: String,
    pub outcome: ExecutionOutcome,
    pub explanation: String,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

impl ConversationTurn {
    pub fn new(
        index: u32,
        question: impl Into<String>,
        code: impl Into<String>,
        outcome: ExecutionOutcome,
        explanation: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            index,
            timestamp: Local::now().to_rfc3339(),
            question: question.into(),
            code: code.into(),
            outcome,
            explanation: explanation.into(),
            retry_count,
            artifact_path: None,
        }
    }

    pub fn with_artifact_path(mut self, path: impl Into<String>) -> Self {
        self.artifact_path = Some(path.into());
        self
    }

    /// Whether this is a synthetic compaction summary.
    pub fn is_summary(&self) -> bool {
        self.question == crate::context::compactor::SUMMARY_MARKER
    }
}

// ── SessionRecord ──────────────────────────────────────────────────

/// Ordered, append-only turn history for one session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    /// RFC 3339 local time when the session started.
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_path: Option<String>,
    turns: Vec<ConversationTurn>,
}

impl SessionRecord {
    /// Start a new session keyed by the current local time.
    pub fn new(dataset_path: Option<String>) -> Self {
        let now = Local::now();
        Self {
            session_id: new_session_id(&now),
            created_at: now.to_rfc3339(),
            dataset_path,
            turns: Vec::new(),
        }
    }

    pub fn with_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Index the next appended turn must carry.
    pub fn next_index(&self) -> u32 {
        self.turns.last().map_or(1, |t| t.index + 1)
    }

    /// Append a turn. Indices must be strictly increasing.
    pub fn push_turn(&mut self, turn: ConversationTurn) -> Result<(), SessionError> {
        if let Some(last) = self.turns.last()
            && turn.index <= last.index
        {
            return Err(SessionError::IndexOrder {
                last: last.index,
                got: turn.index,
            });
        }
        self.turns.push(turn);
        Ok(())
    }

    pub fn statistics(&self) -> SessionStats {
        let success_count = self
            .turns
            .iter()
            .filter(|t| t.outcome.is_success())
            .count();
        SessionStats {
            total_turns: self.turns.len(),
            success_count,
            failed_count: self.turns.len() - success_count,
            total_retries: self.turns.iter().map(|t| t.retry_count).sum(),
            artifacts: self
                .turns
                .iter()
                .filter(|t| t.artifact_path.is_some())
                .count(),
        }
    }
}

/// End-of-session counters.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub total_turns: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub total_retries: u32,
    pub artifacts: usize,
}

impl SessionStats {
    /// Percentage of turns that succeeded, 0 for an empty session.
    pub fn success_rate(&self) -> f64 {
        if self.total_turns == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_turns as f64 * 100.0
        }
    }
}

// ── SessionStore ───────────────────────────────────────────────────

/// Writes session records and reports to disk.
pub struct SessionStore {
    sessions_dir: PathBuf,
    reports_dir: PathBuf,
}

impl SessionStore {
    /// Create a store, ensuring both directories exist.
    pub fn new(
        sessions_dir: impl Into<PathBuf>,
        reports_dir: impl Into<PathBuf>,
    ) -> Result<Self, SessionError> {
        let sessions_dir = sessions_dir.into();
        let reports_dir = reports_dir.into();
        for dir in [&sessions_dir, &reports_dir] {
            std::fs::create_dir_all(dir).map_err(|source| SessionError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            sessions_dir,
            reports_dir,
        })
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub fn save(&self, record: &SessionRecord) -> Result<PathBuf, SessionError> {
        let final_path = self.session_path(&record.session_id);
        let tmp_path = self
            .sessions_dir
            .join(format!(".{}.json.tmp", record.session_id));

        let json = serde_json::to_string_pretty(record)?;
        write_atomic(&tmp_path, &final_path, &json)?;
        debug!(
            "Saved session {} ({} turns) to {}",
            record.session_id,
            record.len(),
            final_path.display()
        );
        Ok(final_path)
    }

    /// Load a session. Returns `None` if it doesn't exist.
    pub fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path).map_err(|source| SessionError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// All readable sessions, oldest first. Malformed files are skipped.
    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, SessionError> {
        let entries = std::fs::read_dir(&self.sessions_dir).map_err(|source| SessionError::Io {
            path: self.sessions_dir.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_json = path.extension().is_some_and(|e| e == "json");
            let is_tmp = entry.file_name().to_string_lossy().starts_with('.');
            if !is_json || is_tmp {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(json) => match serde_json::from_str::<SessionRecord>(&json) {
                    Ok(r) => records.push(r),
                    Err(e) => warn!("Skipping malformed session at {}: {e}", path.display()),
                },
                Err(e) => warn!("Skipping unreadable session at {}: {e}", path.display()),
            }
        }
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(records)
    }

    /// Render the record as Markdown into `reports/{session_id}.md`.
    pub fn export_report(&self, record: &SessionRecord) -> Result<PathBuf, SessionError> {
        let final_path = self.reports_dir.join(format!("{}.md", record.session_id));
        let tmp_path = self
            .reports_dir
            .join(format!(".{}.md.tmp", record.session_id));
        write_atomic(&tmp_path, &final_path, &render_report(record))?;
        Ok(final_path)
    }
}

fn write_atomic(tmp_path: &Path, final_path: &Path, contents: &str) -> Result<(), SessionError> {
    std::fs::write(tmp_path, contents).map_err(|source| SessionError::Io {
        path: tmp_path.to_path_buf(),
        source,
    })?;
    std::fs::rename(tmp_path, final_path).map_err(|source| SessionError::Io {
        path: final_path.to_path_buf(),
        source,
    })
}

// ── Report ─────────────────────────────────────────────────────────

/// Deterministic Markdown rendering of a session.
pub fn render_report(record: &SessionRecord) -> String {
    let stats = record.statistics();
    let mut out = String::new();
    let _ = writeln!(out, "# Analysis report `{}`\n", record.session_id);
    let _ = writeln!(out, "- Started: {}", record.created_at);
    if let Some(path) = &record.dataset_path {
        let _ = writeln!(out, "- Dataset: `{path}`");
    }
    let _ = writeln!(
        out,
        "- Questions: {} ({} succeeded, {} failed, {:.0}% success)",
        stats.total_turns,
        stats.success_count,
        stats.failed_count,
        stats.success_rate()
    );
    let _ = writeln!(out, "- Retries: {}", stats.total_retries);
    let _ = writeln!(out, "- Plots: {}\n", stats.artifacts);

    for turn in record.turns() {
        let _ = writeln!(out, "## {}. {}\n", turn.index, turn.question);
        let _ = writeln!(out, "_{}_\n", turn.timestamp);
        if !turn.code.is_empty() {
            let _ = writeln!(out, "```python\n{}\n```\n", turn.code.trim_end());
        }
        if turn.outcome.is_success() {
            let stdout = turn.outcome.stdout().trim_end();
            if !stdout.is_empty() {
                let _ = writeln!(out, "**Output**\n\n```text\n{stdout}\n```\n");
            }
        } else if let Some(summary) = turn.outcome.error_summary() {
            let _ = writeln!(out, "**Failed:** {summary}\n");
        }
        if let Some(plot) = &turn.artifact_path {
            let _ = writeln!(out, "![plot]({plot})\n");
        }
        if turn.retry_count > 0 {
            let _ = writeln!(out, "_Retries: {}_\n", turn.retry_count);
        }
        if !turn.explanation.is_empty() {
            let _ = writeln!(out, "{}\n", turn.explanation.trim_end());
        }
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────────
