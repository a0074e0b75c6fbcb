//! Convenience re-exports for common `tally` types.
//!
//! ```ignore
//! use tally::prelude::*;
//! ```
//!
//! Covers what a program embedding the agent usually needs: the client,
//! the orchestrator and its services, the sandbox, context types, and event
//! handlers. Prompt text, worker protocol types, and compaction internals
//! stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ChatRequest, Message, OpenRouterClient, ToolDef, json_schema_for};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    AnalysisEvent, AnalystConfig, CodeGenerator, CompositeEventHandler, ConversationTurn,
    EventHandler, Explainer, FnEventHandler, LlmExplainer, LlmGenerator, LoggingHandler,
    NoopHandler, Orchestrator, OrchestratorConfig, QuestionReport, Resolution, SessionRecord,
    SessionStore,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    CompactionStrategy, Compactor, ContextBudget, DatasetInfo, GlobalContext, build_compactor,
};

// ── Sandbox ─────────────────────────────────────────────────────────
pub use crate::sandbox::{
    CodeExecutor, ErrorKind, ExecutionOutcome, PolicyEnforcer, PythonSandbox, SandboxConfig,
    Verdict, describe_capabilities,
};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{AnalysisError, ConfigError, GenerationError, SandboxError};
