//! Agent runtime: the [`Orchestrator`] retry loop and its collaborators.
//!
//! - [`orchestrator::Orchestrator`]: question in, recorded turn out. Start here.
//! - [`generator`]: the [`CodeGenerator`] trait (primary, fix, and
//!   deep-analysis paths) and [`LlmGenerator`].
//! - [`explainer`]: the [`Explainer`] trait and [`LlmExplainer`].
//! - [`prompts`]: prompt text for all of the above.
//! - [`events`]: [`EventHandler`] and [`AnalysisEvent`] for observing a
//!   session. Includes [`LoggingHandler`] and [`CompositeEventHandler`].
//! - [`session`]: [`SessionRecord`], [`SessionStore`], and report export.
//! - [`config`]: [`AnalystConfig`], loaded from JSON and CLI flags.

pub mod config;
pub mod events;
pub mod explainer;
pub mod generator;
pub mod orchestrator;
pub mod prompts;
pub mod session;

pub use config::AnalystConfig;
pub use events::{
    AnalysisEvent, CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler,
    NoopHandler,
};
pub use explainer::{Explainer, LlmExplainer};
pub use generator::{
    CodeGenerator, CodeSubmission, ErrorFeedback, GenerationRequest, LlmGenerator, Origin,
    spawn_deep_analysis,
};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, QuestionReport, Resolution, SessionSummary,
};
pub use session::{ConversationTurn, SessionRecord, SessionStats, SessionStore};
