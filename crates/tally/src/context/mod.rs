//! Context window management for the analysis conversation.
//!
//! Every question is sent to the model together with the dataset
//! description and some of the earlier turns. This module keeps that
//! request inside the model's window:
//!
//! 1. **[`global`]**: [`GlobalContext`] holds the dataset metadata and the
//!    sandbox capability description. It is built once per session and is
//!    never compacted.
//!
//! 2. **[`budget`]**: [`ContextBudget`] estimates the token cost of
//!    question + global context + history and reports a [`BudgetSnapshot`].
//!    Compaction is due once the total reaches 70% of the model window.
//!
//! 3. **[`compactor`]**: the [`Compactor`] trait replaces an old prefix of
//!    the history with one summary turn and keeps the last few turns
//!    verbatim. [`RuleCompactor`] is deterministic and the default;
//!    [`ModelCompactor`] asks the LLM and falls back to the rules.

pub mod budget;
pub mod compactor;
pub mod global;

pub use budget::{BudgetSnapshot, BudgetStatus, ContextBudget, estimate_tokens};
pub use compactor::{
    CompactionStrategy, Compactor, ModelCompactor, RuleCompactor, SUMMARY_MARKER, build_compactor,
};
pub use global::{DatasetInfo, GlobalContext};
