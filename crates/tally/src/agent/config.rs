//! Configuration for an analysis session.
//!
//! [`AnalystConfig`] carries every tunable with a working default, so an
//! empty JSON object is a valid config file. The CLI loads the file (if
//! any), then applies flag overrides through the `with_*` builders, then
//! derives the per-component configs:
//!
//! ```ignore
//! let config = AnalystConfig::load(Some(Path::new("tally.json")))?
//!     .with_model("openai/gpt-4o-mini")
//!     .with_max_retries(2);
//!
//! let sandbox = PythonSandbox::start(config.sandbox_config()).await?;
//! let budget = config.budget();
//! let orchestration = config.orchestrator_config();
//! ```

use crate::agent::orchestrator::OrchestratorConfig;
use crate::api::retry::RetryConfig;
use crate::context::budget::{ContextBudget, DEFAULT_MODEL_MAX_TOKENS, DEFAULT_THRESHOLD_RATIO};
use crate::context::compactor::CompactionStrategy;
use crate::error::ConfigError;
use crate::sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default model for code generation and explanations.
pub const DEFAULT_MODEL: &str = "z-ai/glm-4.6";

/// Environment variable holding the OpenRouter API key.
pub const API_KEY_ENV: &str = "OPENROUTER_KEY";

/// All session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalystConfig {
    // ── Model ──
    /// Model identifier. Default: [`DEFAULT_MODEL`].
    pub model: String,
    /// Sampling temperature for code generation. Default: `0.1`.
    pub temperature: f32,
    /// Max tokens per code-generation response. Default: `2000`.
    pub max_tokens: u32,
    /// Max tokens per explanation. Default: `4000`.
    pub explanation_max_tokens: u32,
    /// Run the one-shot deep analysis after a first-attempt failure. Default: `true`.
    pub deep_analysis: bool,
    /// Temperature for deep analysis. Default: `0.3`.
    pub deep_analysis_temperature: f32,
    /// Max tokens for deep analysis (reasoning included). Default: `6000`.
    pub deep_analysis_max_tokens: u32,
    /// Transport-level retries for API calls.
    pub api_retry: RetryConfig,

    // ── Orchestration ──
    /// Generation attempts per question. Default: `3`.
    pub max_retries: u32,
    /// Turns kept verbatim when compacting. Default: `3`.
    pub keep_recent: usize,
    /// Turns included in prompts when no compaction is needed. Default: `3`.
    pub history_window: usize,

    // ── Context ──
    /// Model context window in tokens. Default: `128000`.
    pub model_max_tokens: usize,
    /// Fraction of the window usable before compacting. Default: `0.7`.
    pub compaction_threshold: f64,
    /// Compaction strategy. Default: rules.
    pub compaction: CompactionStrategy,
    /// Optional instruction forwarded to the compactor.
    pub compaction_instruction: Option<String>,

    // ── Sandbox ──
    /// Python interpreter for the sandbox. Default: `"python3"`.
    pub python: String,
    /// Per-execution timeout in seconds. Default: `30`.
    pub timeout_secs: u64,
    /// Captured output cap per stream, in bytes. Default: `65536`.
    pub max_output_bytes: usize,

    // ── Output ──
    /// Root for `sessions/`, `plots/`, and `reports/`. Default: `"output"`.
    pub output_dir: PathBuf,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.1,
            max_tokens: 2000,
            explanation_max_tokens: 4000,
            deep_analysis: true,
            deep_analysis_temperature: 0.3,
            deep_analysis_max_tokens: 6000,
            api_retry: RetryConfig::with_retries(2),
            max_retries: 3,
            keep_recent: 3,
            history_window: 3,
            model_max_tokens: DEFAULT_MODEL_MAX_TOKENS,
            compaction_threshold: DEFAULT_THRESHOLD_RATIO,
            compaction: CompactionStrategy::Rules,
            compaction_instruction: None,
            python: "python3".to_string(),
            timeout_secs: 30,
            max_output_bytes: 64 * 1024,
            output_dir: PathBuf::from("output"),
        }
    }
}

impl AnalystConfig {
    /// Load from a JSON file, or return defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.compaction_threshold) || self.compaction_threshold == 0.0 {
            return Err(ConfigError::Invalid(format!(
                "compaction_threshold must be in (0, 1], got {}",
                self.compaction_threshold
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".into()));
        }
        Ok(())
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_compaction(mut self, strategy: CompactionStrategy) -> Self {
        self.compaction = strategy;
        self
    }

    pub fn with_deep_analysis(mut self, enabled: bool) -> Self {
        self.deep_analysis = enabled;
        self
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn budget(&self) -> ContextBudget {
        ContextBudget::new()
            .with_max_tokens(self.model_max_tokens)
            .with_threshold_ratio(self.compaction_threshold)
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig::default()
            .with_python(&self.python)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_max_output_bytes(self.max_output_bytes)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_retries: self.max_retries,
            keep_recent: self.keep_recent,
            history_window: self.history_window,
            deep_analysis: self.deep_analysis,
            compaction_instruction: self.compaction_instruction.clone(),
            plots_dir: Some(self.plots_dir()),
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.output_dir.join("sessions")
    }

    pub fn plots_dir(&self) -> PathBuf {
        self.output_dir.join("plots")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.output_dir.join("reports")
    }

    /// Read the API key from [`API_KEY_ENV`].
    pub fn api_key() -> Result<String, ConfigError> {
        std::env::var(API_KEY_ENV)
            .map_err(|_| ConfigError::Invalid(format!("{API_KEY_ENV} is not set")))
    }
}
