//! Natural-language explanations of successful results.
//!
//! Explanation failures never fail a turn: the orchestrator records
//! [`EXPLANATION_PLACEHOLDER`](super::prompts::EXPLANATION_PLACEHOLDER)
//! instead and carries on.

use crate::agent::config::AnalystConfig;
use crate::agent::prompts;
use crate::api::retry::{RetryConfig, retry_api_call};
use crate::error::ExplanationError;
use crate::sandbox::ExecutionOutcome;
use crate::{ChatRequest, Message, OpenRouterClient};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::debug;

/// Future returned by [`Explainer::explain`].
pub type ExplainFuture<'a> = BoxFuture<'a, Result<String, ExplanationError>>;

pub trait Explainer: Send + Sync {
    fn explain<'a>(
        &'a self,
        question: &'a str,
        code: &'a str,
        outcome: &'a ExecutionOutcome,
    ) -> ExplainFuture<'a>;
}

/// [`Explainer`] over the OpenRouter chat completions API.
pub struct LlmExplainer {
    client: Arc<OpenRouterClient>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryConfig,
}

impl LlmExplainer {
    pub fn new(client: Arc<OpenRouterClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: 0.1,
            max_tokens: 4000,
            retry: RetryConfig::default(),
        }
    }

    pub fn from_config(client: Arc<OpenRouterClient>, config: &AnalystConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.explanation_max_tokens,
            retry: config.api_retry.clone(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

impl Explainer for LlmExplainer {
    fn explain<'a>(
        &'a self,
        question: &'a str,
        code: &'a str,
        outcome: &'a ExecutionOutcome,
    ) -> ExplainFuture<'a> {
        Box::pin(async move {
            let body = ChatRequest {
                model: Some(self.model.clone()),
                messages: vec![
                    Message::system(prompts::explanation_system_prompt()),
                    Message::user(prompts::explanation_prompt(question, code, outcome)),
                ],
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                ..Default::default()
            };
            let completion = retry_api_call(&self.retry, || self.client.chat(&body))
                .await
                .map_err(ExplanationError::Api)?;
            let text = completion.content.unwrap_or_default();
            if text.trim().is_empty() {
                return Err(ExplanationError::EmptyResponse);
            }
            debug!("Explanation: {} chars", text.chars().count());
            Ok(text)
        })
    }
}
