//! LLM access for the pipeline.
//!
//! Stages never talk to a provider directly: they build [`CompletionRequest`]s
//! and hand them to a [`LanguageModel`], usually through the batch helpers in
//! [`batch`] which bound concurrency and report per-item success or failure.

pub mod batch;
mod openrouter;

use async_trait::async_trait;
use horizon_shared::{Result, StageSettings};

pub use batch::{BatchItem, ItemOutcome, Score, ScoreRange, generate_items, score_items};
pub use openrouter::OpenRouterClient;

/// One chat completion: a system prompt plus a single user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// Build a request using a stage's resolved model and temperature.
    pub fn for_stage(
        settings: &StageSettings,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            model: settings.model.clone(),
            system: system.into(),
            user: user.into(),
            temperature: settings.temperature,
            max_tokens: None,
        }
    }
}

/// A text-completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Return the completion text, or an error if the call failed or came back empty.
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}
