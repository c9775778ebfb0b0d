//! Bounded-concurrency batch helpers over a [`LanguageModel`].
//!
//! Both helpers fan out one completion per item, at most
//! `settings.max_concurrency` in flight, and return one [`ItemOutcome`] per
//! item in completion order. A failed item never fails the batch.
//!
//! `progress(done, total)` fires on the first completion, every
//! `interval`-th completion, and the last one.

use std::sync::LazyLock;

use futures::StreamExt;
use horizon_shared::{HorizonError, Result, StageSettings};
use regex::Regex;
use tracing::warn;

use crate::{CompletionRequest, LanguageModel};

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

/// Progress callback: `(completed, total)`.
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// One unit of work with its prompts already rendered.
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Caller's key for matching outcomes back to records.
    pub id: String,
    pub system: String,
    pub user: String,
}

/// Per-item result of a batch call.
#[derive(Debug)]
pub struct ItemOutcome<T> {
    pub id: String,
    pub result: Result<T>,
}

/// A parsed relevance score, normalized to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub score: f64,
    pub reasoning: String,
}

/// Scale the model is asked to score on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
}

impl Default for ScoreRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl ScoreRange {
    /// Clamp a raw score into the range and map it onto `[0, 1]`.
    pub fn normalize(&self, raw: f64) -> f64 {
        let span = self.max - self.min;
        if span <= 0.0 {
            return 0.0;
        }
        (raw.clamp(self.min, self.max) - self.min) / span
    }
}

/// Score every item; responses must contain a JSON object with `score` and `reasoning`.
pub async fn score_items(
    model: &dyn LanguageModel,
    items: Vec<BatchItem>,
    settings: &StageSettings,
    range: ScoreRange,
    progress: ProgressFn<'_>,
    interval: usize,
) -> Vec<ItemOutcome<Score>> {
    run_batch(model, items, settings, progress, interval, |text| {
        parse_score(&text, range)
    })
    .await
}

/// Generate free text for every item.
pub async fn generate_items(
    model: &dyn LanguageModel,
    items: Vec<BatchItem>,
    settings: &StageSettings,
    progress: ProgressFn<'_>,
    interval: usize,
) -> Vec<ItemOutcome<String>> {
    run_batch(model, items, settings, progress, interval, Ok).await
}

async fn run_batch<T, F>(
    model: &dyn LanguageModel,
    items: Vec<BatchItem>,
    settings: &StageSettings,
    progress: ProgressFn<'_>,
    interval: usize,
    parse: F,
) -> Vec<ItemOutcome<T>>
where
    F: Fn(String) -> Result<T>,
{
    let total = items.len();
    let limit = settings.max_concurrency.max(1);

    let mut completions = futures::stream::iter(items.into_iter().map(|item| {
        let BatchItem { id, system, user } = item;
        let request = CompletionRequest::for_stage(settings, system, user);
        async move { (id, model.complete(request).await) }
    }))
    .buffer_unordered(limit);

    let mut outcomes = Vec::with_capacity(total);
    let mut done = 0usize;
    while let Some((id, response)) = completions.next().await {
        done += 1;
        let result = response.and_then(&parse);
        if let Err(e) = &result {
            warn!(item = %id, error = %e, "batch item failed");
        }
        outcomes.push(ItemOutcome { id, result });

        if should_report(done, total, interval) {
            progress(done, total);
        }
    }
    outcomes
}

/// First, every `interval`-th, and last completion.
pub fn should_report(done: usize, total: usize, interval: usize) -> bool {
    done == 1 || done == total || (interval > 0 && done % interval == 0)
}

/// Extract `{"score": .., "reasoning": ..}` from a model response.
pub fn parse_score(text: &str, range: ScoreRange) -> Result<Score> {
    let json = JSON_OBJECT
        .find(text)
        .ok_or_else(|| HorizonError::parse(format!("no JSON object in score response: {}", preview(text))))?;
    let value: serde_json::Value = serde_json::from_str(json.as_str())
        .map_err(|e| HorizonError::parse(format!("invalid score JSON: {e}")))?;

    let raw = match &value["score"] {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|s| s.is_finite())
    .ok_or_else(|| HorizonError::parse("score response has no numeric `score`"))?;

    let reasoning = value["reasoning"]
        .as_str()
        .or_else(|| value["rationale"].as_str())
        .unwrap_or_default()
        .trim()
        .to_string();

    Ok(Score {
        score: range.normalize(raw),
        reasoning,
    })
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}
