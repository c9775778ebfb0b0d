//! Stream configuration and the immutable execution snapshot.
//!
//! A [`StreamConfig`] is the live, editable configuration of a research
//! stream. Creating an execution copies it into an [`ExecutionConfig`]
//! together with the date range and report name; the pipeline only ever reads
//! the snapshot.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::{HorizonError, Result};

/// The only retrieval strategy the pipeline knows how to run.
pub const BROAD_SEARCH_STRATEGY: &str = "broad_search";

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// How candidates are retrieved: a strategy name plus its queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub queries: Vec<QueryConfig>,
}

fn default_strategy() -> String {
    BROAD_SEARCH_STRATEGY.into()
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            queries: Vec::new(),
        }
    }
}

/// One configured query; its id doubles as the retrieval group id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    pub query_id: String,
    pub query_expression: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub semantic_filter: SemanticFilterConfig,
}

fn default_source() -> String {
    "pubmed".into()
}

/// LLM relevance gate for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub criteria: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.7
}

impl Default for SemanticFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            criteria: String::new(),
            threshold: default_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// Presentation & enrichment
// ---------------------------------------------------------------------------

/// A presentation category articles are sorted into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub specific_inclusions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresentationConfig {
    #[serde(default)]
    pub categories: Vec<Category>,
}

/// A system prompt plus a user prompt with `{placeholder}` slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub system_prompt: String,
    pub user_prompt_template: String,
}

/// Custom prompts; `None` falls back to the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentPrompts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_summary: Option<PromptTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_summary: Option<PromptTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executive_summary: Option<PromptTemplate>,
}

// ---------------------------------------------------------------------------
// Per-stage LLM selection
// ---------------------------------------------------------------------------

/// Pipeline stages that call an LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmStage {
    SemanticFilter,
    ArticleSummary,
    StanceAnalysis,
    Categorization,
    CategorySummary,
    ExecutiveSummary,
}

/// Optional overrides for one stage; unset fields use pipeline defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// Fully resolved settings for one LLM stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    pub model: String,
    pub temperature: f32,
    pub max_concurrency: usize,
}

/// Settings for every LLM stage, resolved once when an execution is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStages {
    pub semantic_filter: StageSettings,
    pub article_summary: StageSettings,
    pub stance_analysis: StageSettings,
    pub categorization: StageSettings,
    pub category_summary: StageSettings,
    pub executive_summary: StageSettings,
}

// ---------------------------------------------------------------------------
// Date range
// ---------------------------------------------------------------------------

/// Inclusive publication date window for retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(HorizonError::validation(format!(
                "date range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days` days ending at `end` (inclusive).
    pub fn last_days(end: NaiveDate, days: u32) -> Self {
        let start = end - chrono::Duration::days(i64::from(days.saturating_sub(1)));
        Self { start, end }
    }
}

// ---------------------------------------------------------------------------
// Stream config & execution snapshot
// ---------------------------------------------------------------------------

/// The live configuration of a research stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub presentation: PresentationConfig,
    #[serde(default)]
    pub enrichment: EnrichmentPrompts,
    #[serde(default)]
    pub llm: BTreeMap<LlmStage, StageModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stance_analysis_prompt: Option<PromptTemplate>,
}

/// Everything one execution consumes, frozen at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub retrieval: RetrievalConfig,
    pub presentation: PresentationConfig,
    pub enrichment: EnrichmentPrompts,
    #[serde(default)]
    pub llm: BTreeMap<LlmStage, StageModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stance_analysis_prompt: Option<PromptTemplate>,
    pub date_range: DateRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_name: Option<String>,
}

impl ExecutionConfig {
    /// Copy a stream's live configuration into an execution snapshot.
    pub fn snapshot(
        stream: &StreamConfig,
        date_range: DateRange,
        report_name: Option<String>,
    ) -> Self {
        Self {
            retrieval: stream.retrieval.clone(),
            presentation: stream.presentation.clone(),
            enrichment: stream.enrichment.clone(),
            llm: stream.llm.clone(),
            stance_analysis_prompt: stream.stance_analysis_prompt.clone(),
            date_range,
            report_name,
        }
    }

    /// Reject snapshots the pipeline cannot run, before any stage writes.
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.strategy != BROAD_SEARCH_STRATEGY {
            return Err(HorizonError::config(format!(
                "unsupported retrieval strategy '{}'",
                self.retrieval.strategy
            )));
        }

        if self.retrieval.queries.is_empty() {
            return Err(HorizonError::validation(
                "execution has no configured retrieval queries",
            ));
        }

        let mut seen = HashSet::new();
        for query in &self.retrieval.queries {
            if query.query_id.trim().is_empty() {
                return Err(HorizonError::validation("query_id must not be empty"));
            }
            if !seen.insert(query.query_id.as_str()) {
                return Err(HorizonError::validation(format!(
                    "duplicate query_id '{}'",
                    query.query_id
                )));
            }
            if query.query_expression.trim().is_empty() {
                return Err(HorizonError::validation(format!(
                    "query '{}' has an empty expression",
                    query.query_id
                )));
            }
            let filter = &query.semantic_filter;
            if !(0.0..=1.0).contains(&filter.threshold) {
                return Err(HorizonError::validation(format!(
                    "query '{}' threshold {} is outside [0, 1]",
                    query.query_id, filter.threshold
                )));
            }
            if filter.enabled && filter.criteria.trim().is_empty() {
                return Err(HorizonError::validation(format!(
                    "query '{}' enables the semantic filter without criteria",
                    query.query_id
                )));
            }
        }

        if self.date_range.start > self.date_range.end {
            return Err(HorizonError::validation("date range start is after end"));
        }

        for stage in self.llm.values() {
            if stage.max_concurrency == Some(0) {
                return Err(HorizonError::validation("max_concurrency must be at least 1"));
            }
        }

        Ok(())
    }

    /// Merge per-stage overrides onto the pipeline defaults.
    pub fn resolve_stages(&self, defaults: &PipelineConfig, default_model: &str) -> ResolvedStages {
        let resolve = |stage: LlmStage| {
            let overrides = self.llm.get(&stage);
            StageSettings {
                model: overrides
                    .and_then(|o| o.model.clone())
                    .unwrap_or_else(|| default_model.to_string()),
                temperature: overrides
                    .and_then(|o| o.temperature)
                    .unwrap_or(defaults.default_temperature),
                max_concurrency: overrides
                    .and_then(|o| o.max_concurrency)
                    .unwrap_or(defaults.default_max_concurrency)
                    .max(1),
            }
        };

        ResolvedStages {
            semantic_filter: resolve(LlmStage::SemanticFilter),
            article_summary: resolve(LlmStage::ArticleSummary),
            stance_analysis: resolve(LlmStage::StanceAnalysis),
            categorization: resolve(LlmStage::Categorization),
            category_summary: resolve(LlmStage::CategorySummary),
            executive_summary: resolve(LlmStage::ExecutiveSummary),
        }
    }
}
