//! Core domain types: executions, staging records, articles, reports.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HorizonError;
use crate::execution::ExecutionConfig;

/// Generate a new opaque record identifier.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// PartialDate
// ---------------------------------------------------------------------------

/// Publication date as precise as the source reports it.
///
/// The year is always known; sources frequently publish only a year or a
/// year and month, so the missing parts stay `None` instead of being padded
/// with fake values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialDate {
    pub year: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
}

impl PartialDate {
    /// Build from raw parts, dropping a day that has no month and any part
    /// that is out of range.
    pub fn from_parts(year: i32, month: Option<u32>, day: Option<u32>) -> Self {
        let month = month.filter(|m| (1..=12).contains(m));
        let day = match month {
            Some(_) => day.filter(|d| (1..=31).contains(d)),
            None => None,
        };
        Self { year, month, day }
    }
}

impl std::fmt::Display for PartialDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.month, self.day) {
            (Some(m), Some(d)) => write!(f, "{:04}-{m:02}-{d:02}", self.year),
            (Some(m), None) => write!(f, "{:04}-{m:02}", self.year),
            _ => write!(f, "{:04}", self.year),
        }
    }
}

// ---------------------------------------------------------------------------
// Retrieved article (source output)
// ---------------------------------------------------------------------------

/// One article as returned by a retrieval source, before staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedArticle {
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    pub publication_date: PartialDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

// ---------------------------------------------------------------------------
// Streams and executions
// ---------------------------------------------------------------------------

/// Lifecycle status of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = HorizonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(HorizonError::validation(format!(
                "unknown execution status '{other}'"
            ))),
        }
    }
}

/// A research stream: the live, editable configuration that executions snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub config: crate::execution::StreamConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One attempt to run a stream's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub stream_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    /// Immutable configuration snapshot taken when the execution was created.
    pub config: ExecutionConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub report_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Staging record
// ---------------------------------------------------------------------------

/// A candidate article under audit within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WipArticle {
    pub id: String,
    pub execution_id: String,
    pub retrieval_group_id: String,
    pub source_id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub journal: Option<String>,
    pub publication_date: PartialDate,
    pub pmid: Option<String>,
    pub doi: Option<String>,
    pub url: Option<String>,
    pub is_duplicate: bool,
    pub duplicate_of_id: Option<String>,
    /// `None` = not yet decided (or scoring failed), `Some(true)` = passed.
    pub passed_semantic_filter: Option<bool>,
    /// `None` with a pass means the filter was bypassed.
    pub filter_score: Option<f64>,
    pub filter_score_reason: Option<String>,
    pub included_in_report: bool,
    pub curator_included: bool,
    pub curator_excluded: bool,
    pub curation_notes: Option<String>,
    pub curated_by: Option<String>,
    pub curated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WipArticle {
    /// The verdict the pipeline reached on its own, ignoring curator overrides.
    pub fn pipeline_verdict(&self) -> bool {
        !self.is_duplicate && self.passed_semantic_filter == Some(true)
    }

    /// Project the bibliographic fields for promotion to a permanent article.
    pub fn to_retrieved(&self) -> RetrievedArticle {
        RetrievedArticle {
            title: self.title.clone(),
            authors: self.authors.clone(),
            abstract_text: self.abstract_text.clone(),
            journal: self.journal.clone(),
            publication_date: self.publication_date,
            pmid: self.pmid.clone(),
            doi: self.doi.clone(),
            url: self.url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Permanent articles, reports, associations
// ---------------------------------------------------------------------------

/// A permanent article record, shared across reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub pmid: Option<String>,
    pub doi: Option<String>,
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub journal: Option<String>,
    pub publication_date: PartialDate,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The durable output of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub stream_id: String,
    pub user_id: String,
    pub execution_id: String,
    pub report_name: String,
    pub report_date: DateTime<Utc>,
    pub executive_summary: Option<String>,
    pub original_executive_summary: Option<String>,
    /// Category id → summary text.
    pub category_summaries: BTreeMap<String, String>,
    pub original_category_summaries: BTreeMap<String, String>,
    pub pipeline_metrics: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Per-report presentation state for one article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Association {
    pub report_id: String,
    pub article_id: String,
    pub wip_article_id: Option<String>,
    pub ranking: i64,
    pub presentation_categories: Vec<String>,
    pub original_presentation_categories: Vec<String>,
    pub ai_summary: Option<String>,
    pub original_ai_summary: Option<String>,
    pub ai_enrichments: Option<serde_json::Value>,
    pub relevance_score: Option<f64>,
    pub relevance_rationale: Option<String>,
    pub is_hidden: bool,
    pub curator_added: bool,
    pub added_at: DateTime<Utc>,
}

/// An association joined with its article, as presented in a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportArticle {
    pub association: Association,
    pub article: Article,
}
