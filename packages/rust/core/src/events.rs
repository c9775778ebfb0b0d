//! Progress events yielded by the pipeline.

use chrono::{DateTime, Utc};
use horizon_shared::HorizonError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Where in the pipeline an event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Init,
    Retrieval,
    Deduplicate,
    Filter,
    Generate,
    Summaries,
    Stance,
    Categorize,
    CategorySummaries,
    ExecutiveSummary,
    Complete,
    Error,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Retrieval => "retrieval",
            Self::Deduplicate => "deduplicate",
            Self::Filter => "filter",
            Self::Generate => "generate",
            Self::Summaries => "summaries",
            Self::Stance => "stance",
            Self::Categorize => "categorize",
            Self::CategorySummaries => "category_summaries",
            Self::ExecutiveSummary => "executive_summary",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status record from a running pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub stage: PipelineStage,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    pub fn new(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            data: Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Batch progress inside a stage.
    pub fn progress(stage: PipelineStage, completed: usize, total: usize) -> Self {
        Self::new(stage, format!("{completed}/{total} processed"))
            .with_data(json!({ "completed": completed, "total": total }))
    }

    /// Liveness signal when a stage has been quiet for a while.
    pub fn heartbeat(stage: PipelineStage) -> Self {
        Self::new(stage, "still working").with_data(json!({ "heartbeat": true }))
    }

    /// Terminal event for a failed run.
    pub fn error(err: &HorizonError) -> Self {
        Self::new(PipelineStage::Error, err.to_string())
            .with_data(json!({ "error": err.to_string(), "error_type": err.kind() }))
    }

    pub fn is_heartbeat(&self) -> bool {
        self.data.get("heartbeat").and_then(Value::as_bool) == Some(true)
    }
}
