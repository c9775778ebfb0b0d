//! Per-run accumulator passed through every stage.

use std::collections::BTreeMap;
use std::time::Instant;

use horizon_shared::{Execution, ExecutionConfig, ResolvedStages};
use serde::Serialize;
use serde_json::Value;

use crate::events::PipelineStage;

/// Outcome counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub ok: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

impl StageStats {
    pub fn finish(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// Filter totals across all queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterTotals {
    pub passed: usize,
    pub rejected: usize,
    pub errors: usize,
    pub bypassed: usize,
}

/// Mutable state for one execution run. Created at load, dropped at the end;
/// its serialized form is what lands in the report's pipeline metrics.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineContext {
    pub execution_id: String,
    pub stream_id: String,
    pub user_id: String,
    #[serde(skip)]
    pub config: ExecutionConfig,
    #[serde(skip)]
    pub stages: ResolvedStages,
    pub report_id: Option<String>,
    /// Candidates staged per retrieval group.
    pub retrieved: BTreeMap<String, usize>,
    /// Matches reported by each source, before caps.
    pub total_available: BTreeMap<String, usize>,
    pub historical_duplicates: usize,
    pub within_duplicates: usize,
    pub filter: FilterTotals,
    pub included: usize,
    pub associations: usize,
    pub stage_stats: BTreeMap<PipelineStage, StageStats>,
    pub duration_ms: u64,
}

impl PipelineContext {
    pub fn new(execution: &Execution, stages: ResolvedStages) -> Self {
        Self {
            execution_id: execution.id.clone(),
            stream_id: execution.stream_id.clone(),
            user_id: execution.user_id.clone(),
            config: execution.config.clone(),
            stages,
            report_id: None,
            retrieved: BTreeMap::new(),
            total_available: BTreeMap::new(),
            historical_duplicates: 0,
            within_duplicates: 0,
            filter: FilterTotals::default(),
            included: 0,
            associations: 0,
            stage_stats: BTreeMap::new(),
            duration_ms: 0,
        }
    }

    pub fn total_retrieved(&self) -> usize {
        self.retrieved.values().sum()
    }

    pub fn record(&mut self, stage: PipelineStage, stats: StageStats) {
        self.stage_stats.insert(stage, stats);
    }

    pub fn metrics(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
