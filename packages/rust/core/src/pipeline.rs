//! End-to-end execution pipeline: retrieval → dedup → filter → report →
//! summaries → stance → categories → category summaries → executive summary.
//!
//! [`PipelineService::run_pipeline`] is lazy: nothing happens until the
//! returned stream is polled, and every call runs the stages again. Each stage
//! commits its writes before the next one starts, so dropping the stream
//! mid-run leaves everything up to the last finished stage persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures::{Stream, StreamExt};
use horizon_llm::LanguageModel;
use horizon_retrieval::SourceRegistry;
use horizon_shared::{Execution, HorizonError, PipelineConfig, Result};
use horizon_storage::Storage;
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, instrument};

use crate::context::{PipelineContext, StageStats};
use crate::events::{PipelineEvent, PipelineStage};
use crate::progress::{ProgressSink, Tracked, track_progress};

/// Where stages push their progress events.
pub(crate) type EventSink = ProgressSink<PipelineEvent>;

/// Runs executions against a storage, a set of sources, and an LLM.
pub struct PipelineService {
    pub(crate) storage: Arc<Storage>,
    pub(crate) sources: Arc<SourceRegistry>,
    pub(crate) llm: Arc<dyn LanguageModel>,
    pub(crate) settings: PipelineConfig,
    default_model: String,
    heartbeat: Duration,
    /// One lock per stream so historical dedup sees earlier runs' reports.
    /// Entries live only while a run holds or waits for them.
    stream_locks: StreamLocks,
}

impl PipelineService {
    pub fn new(
        storage: Arc<Storage>,
        sources: Arc<SourceRegistry>,
        llm: Arc<dyn LanguageModel>,
        settings: PipelineConfig,
        default_model: impl Into<String>,
    ) -> Self {
        let heartbeat = Duration::from_secs(settings.heartbeat_secs.max(1));
        Self {
            storage,
            sources,
            llm,
            settings,
            default_model: default_model.into(),
            heartbeat,
            stream_locks: StreamLocks::default(),
        }
    }

    /// Override the heartbeat interval from `[pipeline]`.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Run every stage for `execution_id`, yielding progress as it happens.
    ///
    /// On failure the stream yields an `error` event followed by the error
    /// itself. Marking the execution failed is left to the caller.
    pub fn run_pipeline(&self, execution_id: &str) -> impl Stream<Item = Result<PipelineEvent>> + '_ {
        let execution_id = execution_id.to_string();
        let heartbeat = self.heartbeat;

        stream! {
            let tracked = track_progress(|events| self.execute(execution_id, events), heartbeat);
            tokio::pin!(tracked);
            let mut stage = PipelineStage::Init;

            while let Some(item) = tracked.next().await {
                match item {
                    Tracked::Update(event) => {
                        stage = event.stage;
                        yield Ok(event);
                    }
                    Tracked::Heartbeat => yield Ok(PipelineEvent::heartbeat(stage)),
                    Tracked::Done(Ok(())) => {}
                    Tracked::Done(Err(e)) => {
                        error!(%stage, error = %e, error_type = e.kind(), "pipeline failed");
                        yield Ok(PipelineEvent::error(&e));
                        yield Err(e);
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(execution_id = %execution_id))]
    async fn execute(&self, execution_id: String, events: EventSink) -> Result<()> {
        let started = Instant::now();

        let execution = self
            .storage
            .get_execution(&execution_id)
            .await?
            .ok_or_else(|| HorizonError::not_found("execution", execution_id.clone()))?;

        let _serialized = self.stream_locks.acquire(&execution.stream_id).await;

        let mut ctx = self.prepare(&execution)?;
        self.storage.start_execution(&ctx.execution_id).await?;
        info!(
            stream_id = %ctx.stream_id,
            queries = ctx.config.retrieval.queries.len(),
            "execution started"
        );
        events.send(
            PipelineEvent::new(PipelineStage::Init, "Execution started").with_data(json!({
                "execution_id": ctx.execution_id,
                "stream_id": ctx.stream_id,
                "queries": ctx.config.retrieval.queries.len(),
                "date_range": ctx.config.date_range,
            })),
        );

        // --- 1. Retrieval ---
        events.send(PipelineEvent::new(PipelineStage::Retrieval, "Retrieving articles"));
        let t = Instant::now();
        let stats = self.retrieve(&mut ctx, &events).await?.finish(t);
        ctx.record(PipelineStage::Retrieval, stats);
        events.send(
            PipelineEvent::new(
                PipelineStage::Retrieval,
                format!("Retrieved {} candidate articles", ctx.total_retrieved()),
            )
            .with_data(json!({
                "retrieved": ctx.retrieved,
                "total_available": ctx.total_available,
            })),
        );

        // --- 2. Deduplication ---
        events.send(PipelineEvent::new(PipelineStage::Deduplicate, "Checking for duplicates"));
        let t = Instant::now();
        let stats = self.deduplicate(&mut ctx).await?.finish(t);
        ctx.record(PipelineStage::Deduplicate, stats);
        events.send(
            PipelineEvent::new(
                PipelineStage::Deduplicate,
                format!(
                    "Found {} duplicates of earlier reports and {} within this run",
                    ctx.historical_duplicates, ctx.within_duplicates
                ),
            )
            .with_data(json!({
                "historical": ctx.historical_duplicates,
                "within_execution": ctx.within_duplicates,
            })),
        );

        // --- 3. Semantic filter ---
        events.send(PipelineEvent::new(PipelineStage::Filter, "Scoring relevance"));
        let t = Instant::now();
        let stats = self.filter(&mut ctx, &events).await?.finish(t);
        ctx.record(PipelineStage::Filter, stats);
        events.send(
            PipelineEvent::new(
                PipelineStage::Filter,
                format!(
                    "{} passed, {} rejected, {} errors, {} bypassed; {} included",
                    ctx.filter.passed,
                    ctx.filter.rejected,
                    ctx.filter.errors,
                    ctx.filter.bypassed,
                    ctx.included
                ),
            )
            .with_data(json!({ "filter": ctx.filter, "included": ctx.included })),
        );

        // --- 4. Report materialization ---
        events.send(PipelineEvent::new(PipelineStage::Generate, "Creating report"));
        let t = Instant::now();
        let (report, stats) = self.materialize(&mut ctx).await?;
        ctx.record(PipelineStage::Generate, stats.finish(t));
        events.send(
            PipelineEvent::new(
                PipelineStage::Generate,
                format!("Report created with {} articles", report.associations),
            )
            .with_data(json!({
                "report_id": report.report_id,
                "associations": report.associations,
                "articles_created": report.articles_created,
                "articles_reused": report.articles_reused,
                "duplicates_skipped": report.duplicates_skipped,
            })),
        );
        let report_id = report.report_id;

        // --- 5. Article summaries ---
        events.send(PipelineEvent::new(PipelineStage::Summaries, "Summarizing articles"));
        let t = Instant::now();
        let stats = self.summarize_articles(&ctx, &report_id, &events).await?.finish(t);
        ctx.record(PipelineStage::Summaries, stats);
        events.send(stage_done(PipelineStage::Summaries, "summarized", stats));

        // --- 6. Stance analysis ---
        let t = Instant::now();
        match self.analyze_stance(&ctx, &report_id, &events).await? {
            Some(stats) => {
                let stats = stats.finish(t);
                ctx.record(PipelineStage::Stance, stats);
                events.send(stage_done(PipelineStage::Stance, "analyzed", stats));
            }
            None => events.send(PipelineEvent::new(
                PipelineStage::Stance,
                "Stance analysis not configured, skipping",
            )),
        }

        // --- 7. Categorization ---
        let t = Instant::now();
        let stats = self.categorize(&ctx, &report_id, &events).await?.finish(t);
        ctx.record(PipelineStage::Categorize, stats);
        events.send(stage_done(PipelineStage::Categorize, "categorized", stats));

        // --- 8. Category summaries ---
        let t = Instant::now();
        let stats = self.summarize_categories(&ctx, &report_id, &events).await?.finish(t);
        ctx.record(PipelineStage::CategorySummaries, stats);
        events.send(stage_done(PipelineStage::CategorySummaries, "summarized", stats));

        // --- 9. Executive summary ---
        let t = Instant::now();
        let stats = self.summarize_report(&ctx, &report_id, &events).await?.finish(t);
        ctx.record(PipelineStage::ExecutiveSummary, stats);
        events.send(stage_done(PipelineStage::ExecutiveSummary, "written", stats));

        // --- Complete ---
        ctx.duration_ms = started.elapsed().as_millis() as u64;
        let metrics = ctx.metrics();
        self.storage.set_pipeline_metrics(&report_id, &metrics).await?;
        self.storage.complete_execution(&ctx.execution_id).await?;

        info!(
            report_id = %report_id,
            articles = ctx.associations,
            elapsed_ms = ctx.duration_ms,
            "execution completed"
        );
        events.send(
            PipelineEvent::new(PipelineStage::Complete, "Pipeline complete")
                .with_data(json!({ "report_id": report_id, "metrics": metrics })),
        );
        Ok(())
    }

    /// Check the snapshot and resolve per-stage LLM settings. Nothing is
    /// written if this fails.
    fn prepare(&self, execution: &Execution) -> Result<PipelineContext> {
        execution.config.validate()?;
        for query in &execution.config.retrieval.queries {
            self.sources.get(&query.source)?;
        }
        let stages = execution
            .config
            .resolve_stages(&self.settings, &self.default_model);
        Ok(PipelineContext::new(execution, stages))
    }
}

/// Per-stream run locks, pruned as soon as no run holds or awaits one.
#[derive(Default)]
struct StreamLocks {
    slots: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl StreamLocks {
    async fn acquire(&self, stream_id: &str) -> StreamLease {
        let lock = match self.slots.lock() {
            Ok(mut slots) => slots.entry(stream_id.to_string()).or_default().clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(stream_id.to_string())
                .or_default()
                .clone(),
        };
        StreamLease {
            slots: self.slots.clone(),
            stream_id: stream_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }
}

/// Held for the duration of one run; releases and prunes on drop, including
/// when the run's stream is dropped mid-way.
struct StreamLease {
    slots: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    stream_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        // Waiters clone the Arc under this same map lock, so a count of one
        // means nobody else holds or awaits this stream.
        if slots
            .get(&self.stream_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            slots.remove(&self.stream_id);
        }
    }
}

/// Adapt the event sink to the batch helpers' `(completed, total)` callback.
pub(crate) fn batch_progress(
    events: &EventSink,
    stage: PipelineStage,
) -> impl Fn(usize, usize) + Send + Sync + '_ {
    move |completed, total| events.send(PipelineEvent::progress(stage, completed, total))
}

fn stage_done(stage: PipelineStage, verb: &str, stats: StageStats) -> PipelineEvent {
    PipelineEvent::new(
        stage,
        format!(
            "{} {verb}, {} failed, {} skipped",
            stats.ok, stats.failed, stats.skipped
        ),
    )
    .with_data(json!(stats))
}
