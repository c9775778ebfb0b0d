//! Stage 1: run every configured query and stage the results.

use horizon_shared::Result;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::context::{PipelineContext, StageStats};
use crate::events::{PipelineEvent, PipelineStage};
use crate::pipeline::{EventSink, PipelineService};

impl PipelineService {
    /// Each query is capped by `max_articles_per_source` and by what is left
    /// of `max_total_articles`; queries past the total cap are skipped.
    #[instrument(skip_all, fields(execution_id = %ctx.execution_id))]
    pub(crate) async fn retrieve(
        &self,
        ctx: &mut PipelineContext,
        events: &EventSink,
    ) -> Result<StageStats> {
        let mut stats = StageStats::default();
        let mut staged = 0usize;

        for query in &ctx.config.retrieval.queries {
            let remaining = self.settings.max_total_articles.saturating_sub(staged);
            if remaining == 0 {
                warn!(query_id = %query.query_id, "article cap reached, skipping query");
                stats.skipped += 1;
                continue;
            }
            let cap = self.settings.max_articles_per_source.min(remaining);

            let source = self.sources.get(&query.source)?;
            let outcome = source
                .search(&query.query_expression, &ctx.config.date_range, cap)
                .await?;
            let mut articles = outcome.articles;
            articles.truncate(cap);

            let written = self
                .storage
                .create_wip_articles(&ctx.execution_id, &query.query_id, source.id(), &articles)
                .await?;
            staged += written;
            stats.ok += written;
            ctx.retrieved.insert(query.query_id.clone(), written);
            ctx.total_available
                .insert(query.query_id.clone(), outcome.total_available);

            info!(
                query_id = %query.query_id,
                source = source.id(),
                staged = written,
                total_available = outcome.total_available,
                "query retrieved"
            );
            events.send(
                PipelineEvent::new(
                    PipelineStage::Retrieval,
                    format!(
                        "Query '{}': {written} of {} articles",
                        query.query_id, outcome.total_available
                    ),
                )
                .with_data(json!({
                    "query_id": query.query_id,
                    "source": source.id(),
                    "staged": written,
                    "total_available": outcome.total_available,
                })),
            );
        }

        Ok(stats)
    }
}
