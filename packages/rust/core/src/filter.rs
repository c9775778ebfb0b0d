//! Semantic relevance filter, run per retrieval group.

use horizon_llm::{BatchItem, ScoreRange, score_items};
use horizon_shared::Result;
use horizon_storage::{FilterDecision, FilterOutcome};
use tracing::{info, instrument};

use crate::context::{PipelineContext, StageStats};
use crate::events::PipelineStage;
use crate::pipeline::{EventSink, PipelineService, batch_progress};
use crate::prompts::{self, ArticleFields};

impl PipelineService {
    /// Score (or bypass) every eligible candidate, then mark the inclusion set.
    #[instrument(skip_all, fields(execution_id = %ctx.execution_id))]
    pub(crate) async fn filter(
        &self,
        ctx: &mut PipelineContext,
        events: &EventSink,
    ) -> Result<StageStats> {
        let mut stats = StageStats::default();
        let progress = batch_progress(events, PipelineStage::Filter);

        for query in &ctx.config.retrieval.queries {
            let filter = &query.semantic_filter;

            if !filter.enabled {
                let passed = self
                    .storage
                    .bypass_filter(&ctx.execution_id, &query.query_id)
                    .await?;
                ctx.filter.bypassed += passed;
                stats.skipped += passed;
                info!(query_id = %query.query_id, passed, "semantic filter disabled, bypassing");
                continue;
            }

            let candidates = self
                .storage
                .get_wip_articles_for_filtering(&ctx.execution_id, &query.query_id)
                .await?;
            if candidates.is_empty() {
                continue;
            }

            let items = candidates
                .iter()
                .map(|candidate| {
                    let fields = ArticleFields::from_wip(candidate);
                    let mut vars = prompts::article_vars(&fields).to_vec();
                    vars.push(("criteria", filter.criteria.as_str()));
                    BatchItem {
                        id: candidate.id.clone(),
                        system: prompts::FILTER_SYSTEM.to_string(),
                        user: prompts::render(prompts::FILTER_USER, &vars),
                    }
                })
                .collect();

            let outcomes = score_items(
                self.llm.as_ref(),
                items,
                &ctx.stages.semantic_filter,
                ScoreRange::default(),
                &progress,
                self.settings.progress_interval,
            )
            .await;

            let results: Vec<FilterOutcome> = outcomes
                .into_iter()
                .map(|outcome| FilterOutcome {
                    wip_id: outcome.id,
                    decision: match outcome.result {
                        Ok(score) => FilterDecision::Scored {
                            score: score.score,
                            reasoning: score.reasoning,
                        },
                        Err(e) => FilterDecision::Failed {
                            error: e.to_string(),
                        },
                    },
                })
                .collect();

            let counts = self
                .storage
                .apply_filter_results(&results, filter.threshold)
                .await?;
            ctx.filter.passed += counts.passed;
            ctx.filter.rejected += counts.rejected;
            ctx.filter.errors += counts.errors;
            stats.ok += counts.passed + counts.rejected;
            stats.failed += counts.errors;
            info!(
                query_id = %query.query_id,
                passed = counts.passed,
                rejected = counts.rejected,
                errors = counts.errors,
                threshold = filter.threshold,
                "semantic filter applied"
            );
        }

        ctx.included = self.storage.mark_for_inclusion(&ctx.execution_id).await?;
        Ok(stats)
    }
}
