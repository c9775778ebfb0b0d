//! Post-materialization enrichment: article summaries, stance analysis,
//! categorization, category summaries, and the executive summary.
//!
//! Each stage reads the report's associations fresh from storage, so later
//! stages see what earlier ones wrote. A failed LLM call is counted and
//! logged; only storage errors abort the pipeline.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use horizon_llm::{BatchItem, CompletionRequest, generate_items};
use horizon_shared::{Category, HorizonError, ReportArticle, Result};
use regex::Regex;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::context::{PipelineContext, StageStats};
use crate::events::PipelineStage;
use crate::pipeline::{EventSink, PipelineService, batch_progress};
use crate::prompts::{self, ArticleFields};

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

/// Per-article text budget when many articles share one prompt.
const LIST_EXCERPT_CHARS: usize = 600;

impl PipelineService {
    // -----------------------------------------------------------------------
    // 5. Article summaries
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(report_id = %report_id))]
    pub(crate) async fn summarize_articles(
        &self,
        ctx: &PipelineContext,
        report_id: &str,
        events: &EventSink,
    ) -> Result<StageStats> {
        let articles = self.storage.get_report_articles(report_id, true).await?;
        let template = ctx
            .config
            .enrichment
            .article_summary
            .clone()
            .unwrap_or_else(prompts::article_summary);

        let mut stats = StageStats::default();
        let mut items = Vec::with_capacity(articles.len());
        for entry in &articles {
            let has_abstract = entry
                .article
                .abstract_text
                .as_deref()
                .is_some_and(|text| !text.trim().is_empty());
            if !has_abstract {
                stats.skipped += 1;
                continue;
            }
            let fields = ArticleFields::from_article(&entry.article, None);
            items.push(BatchItem {
                id: entry.article.id.clone(),
                system: template.system_prompt.clone(),
                user: prompts::render(&template.user_prompt_template, &prompts::article_vars(&fields)),
            });
        }

        let progress = batch_progress(events, PipelineStage::Summaries);
        let outcomes = generate_items(
            self.llm.as_ref(),
            items,
            &ctx.stages.article_summary,
            &progress,
            self.settings.progress_interval,
        )
        .await;

        let mut summaries = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome.result {
                Ok(text) => summaries.push((outcome.id, text)),
                Err(_) => stats.failed += 1,
            }
        }
        stats.ok = self
            .storage
            .update_article_summaries(report_id, &summaries)
            .await?;
        info!(ok = stats.ok, failed = stats.failed, skipped = stats.skipped, "article summaries written");
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // 6. Stance analysis
    // -----------------------------------------------------------------------

    /// `None` when the execution has no stance prompt.
    #[instrument(skip_all, fields(report_id = %report_id))]
    pub(crate) async fn analyze_stance(
        &self,
        ctx: &PipelineContext,
        report_id: &str,
        events: &EventSink,
    ) -> Result<Option<StageStats>> {
        let Some(template) = ctx.config.stance_analysis_prompt.as_ref() else {
            return Ok(None);
        };
        let articles = self.storage.get_report_articles(report_id, true).await?;

        let mut stats = StageStats::default();
        let mut items = Vec::with_capacity(articles.len());
        for entry in &articles {
            let summary = entry
                .association
                .ai_summary
                .as_deref()
                .filter(|text| !text.trim().is_empty());
            let Some(summary) = summary else {
                stats.skipped += 1;
                continue;
            };
            let fields = ArticleFields::from_article(&entry.article, Some(summary));
            items.push(BatchItem {
                id: entry.article.id.clone(),
                system: template.system_prompt.clone(),
                user: prompts::render(&template.user_prompt_template, &prompts::article_vars(&fields)),
            });
        }

        let progress = batch_progress(events, PipelineStage::Stance);
        let outcomes = generate_items(
            self.llm.as_ref(),
            items,
            &ctx.stages.stance_analysis,
            &progress,
            self.settings.progress_interval,
        )
        .await;

        let mut analyses = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome.result {
                Ok(text) => analyses.push((outcome.id, parse_stance(&text))),
                Err(_) => stats.failed += 1,
            }
        }
        stats.ok = self
            .storage
            .update_stance_analyses(report_id, &analyses)
            .await?;
        info!(ok = stats.ok, failed = stats.failed, skipped = stats.skipped, "stance analysis written");
        Ok(Some(stats))
    }

    // -----------------------------------------------------------------------
    // 7. Categorization
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(report_id = %report_id))]
    pub(crate) async fn categorize(
        &self,
        ctx: &PipelineContext,
        report_id: &str,
        events: &EventSink,
    ) -> Result<StageStats> {
        let articles = self.storage.get_report_articles(report_id, true).await?;
        let categories = &ctx.config.presentation.categories;

        let mut stats = StageStats::default();
        if categories.is_empty() {
            stats.skipped = articles.len();
            info!("no presentation categories configured, skipping");
            return Ok(stats);
        }

        let listing = format_categories(categories);
        let items = articles
            .iter()
            .map(|entry| {
                let context = entry
                    .association
                    .ai_summary
                    .as_deref()
                    .or(entry.article.abstract_text.as_deref());
                let fields = ArticleFields::from_article(&entry.article, context);
                let mut vars = prompts::article_vars(&fields).to_vec();
                vars.push(("categories", listing.as_str()));
                BatchItem {
                    id: entry.article.id.clone(),
                    system: prompts::CATEGORIZE_SYSTEM.to_string(),
                    user: prompts::render(prompts::CATEGORIZE_USER, &vars),
                }
            })
            .collect();

        let progress = batch_progress(events, PipelineStage::Categorize);
        let outcomes = generate_items(
            self.llm.as_ref(),
            items,
            &ctx.stages.categorization,
            &progress,
            self.settings.progress_interval,
        )
        .await;

        let mut assignments = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome
                .result
                .and_then(|text| match_category(&text, categories))
            {
                Ok(category_id) => assignments.push((outcome.id, vec![category_id])),
                Err(e) => {
                    if matches!(e, HorizonError::Parse { .. }) {
                        warn!(article_id = %outcome.id, error = %e, "unusable category answer");
                    }
                    stats.failed += 1;
                }
            }
        }
        stats.ok = self.storage.update_categories(report_id, &assignments).await?;
        info!(ok = stats.ok, failed = stats.failed, "categorization written");
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // 8. Category summaries
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(report_id = %report_id))]
    pub(crate) async fn summarize_categories(
        &self,
        ctx: &PipelineContext,
        report_id: &str,
        events: &EventSink,
    ) -> Result<StageStats> {
        let articles = self.storage.get_report_articles(report_id, false).await?;
        let template = ctx
            .config
            .enrichment
            .category_summary
            .clone()
            .unwrap_or_else(prompts::category_summary);

        let mut stats = StageStats::default();
        let mut items = Vec::new();
        for category in &ctx.config.presentation.categories {
            let members: Vec<&ReportArticle> = articles
                .iter()
                .filter(|a| a.association.presentation_categories.contains(&category.id))
                .collect();
            if members.is_empty() {
                stats.skipped += 1;
                continue;
            }

            let topics = category.topics.join(", ");
            let count = members.len().to_string();
            let listing = format_article_list(&members);
            items.push(BatchItem {
                id: category.id.clone(),
                system: template.system_prompt.clone(),
                user: prompts::render(
                    &template.user_prompt_template,
                    &[
                        ("category_name", category.name.as_str()),
                        ("category_topics", topics.as_str()),
                        ("article_count", count.as_str()),
                        ("articles", listing.as_str()),
                    ],
                ),
            });
        }

        let progress = batch_progress(events, PipelineStage::CategorySummaries);
        let outcomes = generate_items(
            self.llm.as_ref(),
            items,
            &ctx.stages.category_summary,
            &progress,
            self.settings.progress_interval,
        )
        .await;

        let mut summaries = BTreeMap::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(text) => {
                    summaries.insert(outcome.id, text);
                }
                Err(_) => stats.failed += 1,
            }
        }
        if !summaries.is_empty() {
            self.storage
                .set_category_summaries(report_id, &summaries)
                .await?;
        }
        stats.ok = summaries.len();
        info!(ok = stats.ok, failed = stats.failed, skipped = stats.skipped, "category summaries written");
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // 9. Executive summary
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(report_id = %report_id))]
    pub(crate) async fn summarize_report(
        &self,
        ctx: &PipelineContext,
        report_id: &str,
        events: &EventSink,
    ) -> Result<StageStats> {
        let mut stats = StageStats::default();
        let articles = self.storage.get_report_articles(report_id, false).await?;
        if articles.is_empty() {
            stats.skipped = 1;
            info!("report has no articles, skipping executive summary");
            return Ok(stats);
        }

        let report = self
            .storage
            .get_report(report_id)
            .await?
            .ok_or_else(|| HorizonError::not_found("report", report_id))?;
        let template = ctx
            .config
            .enrichment
            .executive_summary
            .clone()
            .unwrap_or_else(prompts::executive_summary);

        let sections = ctx
            .config
            .presentation
            .categories
            .iter()
            .filter_map(|c| {
                report
                    .category_summaries
                    .get(&c.id)
                    .map(|text| format!("## {}\n{text}", c.name))
            })
            .collect::<Vec<_>>();
        let sections = if sections.is_empty() {
            "(no section summaries)".to_string()
        } else {
            sections.join("\n\n")
        };
        let members: Vec<&ReportArticle> = articles.iter().collect();
        let count = articles.len().to_string();
        let listing = format_article_list(&members);

        let request = CompletionRequest::for_stage(
            &ctx.stages.executive_summary,
            template.system_prompt,
            prompts::render(
                &template.user_prompt_template,
                &[
                    ("report_name", report.report_name.as_str()),
                    ("article_count", count.as_str()),
                    ("category_summaries", sections.as_str()),
                    ("articles", listing.as_str()),
                ],
            ),
        );

        let progress = batch_progress(events, PipelineStage::ExecutiveSummary);
        match self.llm.complete(request).await {
            Ok(text) => {
                self.storage.set_executive_summary(report_id, &text).await?;
                stats.ok = 1;
            }
            Err(e) => {
                warn!(error = %e, "executive summary failed");
                stats.failed = 1;
            }
        }
        progress(1, 1);
        Ok(stats)
    }
}

/// Accept the model's answer if it names a configured category by id or name.
pub fn match_category(response: &str, categories: &[Category]) -> Result<String> {
    let answer = response
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.' || c.is_whitespace());

    categories
        .iter()
        .find(|c| c.id.eq_ignore_ascii_case(answer))
        .or_else(|| categories.iter().find(|c| c.name.eq_ignore_ascii_case(answer)))
        .map(|c| c.id.clone())
        .ok_or_else(|| HorizonError::parse(format!("model chose unknown category '{answer}'")))
}

/// Stance responses are stored as JSON; free text is wrapped.
pub fn parse_stance(response: &str) -> Value {
    JSON_OBJECT
        .find(response)
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({ "analysis": response.trim() }))
}

fn format_categories(categories: &[Category]) -> String {
    categories
        .iter()
        .map(|c| {
            let mut line = format!("- {}: {}", c.id, c.name);
            if !c.topics.is_empty() {
                line.push_str(&format!(" (topics: {})", c.topics.join(", ")));
            }
            if !c.specific_inclusions.is_empty() {
                line.push_str(&format!(" (always include: {})", c.specific_inclusions.join(", ")));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_article_list(articles: &[&ReportArticle]) -> String {
    articles
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let article = &entry.article;
            let text = entry
                .association
                .ai_summary
                .as_deref()
                .or(article.abstract_text.as_deref())
                .unwrap_or("");
            format!(
                "{}. {} ({}, {})\n   {}",
                i + 1,
                article.title,
                article.journal.as_deref().unwrap_or("unknown journal"),
                article.publication_date,
                excerpt(text, LIST_EXCERPT_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories() -> Vec<Category> {
        vec![
            Category {
                id: "clinical".into(),
                name: "Clinical Trials".into(),
                topics: vec!["phase 3".into()],
                specific_inclusions: vec![],
            },
            Category {
                id: "mechanism".into(),
                name: "Mechanism of Action".into(),
                topics: vec![],
                specific_inclusions: vec!["MC4R signalling".into()],
            },
        ]
    }

    #[test]
    fn category_answers_match_by_id_or_name() {
        let cats = categories();
        assert_eq!(match_category("clinical", &cats).unwrap(), "clinical");
        assert_eq!(match_category(" \"Mechanism\".\n", &cats).unwrap(), "mechanism");
        assert_eq!(match_category("clinical trials", &cats).unwrap(), "clinical");
        let err = match_category("epidemiology", &cats).unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }

    #[test]
    fn stance_keeps_json_and_wraps_text() {
        let parsed = parse_stance("```json\n{\"stance\": \"supportive\", \"confidence\": 0.8}\n```");
        assert_eq!(parsed["stance"], "supportive");

        let wrapped = parse_stance("  Broadly supportive of the hypothesis. ");
        assert_eq!(wrapped["analysis"], "Broadly supportive of the hypothesis.");
    }

    #[test]
    fn category_listing_includes_topics_and_inclusions() {
        let listing = format_categories(&categories());
        assert_eq!(
            listing,
            "- clinical: Clinical Trials (topics: phase 3)\n\
             - mechanism: Mechanism of Action (always include: MC4R signalling)"
        );
    }

    #[test]
    fn excerpt_cuts_on_char_boundary() {
        assert_eq!(excerpt("naïve approach", 3), "naï...");
        assert_eq!(excerpt(" short ", 10), "short");
    }
}
