//! Report materialization: included candidates become permanent articles
//! and report associations in one transaction.

use std::cmp::Ordering;

use chrono::Utc;
use horizon_shared::{ExecutionConfig, Result, WipArticle};
use horizon_storage::{MaterializedReport, NewReport, ReportEntry};
use tracing::instrument;

use crate::context::{PipelineContext, StageStats};
use crate::pipeline::PipelineService;

impl PipelineService {
    #[instrument(skip_all, fields(execution_id = %ctx.execution_id))]
    pub(crate) async fn materialize(
        &self,
        ctx: &mut PipelineContext,
    ) -> Result<(MaterializedReport, StageStats)> {
        let included = self.storage.get_included_articles(&ctx.execution_id).await?;
        let entries = rank_entries(included);

        let header = NewReport {
            stream_id: ctx.stream_id.clone(),
            user_id: ctx.user_id.clone(),
            execution_id: ctx.execution_id.clone(),
            report_name: report_name(&ctx.config),
            report_date: Utc::now(),
        };
        let report = self
            .storage
            .create_report_with_associations(&header, &entries)
            .await?;

        ctx.report_id = Some(report.report_id.clone());
        ctx.associations = report.associations;
        let stats = StageStats {
            ok: report.associations,
            skipped: report.duplicates_skipped,
            ..Default::default()
        };
        Ok((report, stats))
    }
}

/// Configured name, or one derived from the date range.
pub fn report_name(config: &ExecutionConfig) -> String {
    match config.report_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!(
            "Report {} to {}",
            config.date_range.start, config.date_range.end
        ),
    }
}

/// Order by filter score, best first. Bypassed candidates (no score) go last
/// and ties keep retrieval order.
pub fn rank_entries(mut included: Vec<WipArticle>) -> Vec<ReportEntry> {
    included.sort_by(|a, b| match (a.filter_score, b.filter_score) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    included
        .into_iter()
        .enumerate()
        .map(|(i, wip)| ReportEntry {
            article: wip.to_retrieved(),
            ranking: i as i64 + 1,
            relevance_score: wip.filter_score,
            relevance_rationale: wip.filter_score_reason,
            wip_article_id: wip.id,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use horizon_shared::{DateRange, PartialDate, StreamConfig};

    fn wip(id: &str, score: Option<f64>) -> WipArticle {
        WipArticle {
            id: id.into(),
            execution_id: "exec".into(),
            retrieval_group_id: "q1".into(),
            source_id: "pubmed".into(),
            title: format!("Article {id}"),
            authors: vec![],
            abstract_text: None,
            journal: None,
            publication_date: PartialDate::from_parts(2025, None, None),
            pmid: None,
            doi: None,
            url: None,
            is_duplicate: false,
            duplicate_of_id: None,
            passed_semantic_filter: Some(true),
            filter_score: score,
            filter_score_reason: score.map(|s| format!("scored {s}")),
            included_in_report: true,
            curator_included: false,
            curator_excluded: false,
            curation_notes: None,
            curated_by: None,
            curated_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ranking_puts_best_scores_first_and_bypassed_last() {
        let entries = rank_entries(vec![
            wip("bypassed", None),
            wip("low", Some(0.71)),
            wip("high", Some(0.95)),
            wip("also-low", Some(0.71)),
        ]);
        let order: Vec<(&str, i64)> = entries
            .iter()
            .map(|e| (e.wip_article_id.as_str(), e.ranking))
            .collect();
        assert_eq!(
            order,
            vec![("high", 1), ("low", 2), ("also-low", 3), ("bypassed", 4)]
        );
        assert_eq!(entries[0].relevance_rationale.as_deref(), Some("scored 0.95"));
    }

    #[test]
    fn default_report_name_uses_date_range() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
        )
        .unwrap();
        let mut config = ExecutionConfig::snapshot(&StreamConfig::default(), range, None);
        assert_eq!(report_name(&config), "Report 2025-01-01 to 2025-01-07");

        config.report_name = Some("  ".into());
        assert_eq!(report_name(&config), "Report 2025-01-01 to 2025-01-07");

        config.report_name = Some("January week 1".into());
        assert_eq!(report_name(&config), "January week 1");
    }
}
