//! Duplicate detection. Candidates are flagged, never removed, so the
//! staging table keeps a full audit trail.

use std::collections::HashMap;

use horizon_shared::{Result, WipArticle};
use tracing::{info, instrument};

use crate::context::{PipelineContext, StageStats};
use crate::pipeline::PipelineService;

impl PipelineService {
    /// Historical pass against earlier reports of the same stream, then a
    /// within-execution pass over whatever is left.
    #[instrument(skip_all, fields(execution_id = %ctx.execution_id))]
    pub(crate) async fn deduplicate(&self, ctx: &mut PipelineContext) -> Result<StageStats> {
        let historical = self
            .storage
            .find_historical_duplicates(&ctx.execution_id, &ctx.stream_id)
            .await?;
        ctx.historical_duplicates = self.storage.mark_duplicates(&historical).await?;

        let candidates = self.storage.get_all_wip_articles(&ctx.execution_id).await?;
        let remaining: Vec<&WipArticle> = candidates.iter().filter(|c| !c.is_duplicate).collect();
        let within = find_within_duplicates(&remaining);
        ctx.within_duplicates = self.storage.mark_duplicates(&within).await?;

        info!(
            historical = ctx.historical_duplicates,
            within = ctx.within_duplicates,
            "deduplication complete"
        );
        Ok(StageStats {
            ok: remaining.len() - ctx.within_duplicates,
            skipped: ctx.historical_duplicates + ctx.within_duplicates,
            ..Default::default()
        })
    }
}

/// Trimmed, lowercased key; `None` when nothing is left.
fn normalize(value: &str) -> Option<String> {
    let key = value.trim().to_lowercase();
    (!key.is_empty()).then_some(key)
}

/// Scan candidates in insertion order and pair every later duplicate with the
/// first record it matches. A DOI match wins over a title match.
pub fn find_within_duplicates(candidates: &[&WipArticle]) -> Vec<(String, String)> {
    let mut by_doi: HashMap<String, &str> = HashMap::new();
    let mut by_title: HashMap<String, &str> = HashMap::new();
    let mut pairs = Vec::new();

    for candidate in candidates {
        let doi = candidate.doi.as_deref().and_then(normalize);
        let title = normalize(&candidate.title);

        let original = doi
            .as_ref()
            .and_then(|key| by_doi.get(key))
            .or_else(|| title.as_ref().and_then(|key| by_title.get(key)));

        if let Some(original) = original {
            pairs.push((candidate.id.clone(), (*original).to_string()));
            continue;
        }

        if let Some(key) = doi {
            by_doi.insert(key, &candidate.id);
        }
        if let Some(key) = title {
            by_title.insert(key, &candidate.id);
        }
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use chrono::Utc;
    use horizon_shared::{HorizonError, PartialDate, PipelineConfig, SemanticFilterConfig};

    fn wip(id: &str, title: &str, doi: Option<&str>) -> WipArticle {
        WipArticle {
            id: id.into(),
            execution_id: "exec".into(),
            retrieval_group_id: "q1".into(),
            source_id: "pubmed".into(),
            title: title.into(),
            authors: vec![],
            abstract_text: None,
            journal: None,
            publication_date: PartialDate::from_parts(2025, None, None),
            pmid: None,
            doi: doi.map(Into::into),
            url: None,
            is_duplicate: false,
            duplicate_of_id: None,
            passed_semantic_filter: None,
            filter_score: None,
            filter_score_reason: None,
            included_in_report: false,
            curator_included: false,
            curator_excluded: false,
            curation_notes: None,
            curated_by: None,
            curated_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn doi_match_wins_over_title() {
        let a = wip("a", "Setmelanotide outcomes", Some("10.1/X"));
        let b = wip("b", "Unrelated title", None);
        let c = wip("c", "Unrelated Title", Some(" 10.1/x "));
        let pairs = find_within_duplicates(&[&a, &b, &c]);
        assert_eq!(pairs, vec![("c".to_string(), "a".to_string())]);
    }

    #[test]
    fn title_is_the_fallback() {
        let a = wip("a", "  MC4R agonists in children ", None);
        let b = wip("b", "mc4r agonists in children", Some("10.2/y"));
        let pairs = find_within_duplicates(&[&a, &b]);
        assert_eq!(pairs, vec![("b".to_string(), "a".to_string())]);
    }

    #[test]
    fn first_occurrence_is_canonical_and_empty_keys_never_match() {
        let a = wip("a", "Same", None);
        let b = wip("b", "Same", None);
        let c = wip("c", "same", None);
        let d = wip("d", "   ", Some(""));
        let e = wip("e", "", Some("  "));
        let pairs = find_within_duplicates(&[&a, &b, &c, &d, &e]);
        assert_eq!(
            pairs,
            vec![
                ("b".to_string(), "a".to_string()),
                ("c".to_string(), "a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn repeated_staging_writes_collapse_to_one_canonical_row() {
        let storage = temp_storage().await;
        let config = stream_config(SemanticFilterConfig::default());
        let (_, execution_id) = pending_execution(&storage, &config).await;

        // The same batch staged twice, e.g. by a retried retrieval
        let batch = [article("Setmelanotide phase 3 trial", Some("10.1/a"), None)];
        storage.create_wip_articles(&execution_id, "q1", "pubmed", &batch).await.unwrap();
        storage.create_wip_articles(&execution_id, "q1", "pubmed", &batch).await.unwrap();
        let staged = storage.get_all_wip_articles(&execution_id).await.unwrap();
        assert_eq!(staged.len(), 2);
        assert_ne!(staged[0].id, staged[1].id);

        let service = service(
            storage.clone(),
            vec![],
            ScriptedModel::new(|_| Err(HorizonError::Llm("no model calls expected".into()))),
        );
        let execution = storage.get_execution(&execution_id).await.unwrap().unwrap();
        let stages = execution
            .config
            .resolve_stages(&PipelineConfig::default(), "test/model");
        let mut ctx = PipelineContext::new(&execution, stages);
        let stats = service.deduplicate(&mut ctx).await.unwrap();
        assert_eq!(stats.ok, 1);
        assert_eq!(ctx.within_duplicates, 1);

        let rows = storage.get_all_wip_articles(&execution_id).await.unwrap();
        let canonical: Vec<_> = rows.iter().filter(|w| !w.is_duplicate).collect();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].id, staged[0].id);
        let twin = rows.iter().find(|w| w.is_duplicate).unwrap();
        assert_eq!(twin.id, staged[1].id);
        assert_eq!(twin.duplicate_of_id.as_deref(), Some(canonical[0].id.as_str()));
    }
}
