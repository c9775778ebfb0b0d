//! Curator overrides on a finished report.
//!
//! Every override is recorded on the staging row (who, when, notes) and
//! applied together with the association change in one transaction, so a
//! reset can always restore the pipeline's own verdict.

use horizon_shared::{Result, WipArticle};
use horizon_storage::{CurationAction, Storage};
use tracing::info;

/// Force a candidate into its execution's report.
pub async fn include_article(
    storage: &Storage,
    wip_article_id: &str,
    curator_id: &str,
    notes: Option<&str>,
) -> Result<WipArticle> {
    curate(storage, wip_article_id, CurationAction::Include, curator_id, notes).await
}

/// Remove a candidate from its execution's report.
pub async fn exclude_article(
    storage: &Storage,
    wip_article_id: &str,
    curator_id: &str,
    notes: Option<&str>,
) -> Result<WipArticle> {
    curate(storage, wip_article_id, CurationAction::Exclude, curator_id, notes).await
}

/// Undo any override and return to the pipeline's verdict.
pub async fn reset_curation(
    storage: &Storage,
    wip_article_id: &str,
    curator_id: &str,
) -> Result<WipArticle> {
    curate(storage, wip_article_id, CurationAction::Reset, curator_id, None).await
}

async fn curate(
    storage: &Storage,
    wip_article_id: &str,
    action: CurationAction,
    curator_id: &str,
    notes: Option<&str>,
) -> Result<WipArticle> {
    let updated = storage
        .apply_curation(wip_article_id, action, curator_id, notes)
        .await?;
    info!(
        wip_article_id,
        action = action.as_str(),
        curator_id,
        included = updated.included_in_report,
        "curation applied"
    );
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts;
    use crate::testing::*;
    use horizon_shared::{HorizonError, SemanticFilterConfig};

    /// Runs a three-article execution where the third is rejected by the filter.
    async fn finished_run() -> (std::sync::Arc<Storage>, String, String) {
        let storage = temp_storage().await;
        let config = stream_config(SemanticFilterConfig {
            enabled: true,
            criteria: "MC4R pathway".into(),
            threshold: 0.5,
        });
        let (_, execution_id) = pending_execution(&storage, &config).await;
        let articles = vec![
            article("Setmelanotide phase 3 trial", Some("10.1/a"), Some("Randomized trial.")),
            article("MC4R variants in children", Some("10.1/b"), Some("Cohort study.")),
            article("Diet-only intervention", Some("10.1/f"), Some("Diet trial.")),
        ];
        let model = ScriptedModel::new(|request| {
            if request.system == prompts::FILTER_SYSTEM {
                let score = if field(&request.user, "Title").starts_with("Diet") { 0.2 } else { 0.9 };
                return Ok(format!(r#"{{"score": {score}, "reasoning": "ok"}}"#));
            }
            if request.system == prompts::article_summary().system_prompt {
                return Ok("summary".into());
            }
            if request.system == prompts::executive_summary().system_prompt {
                return Ok("overview".into());
            }
            Err(HorizonError::Llm("unexpected prompt".into()))
        });
        let service = service(storage.clone(), articles, model);
        let events = run(&service, &execution_id).await;
        assert!(events.iter().all(|e| e.is_ok()));

        let report_id = storage
            .get_execution(&execution_id)
            .await
            .unwrap()
            .unwrap()
            .report_id
            .unwrap();
        (storage, execution_id, report_id)
    }

    fn wip_by_title<'a>(wips: &'a [WipArticle], title: &str) -> &'a WipArticle {
        wips.iter().find(|w| w.title == title).unwrap()
    }

    #[tokio::test]
    async fn overrides_move_articles_and_reset_restores_verdict() {
        let (storage, execution_id, report_id) = finished_run().await;
        let wips = storage.get_all_wip_articles(&execution_id).await.unwrap();
        let kept = wip_by_title(&wips, "Setmelanotide phase 3 trial").id.clone();
        let rejected = wip_by_title(&wips, "Diet-only intervention").id.clone();
        assert_eq!(storage.get_report_articles(&report_id, false).await.unwrap().len(), 2);

        let excluded = exclude_article(&storage, &kept, "curator-1", Some("off topic"))
            .await
            .unwrap();
        assert!(!excluded.included_in_report);
        assert!(excluded.curator_excluded);
        assert_eq!(excluded.curation_notes.as_deref(), Some("off topic"));
        assert_eq!(excluded.curated_by.as_deref(), Some("curator-1"));

        let included = include_article(&storage, &rejected, "curator-1", None).await.unwrap();
        assert!(included.included_in_report);
        assert!(included.curator_included);

        let articles = storage.get_report_articles(&report_id, false).await.unwrap();
        assert_eq!(articles.len(), 2);
        assert!(articles.iter().all(|a| a.association.wip_article_id.as_deref() != Some(kept.as_str())));
        let added = articles
            .iter()
            .find(|a| a.association.wip_article_id.as_deref() == Some(rejected.as_str()))
            .unwrap();
        assert!(added.association.curator_added);

        let restored = reset_curation(&storage, &kept, "curator-1").await.unwrap();
        assert!(restored.included_in_report);
        assert!(!restored.curator_excluded);
        let dropped = reset_curation(&storage, &rejected, "curator-1").await.unwrap();
        assert!(!dropped.included_in_report);
        assert!(!dropped.curator_included);

        let titles: Vec<String> = storage
            .get_report_articles(&report_id, false)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.article.title)
            .collect();
        assert_eq!(titles.len(), 2);
        assert!(titles.contains(&"Setmelanotide phase 3 trial".to_string()));
        assert!(titles.contains(&"MC4R variants in children".to_string()));
    }

    #[tokio::test]
    async fn unknown_candidate_is_not_found() {
        let (storage, _, _) = finished_run().await;
        let err = include_article(&storage, "missing", "curator-1", None).await.unwrap_err();
        assert_eq!(err.kind(), "NotFoundError");
    }
}
