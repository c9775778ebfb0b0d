//! Permanent articles, reports, and report-article associations.
//!
//! Materialization and curation each run in one transaction so the
//! `included_in_report` flag on staging rows always matches the presence of
//! an association row.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use horizon_shared::{
    Article, Association, HorizonError, Report, ReportArticle, Result, RetrievedArticle,
    WipArticle, new_id,
};
use libsql::{Connection, params};
use serde_json::Value;

use crate::wip::partial_date;
use crate::{Storage, flag, from_json, parse_ts, text, to_json};

/// Header fields for a report about to be materialized.
#[derive(Debug, Clone)]
pub struct NewReport {
    pub stream_id: String,
    pub user_id: String,
    pub execution_id: String,
    pub report_name: String,
    pub report_date: DateTime<Utc>,
}

/// One included candidate to promote into the report.
#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub wip_article_id: String,
    pub article: RetrievedArticle,
    pub ranking: i64,
    pub relevance_score: Option<f64>,
    pub relevance_rationale: Option<String>,
}

/// What a successful materialization wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializedReport {
    pub report_id: String,
    pub associations: usize,
    pub articles_created: usize,
    pub articles_reused: usize,
    /// Entries that resolved to an article already associated with this report.
    pub duplicates_skipped: usize,
}

/// A curator decision on one staging record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurationAction {
    /// Force the article into the report.
    Include,
    /// Force the article out of the report.
    Exclude,
    /// Drop any override and restore the pipeline's verdict.
    Reset,
}

impl CurationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Include => "include",
            Self::Exclude => "exclude",
            Self::Reset => "reset",
        }
    }
}

const REPORT_COLUMNS: &str = "id, stream_id, user_id, execution_id, report_name, report_date,
    executive_summary, original_executive_summary, category_summaries_json,
    original_category_summaries_json, pipeline_metrics_json, created_at";

impl Storage {
    // -----------------------------------------------------------------------
    // Materialization
    // -----------------------------------------------------------------------

    /// Create the report, promote every entry, and link the execution to the
    /// report, all in one transaction. Nothing persists if any step fails.
    pub async fn create_report_with_associations(
        &self,
        report: &NewReport,
        entries: &[ReportEntry],
    ) -> Result<MaterializedReport> {
        let conn = self.tx_connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let result = async {
            let report_id = new_id();
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO reports (id, stream_id, user_id, execution_id, report_name,
                                      report_date, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    report_id.as_str(),
                    report.stream_id.as_str(),
                    report.user_id.as_str(),
                    report.execution_id.as_str(),
                    report.report_name.as_str(),
                    report.report_date.to_rfc3339(),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

            let mut written = MaterializedReport {
                report_id: report_id.clone(),
                ..Default::default()
            };
            let mut seen = HashSet::new();

            for entry in entries {
                let (article_id, created) = find_or_create_article(&tx, &entry.article).await?;
                if created {
                    written.articles_created += 1;
                } else {
                    written.articles_reused += 1;
                }

                if !seen.insert(article_id.clone()) {
                    // Two staging rows resolved to the same permanent article
                    tx.execute(
                        "UPDATE wip_articles
                         SET is_duplicate = 1, duplicate_of_id = ?1, included_in_report = 0
                         WHERE id = ?2",
                        params![article_id.as_str(), entry.wip_article_id.as_str()],
                    )
                    .await
                    .map_err(|e| HorizonError::Storage(e.to_string()))?;
                    written.duplicates_skipped += 1;
                    continue;
                }

                tx.execute(
                    "INSERT INTO report_article_associations (
                        report_id, article_id, wip_article_id, ranking,
                        relevance_score, relevance_rationale, added_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        report_id.as_str(),
                        article_id.as_str(),
                        entry.wip_article_id.as_str(),
                        entry.ranking,
                        entry.relevance_score,
                        entry.relevance_rationale.as_deref(),
                        now.as_str()
                    ],
                )
                .await
                .map_err(|e| HorizonError::Storage(e.to_string()))?;
                written.associations += 1;
            }

            let linked = tx
                .execute(
                    "UPDATE executions SET report_id = ?1 WHERE id = ?2",
                    params![report_id.as_str(), report.execution_id.as_str()],
                )
                .await
                .map_err(|e| HorizonError::Storage(e.to_string()))?;
            if linked != 1 {
                return Err(HorizonError::not_found("execution", report.execution_id.clone()));
            }

            Ok::<_, HorizonError>(written)
        }
        .await;

        match result {
            Ok(written) => {
                tx.commit()
                    .await
                    .map_err(|e| HorizonError::Storage(e.to_string()))?;
                tracing::info!(
                    report_id = %written.report_id,
                    associations = written.associations,
                    created = written.articles_created,
                    reused = written.articles_reused,
                    "report materialized"
                );
                Ok(written)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Report reads
    // -----------------------------------------------------------------------

    pub async fn get_report(&self, id: &str) -> Result<Option<Report>> {
        self.query_report(
            &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = ?1"),
            params![id],
        )
        .await
    }

    pub async fn get_report_for_execution(&self, execution_id: &str) -> Result<Option<Report>> {
        self.query_report(
            &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE execution_id = ?1"),
            params![execution_id],
        )
        .await
    }

    /// Articles of a report ordered by ranking. Hidden associations are left
    /// out unless `include_hidden` is set.
    pub async fn get_report_articles(
        &self,
        report_id: &str,
        include_hidden: bool,
    ) -> Result<Vec<ReportArticle>> {
        let mut rows = self
            .conn
            .query(
                "SELECT ra.report_id, ra.article_id, ra.wip_article_id, ra.ranking,
                        ra.presentation_categories_json, ra.original_presentation_categories_json,
                        ra.ai_summary, ra.original_ai_summary, ra.ai_enrichments_json,
                        ra.relevance_score, ra.relevance_rationale, ra.is_hidden,
                        ra.curator_added, ra.added_at,
                        a.id, a.pmid, a.doi, a.title, a.authors_json, a.abstract, a.journal,
                        a.pub_year, a.pub_month, a.pub_day, a.url, a.created_at
                 FROM report_article_associations ra
                 JOIN articles a ON a.id = ra.article_id
                 WHERE ra.report_id = ?1 AND (?2 = 1 OR ra.is_hidden = 0)
                 ORDER BY ra.ranking, a.id",
                params![report_id, i64::from(include_hidden)],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| HorizonError::Storage(e.to_string()))? {
            results.push(ReportArticle {
                association: row_to_association(&row)?,
                article: row_to_article(&row, 14)?,
            });
        }
        Ok(results)
    }

    /// Soft-hide or unhide an article in a report.
    pub async fn set_association_hidden(
        &self,
        report_id: &str,
        article_id: &str,
        hidden: bool,
    ) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE report_article_associations SET is_hidden = ?1
                 WHERE report_id = ?2 AND article_id = ?3",
                params![i64::from(hidden), report_id, article_id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        if updated == 0 {
            return Err(HorizonError::not_found(
                "association",
                format!("{report_id}/{article_id}"),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Enrichment writes (current + original)
    // -----------------------------------------------------------------------

    /// Write per-article AI summaries. Returns rows updated.
    pub async fn update_article_summaries(
        &self,
        report_id: &str,
        summaries: &[(String, String)],
    ) -> Result<usize> {
        self.update_associations(
            "UPDATE report_article_associations SET ai_summary = ?1, original_ai_summary = ?1
             WHERE report_id = ?2 AND article_id = ?3",
            report_id,
            summaries
                .iter()
                .map(|(article_id, summary)| (article_id.as_str(), summary.clone()))
                .collect(),
        )
        .await
    }

    /// Store stance analyses under `stance_analysis` in each association's enrichments.
    pub async fn update_stance_analyses(
        &self,
        report_id: &str,
        analyses: &[(String, Value)],
    ) -> Result<usize> {
        let mut values = Vec::with_capacity(analyses.len());
        for (article_id, analysis) in analyses {
            values.push((article_id.as_str(), to_json(analysis)?));
        }
        self.update_associations(
            "UPDATE report_article_associations
             SET ai_enrichments_json = json_set(coalesce(ai_enrichments_json, '{}'),
                                                '$.stance_analysis', json(?1))
             WHERE report_id = ?2 AND article_id = ?3",
            report_id,
            values,
        )
        .await
    }

    /// Assign presentation categories to associations.
    pub async fn update_categories(
        &self,
        report_id: &str,
        categories: &[(String, Vec<String>)],
    ) -> Result<usize> {
        let mut values = Vec::with_capacity(categories.len());
        for (article_id, ids) in categories {
            values.push((article_id.as_str(), to_json(ids)?));
        }
        self.update_associations(
            "UPDATE report_article_associations
             SET presentation_categories_json = ?1, original_presentation_categories_json = ?1
             WHERE report_id = ?2 AND article_id = ?3",
            report_id,
            values,
        )
        .await
    }

    pub async fn set_category_summaries(
        &self,
        report_id: &str,
        summaries: &BTreeMap<String, String>,
    ) -> Result<()> {
        let json = to_json(summaries)?;
        self.update_report(
            "UPDATE reports
             SET category_summaries_json = ?1, original_category_summaries_json = ?1
             WHERE id = ?2",
            json,
            report_id,
        )
        .await
    }

    pub async fn set_executive_summary(&self, report_id: &str, summary: &str) -> Result<()> {
        self.update_report(
            "UPDATE reports SET executive_summary = ?1, original_executive_summary = ?1
             WHERE id = ?2",
            summary.to_string(),
            report_id,
        )
        .await
    }

    pub async fn set_pipeline_metrics(&self, report_id: &str, metrics: &Value) -> Result<()> {
        self.update_report(
            "UPDATE reports SET pipeline_metrics_json = ?1 WHERE id = ?2",
            to_json(metrics)?,
            report_id,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Curation
    // -----------------------------------------------------------------------

    /// Apply a curator decision to one staging record of a materialized
    /// execution, keeping its association in step with `included_in_report`.
    pub async fn apply_curation(
        &self,
        wip_id: &str,
        action: CurationAction,
        curator_id: &str,
        notes: Option<&str>,
    ) -> Result<WipArticle> {
        let wip = self
            .get_wip_article(wip_id)
            .await?
            .ok_or_else(|| HorizonError::not_found("wip article", wip_id))?;
        let execution = self
            .get_execution(&wip.execution_id)
            .await?
            .ok_or_else(|| HorizonError::not_found("execution", wip.execution_id.clone()))?;
        let report_id = execution.report_id.ok_or_else(|| {
            HorizonError::validation(format!(
                "execution {} has no report to curate",
                wip.execution_id
            ))
        })?;

        let (curator_included, curator_excluded, included) = match action {
            CurationAction::Include => (true, false, true),
            CurationAction::Exclude => (false, true, false),
            CurationAction::Reset => (false, false, wip.pipeline_verdict()),
        };

        let conn = self.tx_connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let result = async {
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "UPDATE wip_articles
                 SET curator_included = ?1, curator_excluded = ?2, included_in_report = ?3,
                     curation_notes = ?4, curated_by = ?5, curated_at = ?6
                 WHERE id = ?7",
                params![
                    i64::from(curator_included),
                    i64::from(curator_excluded),
                    i64::from(included),
                    notes,
                    curator_id,
                    now.as_str(),
                    wip_id
                ],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

            if included {
                ensure_association(&tx, &report_id, &wip, action == CurationAction::Include)
                    .await?;
            } else {
                tx.execute(
                    "DELETE FROM report_article_associations
                     WHERE report_id = ?1 AND wip_article_id = ?2",
                    params![report_id.as_str(), wip_id],
                )
                .await
                .map_err(|e| HorizonError::Storage(e.to_string()))?;
            }
            Ok::<_, HorizonError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| HorizonError::Storage(e.to_string()))?;
            }
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }

        tracing::info!(
            wip_id,
            report_id = %report_id,
            action = action.as_str(),
            curator = curator_id,
            "curation applied"
        );
        self.get_wip_article(wip_id)
            .await?
            .ok_or_else(|| HorizonError::not_found("wip article", wip_id))
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn query_report(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<Report>> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_report(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(HorizonError::Storage(e.to_string())),
        }
    }

    /// Run one `(value, report_id, article_id)` update per item in a single transaction.
    async fn update_associations(
        &self,
        sql: &str,
        report_id: &str,
        values: Vec<(&str, String)>,
    ) -> Result<usize> {
        if values.is_empty() {
            return Ok(0);
        }

        let conn = self.tx_connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let mut updated = 0usize;
        for (article_id, value) in values {
            match tx.execute(sql, params![value, report_id, article_id]).await {
                Ok(n) => updated += n as usize,
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(HorizonError::Storage(e.to_string()));
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        Ok(updated)
    }

    async fn update_report(&self, sql: &str, value: String, report_id: &str) -> Result<()> {
        let updated = self
            .conn
            .execute(sql, params![value, report_id])
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        if updated == 0 {
            return Err(HorizonError::not_found("report", report_id));
        }
        Ok(())
    }
}

/// Look up a permanent article by PMID, then DOI; create it when neither matches.
/// Returns the article id and whether it was created.
async fn find_or_create_article(
    conn: &Connection,
    article: &RetrievedArticle,
) -> Result<(String, bool)> {
    let pmid = article
        .pmid
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let doi = article
        .doi
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    if let Some(pmid) = pmid {
        if let Some(id) = first_id(
            conn,
            "SELECT id FROM articles WHERE trim(pmid) = ?1 ORDER BY id LIMIT 1",
            pmid,
        )
        .await?
        {
            return Ok((id, false));
        }
    }
    if let Some(doi) = doi {
        if let Some(id) = first_id(
            conn,
            "SELECT id FROM articles WHERE lower(trim(doi)) = lower(?1) ORDER BY id LIMIT 1",
            doi,
        )
        .await?
        {
            return Ok((id, false));
        }
    }

    let id = new_id();
    let date = article.publication_date;
    conn.execute(
        "INSERT INTO articles (id, pmid, doi, title, authors_json, abstract, journal,
                               pub_year, pub_month, pub_day, url, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            id.as_str(),
            pmid,
            doi,
            article.title.as_str(),
            to_json(&article.authors)?,
            article.abstract_text.as_deref(),
            article.journal.as_deref(),
            i64::from(date.year),
            date.month.map(i64::from),
            date.day.map(i64::from),
            article.url.as_deref(),
            Utc::now().to_rfc3339()
        ],
    )
    .await
    .map_err(|e| HorizonError::Storage(e.to_string()))?;
    Ok((id, true))
}

async fn first_id(conn: &Connection, sql: &str, key: &str) -> Result<Option<String>> {
    let mut rows = conn
        .query(sql, params![key])
        .await
        .map_err(|e| HorizonError::Storage(e.to_string()))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(text(&row, 0)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(HorizonError::Storage(e.to_string())),
    }
}

/// Make sure the staging record's article is visible in the report.
///
/// An association already owned by another staging record is never taken
/// over; the include is rejected so both rows keep matching their flags.
async fn ensure_association(
    conn: &Connection,
    report_id: &str,
    wip: &WipArticle,
    curator_added: bool,
) -> Result<()> {
    let (article_id, _) = find_or_create_article(conn, &wip.to_retrieved()).await?;

    let mut rows = conn
        .query(
            "SELECT wip_article_id FROM report_article_associations
             WHERE report_id = ?1 AND article_id = ?2",
            params![report_id, article_id.as_str()],
        )
        .await
        .map_err(|e| HorizonError::Storage(e.to_string()))?;
    let owner = match rows.next().await {
        Ok(Some(row)) => Some(row.get::<String>(0).ok()),
        Ok(None) => None,
        Err(e) => return Err(HorizonError::Storage(e.to_string())),
    };
    drop(rows);

    match owner {
        Some(Some(owner)) if owner == wip.id => {
            conn.execute(
                "UPDATE report_article_associations SET is_hidden = 0
                 WHERE report_id = ?1 AND article_id = ?2",
                params![report_id, article_id.as_str()],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
            return Ok(());
        }
        Some(owner) => {
            return Err(HorizonError::validation(format!(
                "article {article_id} is already in report {report_id} through staging record {}",
                owner.as_deref().unwrap_or("(none)")
            )));
        }
        None => {}
    }

    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(ranking), 0) + 1 FROM report_article_associations
             WHERE report_id = ?1",
            params![report_id],
        )
        .await
        .map_err(|e| HorizonError::Storage(e.to_string()))?;
    let ranking: i64 = match rows.next().await {
        Ok(Some(row)) => row.get::<i64>(0).unwrap_or(1),
        _ => 1,
    };

    conn.execute(
        "INSERT INTO report_article_associations (
            report_id, article_id, wip_article_id, ranking, relevance_score,
            relevance_rationale, curator_added, added_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            report_id,
            article_id.as_str(),
            wip.id.as_str(),
            ranking,
            wip.filter_score,
            wip.filter_score_reason.as_deref(),
            i64::from(curator_added),
            Utc::now().to_rfc3339()
        ],
    )
    .await
    .map_err(|e| HorizonError::Storage(e.to_string()))?;
    Ok(())
}

fn row_to_report(row: &libsql::Row) -> Result<Report> {
    Ok(Report {
        id: text(row, 0)?,
        stream_id: text(row, 1)?,
        user_id: text(row, 2)?,
        execution_id: text(row, 3)?,
        report_name: text(row, 4)?,
        report_date: parse_ts(&text(row, 5)?)?,
        executive_summary: row.get::<String>(6).ok(),
        original_executive_summary: row.get::<String>(7).ok(),
        category_summaries: from_json(&text(row, 8)?)?,
        original_category_summaries: from_json(&text(row, 9)?)?,
        pipeline_metrics: row
            .get::<String>(10)
            .ok()
            .map(|s| from_json(&s))
            .transpose()?,
        created_at: parse_ts(&text(row, 11)?)?,
    })
}

fn row_to_association(row: &libsql::Row) -> Result<Association> {
    Ok(Association {
        report_id: text(row, 0)?,
        article_id: text(row, 1)?,
        wip_article_id: row.get::<String>(2).ok(),
        ranking: row
            .get::<i64>(3)
            .map_err(|e| HorizonError::Storage(e.to_string()))?,
        presentation_categories: from_json(&text(row, 4)?)?,
        original_presentation_categories: from_json(&text(row, 5)?)?,
        ai_summary: row.get::<String>(6).ok(),
        original_ai_summary: row.get::<String>(7).ok(),
        ai_enrichments: row
            .get::<String>(8)
            .ok()
            .map(|s| from_json(&s))
            .transpose()?,
        relevance_score: row.get::<f64>(9).ok(),
        relevance_rationale: row.get::<String>(10).ok(),
        is_hidden: flag(row, 11),
        curator_added: flag(row, 12),
        added_at: parse_ts(&text(row, 13)?)?,
    })
}

/// Convert the article columns starting at `base` to an [`Article`].
fn row_to_article(row: &libsql::Row, base: i32) -> Result<Article> {
    Ok(Article {
        id: text(row, base)?,
        pmid: row.get::<String>(base + 1).ok(),
        doi: row.get::<String>(base + 2).ok(),
        title: text(row, base + 3)?,
        authors: from_json(&text(row, base + 4)?)?,
        abstract_text: row.get::<String>(base + 5).ok(),
        journal: row.get::<String>(base + 6).ok(),
        publication_date: partial_date(row, base + 7)?,
        url: row.get::<String>(base + 10).ok(),
        created_at: parse_ts(&text(row, base + 11)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::wip::{FilterDecision, FilterOutcome};

    fn header(stream_id: &str, execution_id: &str) -> NewReport {
        NewReport {
            stream_id: stream_id.into(),
            user_id: "user-1".into(),
            execution_id: execution_id.into(),
            report_name: "Weekly".into(),
            report_date: Utc::now(),
        }
    }

    fn entries(wips: &[WipArticle]) -> Vec<ReportEntry> {
        wips.iter()
            .enumerate()
            .map(|(i, w)| ReportEntry {
                wip_article_id: w.id.clone(),
                article: w.to_retrieved(),
                ranking: i as i64 + 1,
                relevance_score: w.filter_score,
                relevance_rationale: w.filter_score_reason.clone(),
            })
            .collect()
    }

    async fn count(storage: &Storage, table: &str) -> i64 {
        let mut rows = storage
            .conn
            .query(&format!("SELECT COUNT(*) FROM {table}"), params![])
            .await
            .unwrap();
        rows.next().await.unwrap().unwrap().get::<i64>(0).unwrap()
    }

    /// Stage, bypass, and include the given articles; returns included rows.
    async fn staged_and_included(
        storage: &Storage,
        exec: &str,
        articles: &[RetrievedArticle],
    ) -> Vec<WipArticle> {
        storage.create_wip_articles(exec, "q1", "pubmed", articles).await.unwrap();
        storage.bypass_filter(exec, "q1").await.unwrap();
        storage.mark_for_inclusion(exec).await.unwrap();
        storage.get_included_articles(exec).await.unwrap()
    }

    #[tokio::test]
    async fn materialization_links_execution_and_report() {
        let (storage, stream_id, exec) = with_execution().await;
        let included = staged_and_included(
            &storage,
            &exec,
            &[
                article("One", Some("10.1/one"), Some("111")),
                article("Two", None, Some("222")),
            ],
        )
        .await;

        let written = storage
            .create_report_with_associations(&header(&stream_id, &exec), &entries(&included))
            .await
            .expect("materialize");
        assert_eq!(written.associations, 2);
        assert_eq!(written.articles_created, 2);

        let execution = storage.get_execution(&exec).await.unwrap().unwrap();
        assert_eq!(execution.report_id.as_deref(), Some(written.report_id.as_str()));

        let report = storage.get_report_for_execution(&exec).await.unwrap().unwrap();
        assert_eq!(report.id, written.report_id);

        let articles = storage.get_report_articles(&written.report_id, false).await.unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].article.title, "One");
        assert_eq!(articles[0].association.ranking, 1);
        assert_eq!(
            articles[0].association.wip_article_id.as_deref(),
            Some(included[0].id.as_str())
        );
    }

    #[tokio::test]
    async fn failed_materialization_leaves_nothing_behind() {
        let (storage, stream_id, exec) = with_execution().await;
        let included =
            staged_and_included(&storage, &exec, &[article("Real", Some("10.1/r"), None)]).await;

        let mut bad = entries(&included);
        bad.push(ReportEntry {
            wip_article_id: "no-such-staging-row".into(),
            article: article("Ghost", Some("10.1/ghost"), None),
            ranking: 2,
            relevance_score: None,
            relevance_rationale: None,
        });

        let result = storage
            .create_report_with_associations(&header(&stream_id, &exec), &bad)
            .await;
        assert!(result.is_err());

        assert_eq!(count(&storage, "reports").await, 0);
        assert_eq!(count(&storage, "articles").await, 0);
        assert_eq!(count(&storage, "report_article_associations").await, 0);
        let execution = storage.get_execution(&exec).await.unwrap().unwrap();
        assert!(execution.report_id.is_none());
    }

    #[tokio::test]
    async fn second_layer_dedup_reuses_article() {
        let (storage, stream_id, exec) = with_execution().await;
        let included = staged_and_included(
            &storage,
            &exec,
            &[
                article("Preprint title", None, Some("999")),
                article("Journal title", Some("10.1/j"), Some("999")),
            ],
        )
        .await;
        assert_eq!(included.len(), 2);

        let written = storage
            .create_report_with_associations(&header(&stream_id, &exec), &entries(&included))
            .await
            .unwrap();
        assert_eq!(written.associations, 1);
        assert_eq!(written.duplicates_skipped, 1);

        // Inclusion flag follows the association
        let still_included = storage.get_included_articles(&exec).await.unwrap();
        assert_eq!(still_included.len(), 1);
        let skipped = storage.get_wip_article(&included[1].id).await.unwrap().unwrap();
        assert!(skipped.is_duplicate);
        assert!(!skipped.included_in_report);
    }

    #[tokio::test]
    async fn historical_match_by_normalized_doi() {
        let (storage, stream_id, first) = with_execution().await;
        let included =
            staged_and_included(&storage, &first, &[article("Old", Some("10.1/ABC"), None)])
                .await;
        let written = storage
            .create_report_with_associations(&header(&stream_id, &first), &entries(&included))
            .await
            .unwrap();
        let published = storage.get_report_articles(&written.report_id, true).await.unwrap();

        let second = storage
            .create_execution(&stream_id, "user-1", &execution_config())
            .await
            .unwrap();
        storage
            .create_wip_articles(
                &second.id,
                "q1",
                "pubmed",
                &[
                    article("Renamed", Some("  10.1/abc "), None),
                    article("Brand new", Some("10.1/new"), None),
                ],
            )
            .await
            .unwrap();

        let matches = storage
            .find_historical_duplicates(&second.id, &stream_id)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1, published[0].article.id);
    }

    #[tokio::test]
    async fn enrichment_writes_keep_originals() {
        let (storage, stream_id, exec) = with_execution().await;
        let included =
            staged_and_included(&storage, &exec, &[article("One", None, Some("1"))]).await;
        let written = storage
            .create_report_with_associations(&header(&stream_id, &exec), &entries(&included))
            .await
            .unwrap();
        let report_id = written.report_id.as_str();
        let article_id = storage.get_report_articles(report_id, false).await.unwrap()[0]
            .article
            .id
            .clone();

        storage
            .update_article_summaries(report_id, &[(article_id.clone(), "short".into())])
            .await
            .unwrap();
        storage
            .update_stance_analyses(
                report_id,
                &[(article_id.clone(), serde_json::json!({"stance": "supportive"}))],
            )
            .await
            .unwrap();
        storage
            .update_categories(report_id, &[(article_id.clone(), vec!["clinical".into()])])
            .await
            .unwrap();
        let mut summaries = BTreeMap::new();
        summaries.insert("clinical".to_string(), "Clinical roundup".to_string());
        storage.set_category_summaries(report_id, &summaries).await.unwrap();
        storage.set_executive_summary(report_id, "All quiet").await.unwrap();

        let ra = &storage.get_report_articles(report_id, false).await.unwrap()[0];
        assert_eq!(ra.association.ai_summary.as_deref(), Some("short"));
        assert_eq!(ra.association.original_ai_summary.as_deref(), Some("short"));
        assert_eq!(ra.association.presentation_categories, vec!["clinical".to_string()]);
        assert_eq!(
            ra.association.ai_enrichments.as_ref().unwrap()["stance_analysis"]["stance"],
            "supportive"
        );

        let report = storage.get_report(report_id).await.unwrap().unwrap();
        assert_eq!(report.original_executive_summary.as_deref(), Some("All quiet"));
        assert_eq!(report.category_summaries, report.original_category_summaries);

        storage.set_association_hidden(report_id, &article_id, true).await.unwrap();
        assert!(storage.get_report_articles(report_id, false).await.unwrap().is_empty());
        assert_eq!(storage.get_report_articles(report_id, true).await.unwrap().len(), 1);
    }

    async fn assert_inclusion_matches_associations(storage: &Storage, exec: &str, report_id: &str) {
        let visible = storage.get_report_articles(report_id, true).await.unwrap();
        for wip in storage.get_all_wip_articles(exec).await.unwrap() {
            let has_association = visible
                .iter()
                .any(|ra| ra.association.wip_article_id.as_deref() == Some(wip.id.as_str()));
            assert_eq!(wip.included_in_report, has_association, "wip {}", wip.title);
        }
    }

    #[tokio::test]
    async fn including_a_doi_twin_never_takes_over_its_association() {
        let (storage, stream_id, exec) = with_execution().await;
        storage
            .create_wip_articles(
                &exec,
                "q1",
                "pubmed",
                &[article("Original", Some("10.1/x"), None), article("Twin", Some("10.1/X"), None)],
            )
            .await
            .unwrap();
        let staged = storage.get_all_wip_articles(&exec).await.unwrap();
        let (original, twin) = (staged[0].id.clone(), staged[1].id.clone());
        storage.mark_duplicates(&[(twin.clone(), original.clone())]).await.unwrap();
        storage.bypass_filter(&exec, "q1").await.unwrap();
        storage.mark_for_inclusion(&exec).await.unwrap();
        let included = storage.get_included_articles(&exec).await.unwrap();
        assert_eq!(included.len(), 1);
        let written = storage
            .create_report_with_associations(&header(&stream_id, &exec), &entries(&included))
            .await
            .unwrap();
        let report_id = written.report_id.as_str();

        // Same article, still owned by the original row
        let err = storage
            .apply_curation(&twin, CurationAction::Include, "curator-1", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        let untouched = storage.get_wip_article(&twin).await.unwrap().unwrap();
        assert!(!untouched.included_in_report);
        assert!(!untouched.curator_included);
        assert_inclusion_matches_associations(&storage, &exec, report_id).await;

        // Once the original is excluded the twin may carry the article
        storage
            .apply_curation(&original, CurationAction::Exclude, "curator-1", None)
            .await
            .unwrap();
        let twin_row = storage
            .apply_curation(&twin, CurationAction::Include, "curator-1", None)
            .await
            .unwrap();
        assert!(twin_row.included_in_report);
        let visible = storage.get_report_articles(report_id, true).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].association.wip_article_id.as_deref(), Some(twin.as_str()));
        assert!(visible[0].association.curator_added);
        assert_inclusion_matches_associations(&storage, &exec, report_id).await;

        // Reset both: the twin falls back to duplicate, the original returns
        storage
            .apply_curation(&twin, CurationAction::Reset, "curator-1", None)
            .await
            .unwrap();
        let restored = storage
            .apply_curation(&original, CurationAction::Reset, "curator-1", None)
            .await
            .unwrap();
        assert!(restored.included_in_report);
        let visible = storage.get_report_articles(report_id, true).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].association.wip_article_id.as_deref(), Some(original.as_str()));
        assert_inclusion_matches_associations(&storage, &exec, report_id).await;
    }

    #[tokio::test]
    async fn curation_keeps_inclusion_invariant() {
        let (storage, stream_id, exec) = with_execution().await;
        storage
            .create_wip_articles(
                &exec,
                "q1",
                "pubmed",
                &[article("Kept", None, Some("1")), article("Rejected", None, Some("2"))],
            )
            .await
            .unwrap();
        let staged = storage.get_wip_articles_for_filtering(&exec, "q1").await.unwrap();
        storage
            .apply_filter_results(
                &[
                    FilterOutcome {
                        wip_id: staged[0].id.clone(),
                        decision: FilterDecision::Scored { score: 0.9, reasoning: "yes".into() },
                    },
                    FilterOutcome {
                        wip_id: staged[1].id.clone(),
                        decision: FilterDecision::Scored { score: 0.1, reasoning: "no".into() },
                    },
                ],
                0.7,
            )
            .await
            .unwrap();
        storage.mark_for_inclusion(&exec).await.unwrap();
        let included = storage.get_included_articles(&exec).await.unwrap();
        let written = storage
            .create_report_with_associations(&header(&stream_id, &exec), &entries(&included))
            .await
            .unwrap();

        // Curator pulls in the rejected article
        let rejected = storage
            .apply_curation(&staged[1].id, CurationAction::Include, "curator-1", Some("relevant"))
            .await
            .unwrap();
        assert!(rejected.included_in_report);
        assert!(rejected.curator_included);
        let visible = storage.get_report_articles(&written.report_id, false).await.unwrap();
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().any(|ra| ra.association.curator_added));

        // Curator drops the pipeline's pick
        let kept = storage
            .apply_curation(&staged[0].id, CurationAction::Exclude, "curator-1", None)
            .await
            .unwrap();
        assert!(!kept.included_in_report);
        assert_eq!(
            storage.get_report_articles(&written.report_id, true).await.unwrap().len(),
            1
        );

        // Resetting both restores the pipeline verdicts
        storage
            .apply_curation(&staged[0].id, CurationAction::Reset, "curator-1", None)
            .await
            .unwrap();
        let undone = storage
            .apply_curation(&staged[1].id, CurationAction::Reset, "curator-1", None)
            .await
            .unwrap();
        assert!(!undone.included_in_report);
        assert_eq!(undone.curated_by.as_deref(), Some("curator-1"));

        let visible = storage.get_report_articles(&written.report_id, true).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].article.title, "Kept");

        for wip in storage.get_all_wip_articles(&exec).await.unwrap() {
            let has_association = visible
                .iter()
                .any(|ra| ra.association.wip_article_id.as_deref() == Some(wip.id.as_str()));
            assert_eq!(wip.included_in_report, has_association);
        }
    }

    #[tokio::test]
    async fn curation_requires_a_report() {
        let (storage, _, exec) = with_execution().await;
        storage
            .create_wip_articles(&exec, "q1", "pubmed", &[article("Early", None, None)])
            .await
            .unwrap();
        let wip = &storage.get_all_wip_articles(&exec).await.unwrap()[0];
        let err = storage
            .apply_curation(&wip.id, CurationAction::Include, "curator-1", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no report"));
    }
}
