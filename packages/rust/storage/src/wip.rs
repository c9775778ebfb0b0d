//! Work-in-progress staging store.
//!
//! Every candidate an execution retrieves lands here and is mutated in place
//! by the dedup, filter, and inclusion stages. Rows are never deleted.

use chrono::Utc;
use horizon_shared::{HorizonError, PartialDate, Result, RetrievedArticle, WipArticle, new_id};
use libsql::{Connection, params};

use crate::{Storage, flag, from_json, opt_ts, parse_ts, text, to_json};

/// Column list matching [`row_to_wip`].
const WIP_COLUMNS: &str = "id, execution_id, retrieval_group_id, source_id, title, authors_json,
    abstract, journal, pub_year, pub_month, pub_day, pmid, doi, url,
    is_duplicate, duplicate_of_id, passed_semantic_filter, filter_score, filter_score_reason,
    included_in_report, curator_included, curator_excluded, curation_notes, curated_by,
    curated_at, created_at";

/// Result of scoring one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Scored { score: f64, reasoning: String },
    /// The scoring call failed; the candidate stays undecided.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub wip_id: String,
    pub decision: FilterDecision,
}

/// Aggregate counts from one bulk filter write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterCounts {
    pub passed: usize,
    pub rejected: usize,
    pub errors: usize,
}

impl Storage {
    /// Stage a batch of retrieved articles for one retrieval group.
    ///
    /// Each call creates fresh rows; nothing is matched against existing
    /// staging rows here, that is the dedup stage's job.
    pub async fn create_wip_articles(
        &self,
        execution_id: &str,
        retrieval_group_id: &str,
        source_id: &str,
        articles: &[RetrievedArticle],
    ) -> Result<usize> {
        if articles.is_empty() {
            return Ok(0);
        }

        let conn = self.tx_connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        match insert_wip_rows(&tx, execution_id, retrieval_group_id, source_id, articles).await {
            Ok(count) => {
                tx.commit()
                    .await
                    .map_err(|e| HorizonError::Storage(e.to_string()))?;
                tracing::debug!(execution_id, retrieval_group_id, count, "staged candidates");
                Ok(count)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Candidates of one retrieval group that still need a filter decision.
    pub async fn get_wip_articles_for_filtering(
        &self,
        execution_id: &str,
        retrieval_group_id: &str,
    ) -> Result<Vec<WipArticle>> {
        self.query_wip(
            &format!(
                "SELECT {WIP_COLUMNS} FROM wip_articles
                 WHERE execution_id = ?1 AND retrieval_group_id = ?2
                   AND is_duplicate = 0 AND passed_semantic_filter IS NULL
                 ORDER BY seq"
            ),
            params![execution_id, retrieval_group_id],
        )
        .await
    }

    /// Every candidate of an execution, in insertion order.
    pub async fn get_all_wip_articles(&self, execution_id: &str) -> Result<Vec<WipArticle>> {
        self.query_wip(
            &format!(
                "SELECT {WIP_COLUMNS} FROM wip_articles WHERE execution_id = ?1 ORDER BY seq"
            ),
            params![execution_id],
        )
        .await
    }

    /// Candidates currently marked for the report, in insertion order.
    pub async fn get_included_articles(&self, execution_id: &str) -> Result<Vec<WipArticle>> {
        self.query_wip(
            &format!(
                "SELECT {WIP_COLUMNS} FROM wip_articles
                 WHERE execution_id = ?1 AND included_in_report = 1
                 ORDER BY seq"
            ),
            params![execution_id],
        )
        .await
    }

    pub async fn get_wip_article(&self, id: &str) -> Result<Option<WipArticle>> {
        let mut found = self
            .query_wip(
                &format!("SELECT {WIP_COLUMNS} FROM wip_articles WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(found.pop())
    }

    /// Persist a batch of filter decisions in one transaction.
    ///
    /// A candidate passes iff `score >= threshold`. Failed scoring leaves
    /// `passed_semantic_filter` NULL and records the failure as the reason.
    pub async fn apply_filter_results(
        &self,
        outcomes: &[FilterOutcome],
        threshold: f64,
    ) -> Result<FilterCounts> {
        let mut counts = FilterCounts::default();
        if outcomes.is_empty() {
            return Ok(counts);
        }

        let conn = self.tx_connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        for outcome in outcomes {
            let result = match &outcome.decision {
                FilterDecision::Scored { score, reasoning } => {
                    let passed = *score >= threshold;
                    if passed {
                        counts.passed += 1;
                    } else {
                        counts.rejected += 1;
                    }
                    tx.execute(
                        "UPDATE wip_articles
                         SET passed_semantic_filter = ?1, filter_score = ?2, filter_score_reason = ?3
                         WHERE id = ?4",
                        params![
                            i64::from(passed),
                            *score,
                            reasoning.as_str(),
                            outcome.wip_id.as_str()
                        ],
                    )
                    .await
                }
                FilterDecision::Failed { error } => {
                    counts.errors += 1;
                    tx.execute(
                        "UPDATE wip_articles
                         SET passed_semantic_filter = NULL, filter_score = NULL, filter_score_reason = ?1
                         WHERE id = ?2",
                        params![format!("scoring failed: {error}"), outcome.wip_id.as_str()],
                    )
                    .await
                }
            };

            if let Err(e) = result {
                let _ = tx.rollback().await;
                return Err(HorizonError::Storage(e.to_string()));
            }
        }

        tx.commit()
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        Ok(counts)
    }

    /// Auto-pass every undecided, non-duplicate candidate of a group with a NULL score.
    pub async fn bypass_filter(&self, execution_id: &str, retrieval_group_id: &str) -> Result<usize> {
        let updated = self
            .conn
            .execute(
                "UPDATE wip_articles
                 SET passed_semantic_filter = 1, filter_score = NULL, filter_score_reason = NULL
                 WHERE execution_id = ?1 AND retrieval_group_id = ?2
                   AND is_duplicate = 0 AND passed_semantic_filter IS NULL",
                params![execution_id, retrieval_group_id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        Ok(updated as usize)
    }

    /// Match candidates against articles already published in other reports of
    /// the same stream. Returns `(wip_id, article_id)` pairs in insertion order.
    ///
    /// Identifiers compare trimmed and case-insensitively; titles compare
    /// after trim + lowercase. Empty keys never match.
    pub async fn find_historical_duplicates(
        &self,
        execution_id: &str,
        stream_id: &str,
    ) -> Result<Vec<(String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT w.id, MIN(a.id)
                 FROM wip_articles w
                 JOIN articles a ON (
                        (trim(coalesce(w.doi, '')) != ''
                         AND lower(trim(w.doi)) = lower(trim(coalesce(a.doi, ''))))
                     OR (trim(coalesce(w.pmid, '')) != ''
                         AND lower(trim(w.pmid)) = lower(trim(coalesce(a.pmid, ''))))
                     OR (trim(w.title) != ''
                         AND lower(trim(w.title)) = lower(trim(a.title)))
                 )
                 JOIN report_article_associations ra ON ra.article_id = a.id
                 JOIN reports r ON r.id = ra.report_id
                 WHERE w.execution_id = ?1
                   AND w.is_duplicate = 0
                   AND r.stream_id = ?2
                   AND r.execution_id != ?1
                 GROUP BY w.id
                 ORDER BY MIN(w.seq)",
                params![execution_id, stream_id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| HorizonError::Storage(e.to_string()))? {
            results.push((text(&row, 0)?, text(&row, 1)?));
        }
        Ok(results)
    }

    /// Flag candidates as duplicates of the given canonical record.
    pub async fn mark_duplicates(&self, pairs: &[(String, String)]) -> Result<usize> {
        if pairs.is_empty() {
            return Ok(0);
        }

        let conn = self.tx_connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let mut marked = 0usize;
        for (wip_id, duplicate_of) in pairs {
            match tx
                .execute(
                    "UPDATE wip_articles SET is_duplicate = 1, duplicate_of_id = ?1
                     WHERE id = ?2 AND is_duplicate = 0",
                    params![duplicate_of.as_str(), wip_id.as_str()],
                )
                .await
            {
                Ok(n) => marked += n as usize,
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(HorizonError::Storage(e.to_string()));
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        Ok(marked)
    }

    /// Set `included_in_report` for every non-duplicate candidate that passed the filter.
    pub async fn mark_for_inclusion(&self, execution_id: &str) -> Result<usize> {
        let updated = self
            .conn
            .execute(
                "UPDATE wip_articles SET included_in_report = 1
                 WHERE execution_id = ?1 AND is_duplicate = 0
                   AND passed_semantic_filter = 1 AND curator_excluded = 0",
                params![execution_id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        Ok(updated as usize)
    }

    async fn query_wip(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<WipArticle>> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| HorizonError::Storage(e.to_string()))? {
            results.push(row_to_wip(&row)?);
        }
        Ok(results)
    }
}

async fn insert_wip_rows(
    conn: &Connection,
    execution_id: &str,
    retrieval_group_id: &str,
    source_id: &str,
    articles: &[RetrievedArticle],
) -> Result<usize> {
    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(seq), 0) FROM wip_articles WHERE execution_id = ?1",
            params![execution_id],
        )
        .await
        .map_err(|e| HorizonError::Storage(e.to_string()))?;
    let mut seq: i64 = match rows.next().await {
        Ok(Some(row)) => row.get::<i64>(0).unwrap_or(0),
        _ => 0,
    };

    let now = Utc::now().to_rfc3339();
    for article in articles {
        seq += 1;
        let authors = to_json(&article.authors)?;
        let date = article.publication_date;
        conn.execute(
            "INSERT INTO wip_articles (
                id, execution_id, retrieval_group_id, source_id, title, authors_json,
                abstract, journal, pub_year, pub_month, pub_day, pmid, doi, url,
                created_at, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                new_id(),
                execution_id,
                retrieval_group_id,
                source_id,
                article.title.as_str(),
                authors,
                article.abstract_text.as_deref(),
                article.journal.as_deref(),
                i64::from(date.year),
                date.month.map(i64::from),
                date.day.map(i64::from),
                article.pmid.as_deref(),
                article.doi.as_deref(),
                article.url.as_deref(),
                now.as_str(),
                seq
            ],
        )
        .await
        .map_err(|e| HorizonError::Storage(e.to_string()))?;
    }
    Ok(articles.len())
}

/// Read a partial date stored as a year column plus nullable month and day.
pub(crate) fn partial_date(row: &libsql::Row, idx: i32) -> Result<PartialDate> {
    let year = row
        .get::<i64>(idx)
        .map_err(|e| HorizonError::Storage(e.to_string()))?;
    Ok(PartialDate::from_parts(
        year as i32,
        row.get::<i64>(idx + 1).ok().map(|v| v as u32),
        row.get::<i64>(idx + 2).ok().map(|v| v as u32),
    ))
}

/// Convert a database row to a [`WipArticle`].
fn row_to_wip(row: &libsql::Row) -> Result<WipArticle> {
    Ok(WipArticle {
        id: text(row, 0)?,
        execution_id: text(row, 1)?,
        retrieval_group_id: text(row, 2)?,
        source_id: text(row, 3)?,
        title: text(row, 4)?,
        authors: from_json(&text(row, 5)?)?,
        abstract_text: row.get::<String>(6).ok(),
        journal: row.get::<String>(7).ok(),
        publication_date: partial_date(row, 8)?,
        pmid: row.get::<String>(11).ok(),
        doi: row.get::<String>(12).ok(),
        url: row.get::<String>(13).ok(),
        is_duplicate: flag(row, 14),
        duplicate_of_id: row.get::<String>(15).ok(),
        passed_semantic_filter: row.get::<i64>(16).ok().map(|v| v != 0),
        filter_score: row.get::<f64>(17).ok(),
        filter_score_reason: row.get::<String>(18).ok(),
        included_in_report: flag(row, 19),
        curator_included: flag(row, 20),
        curator_excluded: flag(row, 21),
        curation_notes: row.get::<String>(22).ok(),
        curated_by: row.get::<String>(23).ok(),
        curated_at: opt_ts(row, 24)?,
        created_at: parse_ts(&text(row, 25)?)?,
    })
}
