//! SQL migration definitions for the Knowledge Horizon database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: streams, executions, wip_articles, articles, reports, associations",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Research streams (live configuration)
CREATE TABLE IF NOT EXISTS streams (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    config_json TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- Pipeline executions with their immutable config snapshot
CREATE TABLE IF NOT EXISTS executions (
    id           TEXT PRIMARY KEY,
    stream_id    TEXT NOT NULL REFERENCES streams(id) ON DELETE CASCADE,
    user_id      TEXT NOT NULL,
    status       TEXT NOT NULL,
    config_json  TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    completed_at TEXT,
    error        TEXT,
    report_id    TEXT
);

CREATE INDEX IF NOT EXISTS idx_executions_stream ON executions(stream_id);

-- Staging records: every candidate of an execution, never deleted
CREATE TABLE IF NOT EXISTS wip_articles (
    id                     TEXT PRIMARY KEY,
    execution_id           TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
    retrieval_group_id     TEXT NOT NULL,
    source_id              TEXT NOT NULL,
    title                  TEXT NOT NULL,
    authors_json           TEXT NOT NULL DEFAULT '[]',
    abstract               TEXT,
    journal                TEXT,
    pub_year               INTEGER NOT NULL,
    pub_month              INTEGER,
    pub_day                INTEGER,
    pmid                   TEXT,
    doi                    TEXT,
    url                    TEXT,
    is_duplicate           INTEGER NOT NULL DEFAULT 0,
    duplicate_of_id        TEXT,
    passed_semantic_filter INTEGER,
    filter_score           REAL,
    filter_score_reason    TEXT,
    included_in_report     INTEGER NOT NULL DEFAULT 0,
    curator_included       INTEGER NOT NULL DEFAULT 0,
    curator_excluded       INTEGER NOT NULL DEFAULT 0,
    curation_notes         TEXT,
    curated_by             TEXT,
    curated_at             TEXT,
    created_at             TEXT NOT NULL,
    seq                    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_wip_execution ON wip_articles(execution_id);
CREATE INDEX IF NOT EXISTS idx_wip_group ON wip_articles(execution_id, retrieval_group_id);

-- Permanent articles shared across reports
CREATE TABLE IF NOT EXISTS articles (
    id           TEXT PRIMARY KEY,
    pmid         TEXT,
    doi          TEXT,
    title        TEXT NOT NULL,
    authors_json TEXT NOT NULL DEFAULT '[]',
    abstract     TEXT,
    journal      TEXT,
    pub_year     INTEGER NOT NULL,
    pub_month    INTEGER,
    pub_day      INTEGER,
    url          TEXT,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_articles_pmid ON articles(pmid);
CREATE INDEX IF NOT EXISTS idx_articles_doi ON articles(doi);

-- Reports produced by executions
CREATE TABLE IF NOT EXISTS reports (
    id                               TEXT PRIMARY KEY,
    stream_id                        TEXT NOT NULL REFERENCES streams(id) ON DELETE CASCADE,
    user_id                          TEXT NOT NULL,
    execution_id                     TEXT NOT NULL REFERENCES executions(id),
    report_name                      TEXT NOT NULL,
    report_date                      TEXT NOT NULL,
    executive_summary                TEXT,
    original_executive_summary       TEXT,
    category_summaries_json          TEXT NOT NULL DEFAULT '{}',
    original_category_summaries_json TEXT NOT NULL DEFAULT '{}',
    pipeline_metrics_json            TEXT,
    created_at                       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reports_stream ON reports(stream_id);

-- Article-in-report associations
CREATE TABLE IF NOT EXISTS report_article_associations (
    report_id                             TEXT NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
    article_id                            TEXT NOT NULL REFERENCES articles(id),
    wip_article_id                        TEXT REFERENCES wip_articles(id),
    ranking                               INTEGER NOT NULL,
    presentation_categories_json          TEXT NOT NULL DEFAULT '[]',
    original_presentation_categories_json TEXT NOT NULL DEFAULT '[]',
    ai_summary                            TEXT,
    original_ai_summary                   TEXT,
    ai_enrichments_json                   TEXT,
    relevance_score                       REAL,
    relevance_rationale                   TEXT,
    is_hidden                             INTEGER NOT NULL DEFAULT 0,
    curator_added                         INTEGER NOT NULL DEFAULT 0,
    added_at                              TEXT NOT NULL,
    PRIMARY KEY (report_id, article_id)
);

CREATE INDEX IF NOT EXISTS idx_assoc_article ON report_article_associations(article_id);
CREATE INDEX IF NOT EXISTS idx_assoc_wip ON report_article_associations(wip_article_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
