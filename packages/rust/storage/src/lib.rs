//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding research streams,
//! executions, the work-in-progress staging table, permanent articles,
//! reports, and report-article associations.
//!
//! Bulk operations that must be atomic (staging writes, filter results,
//! materialization, curation) open a dedicated connection and run inside a
//! single transaction; everything else goes through the shared connection.

mod migrations;
mod reports;
mod wip;

use std::path::Path;

use chrono::{DateTime, Utc};
use horizon_shared::{
    Execution, ExecutionConfig, ExecutionStatus, HorizonError, Result, Stream, StreamConfig,
    new_id,
};
use libsql::{Connection, Database, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use reports::{CurationAction, MaterializedReport, NewReport, ReportEntry};
pub use wip::{FilterCounts, FilterDecision, FilterOutcome};

/// Pragmas applied to every connection we open.
const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HorizonError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        conn.execute_batch(CONNECTION_PRAGMAS)
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a fresh connection for a transactional bulk operation.
    pub(crate) async fn tx_connection(&self) -> Result<Connection> {
        let conn = self
            .db
            .connect()
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        conn.execute_batch(CONNECTION_PRAGMAS)
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        Ok(conn)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        HorizonError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Stream operations
    // -----------------------------------------------------------------------

    /// Insert a new research stream with its live configuration.
    pub async fn insert_stream(
        &self,
        name: &str,
        user_id: &str,
        config: &StreamConfig,
    ) -> Result<Stream> {
        let id = new_id();
        let now = Utc::now();
        let config_json = to_json(config)?;
        self.conn
            .execute(
                "INSERT INTO streams (id, name, user_id, config_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    name,
                    user_id,
                    config_json.as_str(),
                    now.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        tracing::info!(stream_id = %id, name, "stream created");
        Ok(Stream {
            id,
            name: name.to_string(),
            user_id: user_id.to_string(),
            config: config.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a stream by ID.
    pub async fn get_stream(&self, id: &str) -> Result<Option<Stream>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, user_id, config_json, created_at, updated_at
                 FROM streams WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_stream(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(HorizonError::Storage(e.to_string())),
        }
    }

    /// List all streams, ordered by name.
    pub async fn list_streams(&self) -> Result<Vec<Stream>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, user_id, config_json, created_at, updated_at
                 FROM streams ORDER BY name",
                params![],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| HorizonError::Storage(e.to_string()))? {
            results.push(row_to_stream(&row)?);
        }
        Ok(results)
    }

    /// Replace a stream's live configuration. Existing executions keep their snapshot.
    pub async fn update_stream_config(&self, id: &str, config: &StreamConfig) -> Result<()> {
        let config_json = to_json(config)?;
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn
            .execute(
                "UPDATE streams SET config_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![config_json.as_str(), now.as_str(), id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        if updated == 0 {
            return Err(HorizonError::not_found("stream", id));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution operations
    // -----------------------------------------------------------------------

    /// Create a pending execution carrying an immutable configuration snapshot.
    pub async fn create_execution(
        &self,
        stream_id: &str,
        user_id: &str,
        config: &ExecutionConfig,
    ) -> Result<Execution> {
        let id = new_id();
        let now = Utc::now();
        let config_json = to_json(config)?;
        self.conn
            .execute(
                "INSERT INTO executions (id, stream_id, user_id, status, config_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    stream_id,
                    user_id,
                    ExecutionStatus::Pending.as_str(),
                    config_json.as_str(),
                    now.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        tracing::info!(execution_id = %id, stream_id, "execution created");
        Ok(Execution {
            id,
            stream_id: stream_id.to_string(),
            user_id: user_id.to_string(),
            status: ExecutionStatus::Pending,
            config: config.clone(),
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            report_id: None,
        })
    }

    /// Get an execution by ID.
    pub async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, stream_id, user_id, status, config_json, created_at,
                        started_at, completed_at, error, report_id
                 FROM executions WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_execution(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(HorizonError::Storage(e.to_string())),
        }
    }

    /// List executions, newest first, optionally restricted to one stream.
    pub async fn list_executions(&self, stream_id: Option<&str>) -> Result<Vec<Execution>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, stream_id, user_id, status, config_json, created_at,
                        started_at, completed_at, error, report_id
                 FROM executions
                 WHERE ?1 IS NULL OR stream_id = ?1
                 ORDER BY created_at DESC, id DESC",
                params![stream_id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| HorizonError::Storage(e.to_string()))? {
            results.push(row_to_execution(&row)?);
        }
        Ok(results)
    }

    /// Move a pending execution to `running`.
    pub async fn start_execution(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn
            .execute(
                "UPDATE executions SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now.as_str(), id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        if updated == 0 {
            return Err(self.transition_error(id, ExecutionStatus::Pending).await);
        }
        Ok(())
    }

    /// Move a running execution to `completed`.
    pub async fn complete_execution(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn
            .execute(
                "UPDATE executions SET status = 'completed', completed_at = ?1
                 WHERE id = ?2 AND status = 'running'",
                params![now.as_str(), id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        if updated == 0 {
            return Err(self.transition_error(id, ExecutionStatus::Running).await);
        }
        Ok(())
    }

    /// Mark an execution failed with its final error text.
    ///
    /// Called by whoever consumed the event stream; a completed execution is
    /// never downgraded.
    pub async fn fail_execution(&self, id: &str, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn
            .execute(
                "UPDATE executions SET status = 'failed', completed_at = ?1, error = ?2
                 WHERE id = ?3 AND status != 'completed'",
                params![now.as_str(), error, id],
            )
            .await
            .map_err(|e| HorizonError::Storage(e.to_string()))?;
        if updated == 0 {
            return Err(self.transition_error(id, ExecutionStatus::Running).await);
        }
        tracing::warn!(execution_id = id, error, "execution failed");
        Ok(())
    }

    async fn transition_error(&self, id: &str, expected: ExecutionStatus) -> HorizonError {
        match self.get_execution(id).await {
            Ok(Some(execution)) => HorizonError::validation(format!(
                "execution {id} is {}, expected {expected}",
                execution.status
            )),
            Ok(None) => HorizonError::not_found("execution", id),
            Err(e) => e,
        }
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| HorizonError::Storage(format!("encode json: {e}")))
}

pub(crate) fn from_json<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| HorizonError::Storage(format!("decode json: {e}")))
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HorizonError::Storage(format!("invalid date: {e}")))
}

/// Read a required text column.
pub(crate) fn text(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx)
        .map_err(|e| HorizonError::Storage(e.to_string()))
}

/// Read an optional timestamp column.
pub(crate) fn opt_ts(row: &libsql::Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    row.get::<String>(idx).ok().map(|s| parse_ts(&s)).transpose()
}

pub(crate) fn flag(row: &libsql::Row, idx: i32) -> bool {
    row.get::<i64>(idx).map(|v| v != 0).unwrap_or(false)
}

fn row_to_stream(row: &libsql::Row) -> Result<Stream> {
    Ok(Stream {
        id: text(row, 0)?,
        name: text(row, 1)?,
        user_id: text(row, 2)?,
        config: from_json(&text(row, 3)?)?,
        created_at: parse_ts(&text(row, 4)?)?,
        updated_at: parse_ts(&text(row, 5)?)?,
    })
}

fn row_to_execution(row: &libsql::Row) -> Result<Execution> {
    Ok(Execution {
        id: text(row, 0)?,
        stream_id: text(row, 1)?,
        user_id: text(row, 2)?,
        status: text(row, 3)?.parse()?,
        config: from_json(&text(row, 4)?)?,
        created_at: parse_ts(&text(row, 5)?)?,
        started_at: opt_ts(row, 6)?,
        completed_at: opt_ts(row, 7)?,
        error: row.get::<String>(8).ok(),
        report_id: row.get::<String>(9).ok(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::NaiveDate;
    use horizon_shared::{
        DateRange, ExecutionConfig, PartialDate, QueryConfig, RetrievalConfig, RetrievedArticle,
        SemanticFilterConfig, StreamConfig,
    };
    use uuid::Uuid;

    use super::Storage;

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("kh_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    pub fn stream_config() -> StreamConfig {
        StreamConfig {
            retrieval: RetrievalConfig {
                queries: vec![QueryConfig {
                    query_id: "q1".into(),
                    query_expression: "mc4r obesity".into(),
                    source: "pubmed".into(),
                    semantic_filter: SemanticFilterConfig {
                        enabled: true,
                        criteria: "human trials".into(),
                        threshold: 0.7,
                    },
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn execution_config() -> ExecutionConfig {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
        )
        .unwrap();
        ExecutionConfig::snapshot(&stream_config(), range, None)
    }

    pub fn article(title: &str, doi: Option<&str>, pmid: Option<&str>) -> RetrievedArticle {
        RetrievedArticle {
            title: title.into(),
            authors: vec!["Doe J".into()],
            abstract_text: Some(format!("Abstract of {title}")),
            journal: Some("J Test".into()),
            publication_date: PartialDate::from_parts(2025, Some(1), None),
            pmid: pmid.map(Into::into),
            doi: doi.map(Into::into),
            url: None,
        }
    }

    /// A storage with one stream and one pending execution.
    pub async fn with_execution() -> (Storage, String, String) {
        let storage = test_storage().await;
        let stream = storage
            .insert_stream("obesity", "user-1", &stream_config())
            .await
            .expect("insert stream");
        let execution = storage
            .create_execution(&stream.id, "user-1", &execution_config())
            .await
            .expect("create execution");
        (storage, stream.id, execution.id)
    }
}
