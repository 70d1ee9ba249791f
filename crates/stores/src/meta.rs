//! Document provenance rows in SQLite. One row per document id: the
//! SHA-256 of uploaded payload bytes, or a `failed-<sha256(url)>` sentinel
//! for records that never produced a payload.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("unknown document status {0:?}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocStatus {
    Pending,
    Downloading,
    Validating,
    Uploaded,
    Failed,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Pending => "pending",
            DocStatus::Downloading => "downloading",
            DocStatus::Validating => "validating",
            DocStatus::Uploaded => "uploaded",
            DocStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, MetaError> {
        match s {
            "pending" => Ok(DocStatus::Pending),
            "downloading" => Ok(DocStatus::Downloading),
            "validating" => Ok(DocStatus::Validating),
            "uploaded" => Ok(DocStatus::Uploaded),
            "failed" => Ok(DocStatus::Failed),
            other => Err(MetaError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRow {
    pub id: String,
    pub source_url: Option<String>,
    pub crawl_id: Option<String>,
    pub original_filename: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub status: DocStatus,
    pub error_message: Option<String>,
    pub is_valid_docx: Option<bool>,
    pub discovered_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub word_count: Option<i64>,
    pub char_count: Option<i64>,
    pub table_count: Option<i64>,
    pub image_count: Option<i64>,
    pub extraction_error: Option<String>,
}

/// Sparse update: only the columns carried as Some are written. Upserts
/// are a single statement and therefore atomic.
#[derive(Debug, Clone, Default)]
pub struct DocumentPatch {
    pub source_url: Option<String>,
    pub crawl_id: Option<String>,
    pub original_filename: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub status: Option<DocStatus>,
    pub error_message: Option<String>,
    pub is_valid_docx: Option<bool>,
    pub discovered_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionCounts {
    pub word_count: i64,
    pub char_count: i64,
    pub table_count: i64,
    pub image_count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    /// Rows with status = uploaded.
    pub uploaded: i64,
    /// Uploaded rows with a completed extraction.
    pub extracted: i64,
    /// Uploaded rows with a recorded extraction error.
    pub failed: i64,
    /// Uploaded rows still awaiting extraction.
    pub pending: i64,
}

const SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    source_url TEXT,
    crawl_id TEXT,
    original_filename TEXT,
    file_size_bytes INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    is_valid_docx INTEGER,
    discovered_at TEXT,
    downloaded_at TEXT,
    uploaded_at TEXT,
    extracted_at TEXT,
    word_count INTEGER,
    char_count INTEGER,
    table_count INTEGER,
    image_count INTEGER,
    extraction_error TEXT
)
"#,
    "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
    "CREATE INDEX IF NOT EXISTS idx_documents_source_url ON documents(source_url)",
];

#[derive(Debug, Clone)]
pub struct MetaStore {
    pool: SqlitePool,
}

impl MetaStore {
    /// Open (and create if missing) the database at `url`, e.g.
    /// `sqlite://corpus.db`, and bootstrap the schema.
    pub async fn connect(url: &str) -> Result<Self, MetaError> {
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !url.contains(":memory:") {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        tracing::debug!(url, "metadata store ready");
        Ok(Self { pool })
    }

    pub async fn upsert(&self, id: &str, patch: DocumentPatch) -> Result<(), MetaError> {
        let mut cols: Vec<&'static str> = Vec::new();
        let mut args: Vec<Arg> = Vec::new();
        patch_args(&patch, &mut cols, &mut args);

        if cols.is_empty() {
            sqlx::query("INSERT INTO documents (id) VALUES (?1) ON CONFLICT(id) DO NOTHING")
                .bind(id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        let placeholders = (2..=cols.len() + 1)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = cols
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO documents (id, {}) VALUES (?1, {placeholders}) \
             ON CONFLICT(id) DO UPDATE SET {updates}",
            cols.join(", "),
        );

        let mut query = sqlx::query(&sql).bind(id);
        for arg in args {
            query = match arg {
                Arg::Text(v) => query.bind(v),
                Arg::Int(v) => query.bind(v),
                Arg::Bool(v) => query.bind(v),
                Arg::Time(v) => query.bind(v),
            };
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<DocumentRow>, MetaError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_row(&r)).transpose()
    }

    pub async fn get_by_url(&self, url: &str) -> Result<Option<DocumentRow>, MetaError> {
        let row = sqlx::query("SELECT * FROM documents WHERE source_url = ?1 LIMIT 1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_row(&r)).transpose()
    }

    /// All source URLs already uploaded; loaded once per crawl as the
    /// in-memory fast-dedup path.
    pub async fn uploaded_url_set(&self) -> Result<HashSet<String>, MetaError> {
        let rows = sqlx::query(
            "SELECT source_url FROM documents WHERE status = 'uploaded' AND source_url IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get::<Option<String>, _>("source_url").ok().flatten())
            .collect())
    }

    /// Uploaded ids in ascending id order, for the manifest.
    pub async fn uploaded_ids(&self) -> Result<Vec<String>, MetaError> {
        let rows =
            sqlx::query("SELECT id FROM documents WHERE status = 'uploaded' ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("id").map_err(Into::into))
            .collect()
    }

    pub async fn stats_by_status(&self) -> Result<BTreeMap<String, i64>, MetaError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = BTreeMap::new();
        for row in rows {
            stats.insert(
                row.try_get::<String, _>("status")?,
                row.try_get::<i64, _>("n")?,
            );
        }
        Ok(stats)
    }

    /// Record a completed extraction. Clears any prior extraction error:
    /// a row carries at most one of extracted_at / extraction_error.
    pub async fn update_extraction(
        &self,
        id: &str,
        counts: ExtractionCounts,
    ) -> Result<(), MetaError> {
        sqlx::query(
            "UPDATE documents SET extracted_at = ?1, word_count = ?2, char_count = ?3, \
             table_count = ?4, image_count = ?5, extraction_error = NULL WHERE id = ?6",
        )
        .bind(Utc::now())
        .bind(counts.word_count)
        .bind(counts.char_count)
        .bind(counts.table_count)
        .bind(counts.image_count)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_extraction_error(&self, id: &str, error: &str) -> Result<(), MetaError> {
        sqlx::query(
            "UPDATE documents SET extraction_error = ?1, extracted_at = NULL WHERE id = ?2",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Uploaded rows that have neither been extracted nor permanently
    /// failed extraction, oldest upload first. Rows with a recorded
    /// extraction error are excluded until an operator clears the column.
    pub async fn get_unextracted(&self, limit: i64) -> Result<Vec<DocumentRow>, MetaError> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE status = 'uploaded' AND extracted_at IS NULL \
             AND extraction_error IS NULL ORDER BY uploaded_at ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_row).collect()
    }

    pub async fn extraction_stats(&self) -> Result<ExtractionStats, MetaError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS uploaded, \
             SUM(CASE WHEN extracted_at IS NOT NULL THEN 1 ELSE 0 END) AS extracted, \
             SUM(CASE WHEN extraction_error IS NOT NULL THEN 1 ELSE 0 END) AS failed \
             FROM documents WHERE status = 'uploaded'",
        )
        .fetch_one(&self.pool)
        .await?;
        let uploaded: i64 = row.try_get("uploaded")?;
        let extracted: i64 = row.try_get::<Option<i64>, _>("extracted")?.unwrap_or(0);
        let failed: i64 = row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0);
        Ok(ExtractionStats {
            uploaded,
            extracted,
            failed,
            pending: uploaded - extracted - failed,
        })
    }
}

enum Arg {
    Text(String),
    Int(i64),
    Bool(bool),
    Time(DateTime<Utc>),
}

fn patch_args(patch: &DocumentPatch, cols: &mut Vec<&'static str>, args: &mut Vec<Arg>) {
    if let Some(v) = &patch.source_url {
        cols.push("source_url");
        args.push(Arg::Text(v.clone()));
    }
    if let Some(v) = &patch.crawl_id {
        cols.push("crawl_id");
        args.push(Arg::Text(v.clone()));
    }
    if let Some(v) = &patch.original_filename {
        cols.push("original_filename");
        args.push(Arg::Text(v.clone()));
    }
    if let Some(v) = patch.file_size_bytes {
        cols.push("file_size_bytes");
        args.push(Arg::Int(v));
    }
    if let Some(v) = patch.status {
        cols.push("status");
        args.push(Arg::Text(v.as_str().to_string()));
    }
    if let Some(v) = &patch.error_message {
        cols.push("error_message");
        args.push(Arg::Text(v.clone()));
    }
    if let Some(v) = patch.is_valid_docx {
        cols.push("is_valid_docx");
        args.push(Arg::Bool(v));
    }
    if let Some(v) = patch.discovered_at {
        cols.push("discovered_at");
        args.push(Arg::Time(v));
    }
    if let Some(v) = patch.downloaded_at {
        cols.push("downloaded_at");
        args.push(Arg::Time(v));
    }
    if let Some(v) = patch.uploaded_at {
        cols.push("uploaded_at");
        args.push(Arg::Time(v));
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentRow, MetaError> {
    let status: String = row.try_get("status")?;
    Ok(DocumentRow {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        crawl_id: row.try_get("crawl_id")?,
        original_filename: row.try_get("original_filename")?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        status: DocStatus::parse(&status)?,
        error_message: row.try_get("error_message")?,
        is_valid_docx: row.try_get("is_valid_docx")?,
        discovered_at: row.try_get("discovered_at")?,
        downloaded_at: row.try_get("downloaded_at")?,
        uploaded_at: row.try_get("uploaded_at")?,
        extracted_at: row.try_get("extracted_at")?,
        word_count: row.try_get("word_count")?,
        char_count: row.try_get("char_count")?,
        table_count: row.try_get("table_count")?,
        image_count: row.try_get("image_count")?,
        extraction_error: row.try_get("extraction_error")?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    async fn store() -> (tempfile::TempDir, MetaStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let store = MetaStore::connect(&url).await.unwrap();
        (dir, store)
    }

    fn uploaded_patch(url: &str) -> DocumentPatch {
        DocumentPatch {
            source_url: Some(url.to_string()),
            crawl_id: Some("CC-MAIN-2025-05".to_string()),
            original_filename: Some("report.docx".to_string()),
            file_size_bytes: Some(1234),
            status: Some(DocStatus::Uploaded),
            is_valid_docx: Some(true),
            discovered_at: Some(Utc::now()),
            downloaded_at: Some(Utc::now()),
            uploaded_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_sparse_updates() {
        let (_dir, store) = store().await;
        store.upsert("abc", uploaded_patch("https://x/report.docx")).await.unwrap();

        // A sparse patch only touches the carried columns.
        store
            .upsert(
                "abc",
                DocumentPatch {
                    error_message: Some("late note".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let row = store.get("abc").await.unwrap().unwrap();
        assert_eq!(row.status, DocStatus::Uploaded);
        assert_eq!(row.source_url.as_deref(), Some("https://x/report.docx"));
        assert_eq!(row.error_message.as_deref(), Some("late note"));
        assert_eq!(row.is_valid_docx, Some(true));
        assert_eq!(row.file_size_bytes, Some(1234));
    }

    #[tokio::test]
    async fn get_by_url_and_uploaded_url_set() {
        let (_dir, store) = store().await;
        store.upsert("a1", uploaded_patch("https://x/1.docx")).await.unwrap();
        store
            .upsert(
                "failed-b2",
                DocumentPatch {
                    source_url: Some("https://x/2.docx".to_string()),
                    status: Some(DocStatus::Failed),
                    error_message: Some("timeout".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let row = store.get_by_url("https://x/2.docx").await.unwrap().unwrap();
        assert_eq!(row.id, "failed-b2");

        let set = store.uploaded_url_set().await.unwrap();
        assert!(set.contains("https://x/1.docx"));
        assert!(!set.contains("https://x/2.docx"));
    }

    #[tokio::test]
    async fn stats_by_status_counts_rows() {
        let (_dir, store) = store().await;
        store.upsert("a", uploaded_patch("https://x/a.docx")).await.unwrap();
        store.upsert("b", uploaded_patch("https://x/b.docx")).await.unwrap();
        store
            .upsert(
                "failed-c",
                DocumentPatch {
                    status: Some(DocStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stats = store.stats_by_status().await.unwrap();
        assert_eq!(stats.get("uploaded"), Some(&2));
        assert_eq!(stats.get("failed"), Some(&1));
    }

    #[tokio::test]
    async fn unextracted_queue_is_oldest_upload_first() {
        let (_dir, store) = store().await;
        let t0 = Utc::now();
        for (id, offset) in [("newer", 60), ("older", 0), ("oldest", -60)] {
            let mut patch = uploaded_patch(&format!("https://x/{id}.docx"));
            patch.uploaded_at = Some(t0 + chrono::Duration::seconds(offset));
            store.upsert(id, patch).await.unwrap();
        }
        store.update_extraction_error("older", "broken").await.unwrap();

        let queue = store.get_unextracted(10).await.unwrap();
        let ids: Vec<&str> = queue.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["oldest", "newer"]);
    }

    #[tokio::test]
    async fn extraction_updates_are_mutually_exclusive() {
        let (_dir, store) = store().await;
        store.upsert("doc", uploaded_patch("https://x/doc.docx")).await.unwrap();

        store.update_extraction_error("doc", "hung").await.unwrap();
        let row = store.get("doc").await.unwrap().unwrap();
        assert!(row.extracted_at.is_none());
        assert_eq!(row.extraction_error.as_deref(), Some("hung"));

        store
            .update_extraction(
                "doc",
                ExtractionCounts {
                    word_count: 10,
                    char_count: 60,
                    table_count: 1,
                    image_count: 0,
                },
            )
            .await
            .unwrap();
        let row = store.get("doc").await.unwrap().unwrap();
        assert!(row.extracted_at.is_some());
        assert_eq!(row.extraction_error, None);
        assert_eq!(row.word_count, Some(10));
    }

    #[tokio::test]
    async fn extraction_stats_partitions_uploaded() {
        let (_dir, store) = store().await;
        for id in ["a", "b", "c"] {
            store.upsert(id, uploaded_patch(&format!("https://x/{id}.docx"))).await.unwrap();
        }
        store
            .update_extraction("a", ExtractionCounts::default())
            .await
            .unwrap();
        store.update_extraction_error("b", "bad zip").await.unwrap();

        let stats = store.extraction_stats().await.unwrap();
        assert_eq!(
            stats,
            ExtractionStats {
                uploaded: 3,
                extracted: 1,
                failed: 1,
                pending: 1,
            }
        );
    }
}
