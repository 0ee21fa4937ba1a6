use std::{path::Path, str::FromStr};

use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    FromRow,
};

use crate::{models::UploadRecord, StrConversion, UploadStatus};

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("ledger directory could not be created: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only history of upload attempts, kept in SQLite.
///
/// The pool holds a single connection so concurrent appends from upload
/// workers are serialized by the pool itself.
#[derive(Clone, Debug)]
pub struct TransferStateStore {
    pool: SqlitePool,
}

#[derive(FromRow, Debug)]
struct UploadRow {
    local_path: String,
    remote_path: String,
    content_hash: String,
    content_length: i64,
    uploaded_at: DateTime<Utc>,
    cdn_url: Option<String>,
    status: String,
    remote_file_id: Option<String>,
    project_name: String,
    error_message: Option<String>,
}

impl From<UploadRow> for UploadRecord {
    fn from(x: UploadRow) -> Self {
        UploadRecord {
            local_path: x.local_path.into(),
            remote_path: x.remote_path,
            content_hash: x.content_hash,
            content_length: x.content_length.max(0) as u64,
            uploaded_at: x.uploaded_at,
            cdn_url: x.cdn_url,
            status: UploadStatus::from_str(&x.status),
            remote_file_id: x.remote_file_id,
            project_name: x.project_name,
            error_message: x.error_message,
        }
    }
}

const SELECT_RECORD: &str = "SELECT local_path, remote_path, content_hash, content_length, uploaded_at, \
     cdn_url, status, remote_file_id, project_name, error_message FROM upload_records";

impl TransferStateStore {
    /// Opens (creating if needed) the ledger at `path` and makes sure the
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = TransferStateStore { pool };
        store.initialize().await?;
        info!("Opened upload ledger at {}", path.display());
        Ok(store)
    }

    /// A ledger that lives as long as the store does.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = TransferStateStore { pool };
        store.initialize().await?;
        Ok(store)
    }

    pub async fn initialize(&self) -> Result<(), LedgerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS upload_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                local_path TEXT NOT NULL,
                remote_path TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                content_length INTEGER NOT NULL,
                uploaded_at TEXT NOT NULL,
                cdn_url TEXT,
                status TEXT NOT NULL,
                remote_file_id TEXT,
                project_name TEXT NOT NULL,
                error_message TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_upload_records_local_path ON upload_records (local_path)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_upload(&self, record: &UploadRecord) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO upload_records (local_path, remote_path, content_hash, content_length, \
             uploaded_at, cdn_url, status, remote_file_id, project_name, error_message) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.local_path.to_string_lossy().into_owned())
        .bind(&record.remote_path)
        .bind(&record.content_hash)
        .bind(record.content_length as i64)
        .bind(record.uploaded_at)
        .bind(&record.cdn_url)
        .bind(record.status.as_str())
        .bind(&record.remote_file_id)
        .bind(&record.project_name)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;
        debug!(
            "Recorded {} upload of {}",
            record.status,
            record.local_path.display()
        );
        Ok(())
    }

    /// Whether the most recent successful upload of the path carried this
    /// content. Older uploads of the same content do not count, so a file
    /// reverted to an earlier version is uploaded again.
    pub async fn is_uploaded(&self, local_path: &Path, content_hash: &str) -> Result<bool, LedgerError> {
        let latest: Option<String> = sqlx::query_scalar(
            "SELECT content_hash FROM upload_records WHERE local_path = ? AND status = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(local_path.to_string_lossy().into_owned())
        .bind(UploadStatus::Uploaded.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(latest.is_some_and(|x| x.eq_ignore_ascii_case(content_hash)))
    }

    /// Most recent record for the path, whatever its status.
    pub async fn get_by_local_path(&self, local_path: &Path) -> Result<Option<UploadRecord>, LedgerError> {
        let row: Option<UploadRow> = sqlx::query_as(&format!(
            "{} WHERE local_path = ? ORDER BY id DESC LIMIT 1",
            SELECT_RECORD
        ))
        .bind(local_path.to_string_lossy().into_owned())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UploadRecord::from))
    }

    /// Most recent successful record for the path.
    pub async fn get_last_uploaded(&self, local_path: &Path) -> Result<Option<UploadRecord>, LedgerError> {
        let row: Option<UploadRow> = sqlx::query_as(&format!(
            "{} WHERE local_path = ? AND status = ? ORDER BY id DESC LIMIT 1",
            SELECT_RECORD
        ))
        .bind(local_path.to_string_lossy().into_owned())
        .bind(UploadStatus::Uploaded.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UploadRecord::from))
    }

    pub async fn get_count(&self) -> Result<u64, LedgerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// A page of records, newest first.
    pub async fn get_page(&self, offset: u64, limit: u64) -> Result<Vec<UploadRecord>, LedgerError> {
        let rows: Vec<UploadRow> = sqlx::query_as(&format!(
            "{} ORDER BY id DESC LIMIT ? OFFSET ?",
            SELECT_RECORD
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UploadRecord::from).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn success(path: &str, hash: &str) -> UploadRecord {
        UploadRecord::succeeded(
            Path::new(path),
            &format!("Racer/textures/{}", path),
            hash,
            42,
            Some(format!("https://cdn.example.com/Racer/textures/{}", path)),
            Some("file-1".to_string()),
            "Racer",
        )
    }

    #[tokio::test]
    async fn should_report_uploaded_only_for_successful_matching_hash() -> Result<(), Box<dyn std::error::Error>> {
        let store = TransferStateStore::in_memory().await?;
        store.save_upload(&success("a.png", "h1")).await?;
        store
            .save_upload(&UploadRecord::failed(Path::new("b.png"), "Racer/textures/b.png", "h2", 1, "Racer", "timeout"))
            .await?;

        assert!(store.is_uploaded(Path::new("a.png"), "h1").await?);
        assert!(!store.is_uploaded(Path::new("a.png"), "other").await?);
        assert!(!store.is_uploaded(Path::new("b.png"), "h2").await?);
        Ok(())
    }

    #[tokio::test]
    async fn should_only_match_latest_successful_upload() -> Result<(), Box<dyn std::error::Error>> {
        let store = TransferStateStore::in_memory().await?;
        store.save_upload(&success("a.png", "h1")).await?;
        store.save_upload(&success("a.png", "h2")).await?;
        store
            .save_upload(&UploadRecord::failed(Path::new("a.png"), "Racer/textures/a.png", "h1", 1, "Racer", "boom"))
            .await?;

        assert!(!store.is_uploaded(Path::new("a.png"), "h1").await?);
        assert!(store.is_uploaded(Path::new("a.png"), "h2").await?);
        Ok(())
    }

    #[tokio::test]
    async fn should_return_most_recent_record_for_path() -> Result<(), Box<dyn std::error::Error>> {
        let store = TransferStateStore::in_memory().await?;
        store.save_upload(&success("a.png", "h1")).await?;
        store.save_upload(&success("a.png", "h2")).await?;
        store
            .save_upload(&UploadRecord::failed(Path::new("a.png"), "Racer/textures/a.png", "h3", 1, "Racer", "boom"))
            .await?;

        let latest = store.get_by_local_path(Path::new("a.png")).await?.unwrap();
        let uploaded = store.get_last_uploaded(Path::new("a.png")).await?.unwrap();

        assert_eq!(latest.status, UploadStatus::Failed);
        assert_eq!(latest.error_message.as_deref(), Some("boom"));
        assert_eq!(uploaded.content_hash, "h2");
        assert_eq!(uploaded.local_path, PathBuf::from("a.png"));
        assert!(store.get_by_local_path(Path::new("missing.png")).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn should_page_newest_first() -> Result<(), Box<dyn std::error::Error>> {
        let store = TransferStateStore::in_memory().await?;
        for index in 0..5 {
            store.save_upload(&success(&format!("{}.png", index), "h")).await?;
        }

        let first = store.get_page(0, 2).await?;
        let last = store.get_page(4, 2).await?;

        assert_eq!(store.get_count().await?, 5);
        assert_eq!(
            first.iter().map(|x| x.local_path.clone()).collect::<Vec<_>>(),
            vec![PathBuf::from("4.png"), PathBuf::from("3.png")]
        );
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].local_path, PathBuf::from("0.png"));
        assert!(store.get_page(10, 2).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn should_survive_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("upload_history.db");

        let store = TransferStateStore::open(&path).await?;
        store.save_upload(&success("a.png", "h1")).await?;
        store.close().await;

        let reopened = TransferStateStore::open(&path).await?;
        assert!(reopened.is_uploaded(Path::new("a.png"), "h1").await?);
        assert_eq!(reopened.get_count().await?, 1);
        Ok(())
    }
}
