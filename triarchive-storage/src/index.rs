//! The `FileIndex` trait and its sqlite-backed implementation: a durable
//! keyed map of path to hash/size/mtime/upload metadata, backed by an
//! embedded relational database rather than a key-value store.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;
use triarchive_core::model::FileIndexRow;
use triarchive_core::{TriarchiveError, TriarchiveResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS all_files (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    size INTEGER,
    hash TEXT,
    modified INTEGER,
    uploaded INTEGER,
    cloud_only INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_all_files_path ON all_files(path);
";

/// A query against the index, mirroring the predicates §4.2's
/// `selectWhere` names: prefix, uploadedTime present, size absent,
/// cloudOnly.
#[derive(Debug, Clone, Default)]
pub struct FileQuery {
    pub path_prefix: Option<String>,
    pub uploaded_present: Option<bool>,
    pub size_absent: Option<bool>,
    pub cloud_only: Option<bool>,
}

/// Operations supported by a folder's FileIndex. All mutating methods
/// commit atomically; readers and writers are serialized per folder by
/// the implementation (an internal mutex), and different folders'
/// indices (separate instances, separate database files) run in
/// parallel.
#[async_trait]
pub trait FileIndex: Send + Sync {
    async fn get_all(&self) -> TriarchiveResult<Vec<FileIndexRow>>;
    async fn get(&self, path: &str) -> TriarchiveResult<Option<FileIndexRow>>;
    async fn upsert(&self, rows: Vec<FileIndexRow>) -> TriarchiveResult<()>;
    async fn clear_bytes(&self, paths: Vec<String>) -> TriarchiveResult<()>;
    async fn erase(&self, paths: Vec<String>) -> TriarchiveResult<()>;
    async fn erase_under_prefix(&self, prefixes: Vec<String>) -> TriarchiveResult<()>;
    async fn select_where(&self, query: FileQuery) -> TriarchiveResult<Vec<FileIndexRow>>;
}

/// Sqlite-backed `FileIndex`. One instance per folder, opened against
/// `<folderId>-<name>.sqlite` per §6.
pub struct SqliteFileIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFileIndex {
    pub fn open(path: impl AsRef<Path>) -> TriarchiveResult<Self> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> TriarchiveResult<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> TriarchiveResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("sqlite connection mutex poisoned");
            f(&guard)
        })
        .await
        .map_err(|e| TriarchiveError::Resource(format!("blocking task join failed: {e}")))?
        .map_err(sqlite_err)
    }
}

fn sqlite_err(err: rusqlite::Error) -> TriarchiveError {
    TriarchiveError::Resource(format!("sqlite error: {err}"))
}

fn row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<FileIndexRow> {
    let path: String = row.get("path")?;
    let size: Option<i64> = row.get("size")?;
    let hash: Option<String> = row.get("hash")?;
    let modified: Option<i64> = row.get("modified")?;
    let uploaded: Option<i64> = row.get("uploaded")?;
    let cloud_only: i64 = row.get("cloud_only")?;
    Ok(FileIndexRow {
        path,
        hash,
        mod_time: modified.and_then(micros_to_datetime),
        size,
        uploaded_time: uploaded.and_then(micros_to_datetime),
        cloud_only: cloud_only != 0,
    })
}

fn micros_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(micros).single()
}

fn datetime_to_micros(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

#[async_trait]
impl FileIndex for SqliteFileIndex {
    #[instrument(skip(self))]
    async fn get_all(&self) -> TriarchiveResult<Vec<FileIndexRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM all_files")?;
            let rows = stmt.query_map([], row_from_sql)?;
            rows.collect()
        })
        .await
    }

    async fn get(&self, path: &str) -> TriarchiveResult<Option<FileIndexRow>> {
        let path = path.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT * FROM all_files WHERE path = ?1", params![path], row_from_sql)
                .optional()
        })
        .await
    }

    #[instrument(skip(self, rows))]
    async fn upsert(&self, rows: Vec<FileIndexRow>) -> TriarchiveResult<()> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO all_files (path, size, hash, modified, uploaded, cloud_only)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(path) DO UPDATE SET
                        size = excluded.size,
                        hash = excluded.hash,
                        modified = excluded.modified,
                        uploaded = excluded.uploaded,
                        cloud_only = excluded.cloud_only",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        row.path,
                        row.size,
                        row.hash,
                        row.mod_time.map(datetime_to_micros),
                        row.uploaded_time.map(datetime_to_micros),
                        row.cloud_only as i64,
                    ])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn clear_bytes(&self, paths: Vec<String>) -> TriarchiveResult<()> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE all_files SET hash = NULL, modified = NULL, size = NULL WHERE path = ?1",
                )?;
                for path in &paths {
                    stmt.execute(params![path])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn erase(&self, paths: Vec<String>) -> TriarchiveResult<()> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare("DELETE FROM all_files WHERE path = ?1")?;
                for path in &paths {
                    stmt.execute(params![path])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn erase_under_prefix(&self, prefixes: Vec<String>) -> TriarchiveResult<()> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "DELETE FROM all_files WHERE (path = ?1 OR path LIKE ?2) AND cloud_only = 0",
                )?;
                for prefix in &prefixes {
                    let like_pattern = format!("{}/%", prefix.replace('%', "\\%").replace('_', "\\_"));
                    stmt.execute(params![prefix, like_pattern])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn select_where(&self, query: FileQuery) -> TriarchiveResult<Vec<FileIndexRow>> {
        self.with_conn(move |conn| {
            let mut clauses = Vec::new();
            let mut sql_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(prefix) = &query.path_prefix {
                clauses.push("(path = ? OR path LIKE ?)".to_string());
                sql_params.push(Box::new(prefix.clone()));
                sql_params.push(Box::new(format!("{prefix}/%")));
            }
            if let Some(uploaded_present) = query.uploaded_present {
                clauses.push(if uploaded_present {
                    "uploaded IS NOT NULL".to_string()
                } else {
                    "uploaded IS NULL".to_string()
                });
            }
            if let Some(size_absent) = query.size_absent {
                clauses.push(if size_absent {
                    "size IS NULL".to_string()
                } else {
                    "size IS NOT NULL".to_string()
                });
            }
            if let Some(cloud_only) = query.cloud_only {
                clauses.push("cloud_only = ?".to_string());
                sql_params.push(Box::new(cloud_only as i64));
            }

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let sql = format!("SELECT * FROM all_files {where_clause}");
            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> = sql_params.iter().map(|p| p.as_ref()).collect();
            let rows = stmt.query_map(param_refs.as_slice(), row_from_sql)?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_row(path: &str) -> FileIndexRow {
        FileIndexRow {
            path: path.to_string(),
            hash: Some("abc".to_string()),
            mod_time: Some(Utc::now()),
            size: Some(100),
            uploaded_time: Some(Utc::now()),
            cloud_only: false,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let index = SqliteFileIndex::open_in_memory().unwrap();
        index.upsert(vec![sample_row("a/b.txt")]).await.unwrap();
        let row = index.get("a/b.txt").await.unwrap().unwrap();
        assert_eq!(row.hash.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn upsert_is_insert_or_replace_on_conflict() {
        let index = SqliteFileIndex::open_in_memory().unwrap();
        index.upsert(vec![sample_row("a/b.txt")]).await.unwrap();
        let mut updated = sample_row("a/b.txt");
        updated.hash = Some("def".to_string());
        index.upsert(vec![updated]).await.unwrap();

        let all = index.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].hash.as_deref(), Some("def"));
    }

    #[tokio::test]
    async fn clear_bytes_preserves_row_but_nulls_fields() {
        let index = SqliteFileIndex::open_in_memory().unwrap();
        index.upsert(vec![sample_row("a/b.txt")]).await.unwrap();
        index.clear_bytes(vec!["a/b.txt".to_string()]).await.unwrap();
        let row = index.get("a/b.txt").await.unwrap().unwrap();
        assert!(row.hash.is_none());
        assert!(row.mod_time.is_none());
        assert!(row.size.is_none());
        assert!(row.uploaded_time.is_some());
    }

    #[tokio::test]
    async fn erase_under_prefix_excludes_cloud_only_rows() {
        let index = SqliteFileIndex::open_in_memory().unwrap();
        let mut cloud_row = sample_row("photos/2022/a.jpg");
        cloud_row.cloud_only = true;
        index
            .upsert(vec![sample_row("photos/2022/b.jpg"), cloud_row])
            .await
            .unwrap();

        index.erase_under_prefix(vec!["photos/2022".to_string()]).await.unwrap();

        let remaining = index.get_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path, "photos/2022/a.jpg");
    }

    #[tokio::test]
    async fn select_where_uploaded_present_and_size_absent_finds_deletion_missed_rows() {
        let index = SqliteFileIndex::open_in_memory().unwrap();
        let mut deletion_missed = sample_row("p");
        deletion_missed.size = None;
        deletion_missed.hash = None;
        deletion_missed.mod_time = None;
        index
            .upsert(vec![deletion_missed, sample_row("other")])
            .await
            .unwrap();

        let found = index
            .select_where(FileQuery {
                uploaded_present: Some(true),
                size_absent: Some(true),
                cloud_only: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "p");
    }

    #[tokio::test]
    async fn folders_run_independently_against_separate_databases() {
        let a = SqliteFileIndex::open_in_memory().unwrap();
        let b = SqliteFileIndex::open_in_memory().unwrap();
        tokio::join!(
            async { a.upsert(vec![sample_row("only-in-a")]).await.unwrap() },
            async { b.upsert(vec![sample_row("only-in-b")]).await.unwrap() },
        );
        assert_eq!(a.get_all().await.unwrap().len(), 1);
        assert_eq!(b.get_all().await.unwrap().len(), 1);
    }

    #[test]
    fn datetime_round_trips_through_micros() {
        let now = Utc::now() - Duration::nanoseconds(Utc::now().timestamp_subsec_nanos() as i64 % 1000);
        let micros = datetime_to_micros(now);
        let back = micros_to_datetime(micros).unwrap();
        assert_eq!(now.timestamp_micros(), back.timestamp_micros());
    }
}
