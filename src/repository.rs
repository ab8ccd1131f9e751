//! FileRepository: persistence for [`FileRecord`] rows in SQLite.
//!
//! No method holds a transaction or the database write lock while the
//! caller talks to the storage backend. State changes are single
//! conditional statements (`UPDATE`/`DELETE ... WHERE <expected state>`),
//! and the affected row count tells the caller whether it won a race
//! against a concurrent abort, delete or reap. SQLite has no row locks, so
//! this is the only cross-process exclusion available.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    QueryBuilder, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::debug;
use uuid::Uuid;

use crate::models::FileRecord;

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");
const FILE_COLUMNS: &str = "id, filename, mime_type, size, multipart_token, created_at, finalized_at";

/// Open a pool for `database_url`, creating the database file if missing.
pub async fn connect(database_url: &str) -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> sqlx::Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

/// Which records a state-restricted lookup may return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordScope {
    /// Uploads still in progress.
    NotFinalized,
    /// In-progress uploads with an open multipart session.
    MultipartNotFinalized,
}

impl RecordScope {
    fn predicate(self) -> &'static str {
        match self {
            RecordScope::NotFinalized => " AND finalized_at IS NULL",
            RecordScope::MultipartNotFinalized => {
                " AND finalized_at IS NULL AND multipart_token IS NOT NULL"
            }
        }
    }
}

/// Position after the last record of a page of finalized files.
#[derive(Clone, Debug, PartialEq)]
pub struct ListCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl ListCursor {
    pub fn for_record(file: &FileRecord) -> Self {
        Self {
            created_at: file.created_at,
            id: file.id,
        }
    }

    /// Opaque token handed to clients.
    pub fn encode(&self) -> String {
        let raw = format!(
            "{}|{}",
            self.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.id
        );
        general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    /// Parse a token produced by [`ListCursor::encode`].
    pub fn decode(token: &str) -> Option<Self> {
        let bytes = general_purpose::URL_SAFE_NO_PAD.decode(token).ok()?;
        let raw = String::from_utf8(bytes).ok()?;
        let (created_at, id) = raw.split_once('|')?;
        Some(Self {
            created_at: DateTime::parse_from_rfc3339(created_at)
                .ok()?
                .with_timezone(&Utc),
            id: Uuid::parse_str(id).ok()?,
        })
    }
}

/// One page of finalized files.
#[derive(Debug)]
pub struct FilePage {
    pub files: Vec<FileRecord>,
    pub next: Option<ListCursor>,
}

#[derive(Clone)]
pub struct FileRepository {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl FileRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, file: &FileRecord) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO files (id, filename, mime_type, size, multipart_token, created_at, finalized_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(file.id)
        .bind(&file.filename)
        .bind(&file.mime_type)
        .bind(file.size)
        .bind(&file.multipart_token)
        .bind(file.created_at)
        .bind(file.finalized_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Plain (non-locking) lookup of a record in any state.
    pub async fn find(&self, id: Uuid) -> sqlx::Result<Option<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?"))
            .bind(id)
            .fetch_optional(&*self.db)
            .await
    }

    /// Plain lookup of a record restricted to `scope`.
    pub async fn find_in(&self, id: Uuid, scope: RecordScope) -> sqlx::Result<Option<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ?{}",
            scope.predicate()
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await
    }

    /// Mark an in-progress record complete: set `finalized_at` and clear
    /// the token. Applies only while the record is unfinalized and still
    /// carries `expected_token`; returns whether it did.
    pub async fn mark_finalized(
        &self,
        id: Uuid,
        expected_token: Option<&str>,
        finalized_at: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE files SET finalized_at = ?, multipart_token = NULL
             WHERE id = ? AND finalized_at IS NULL AND multipart_token IS ?",
        )
        .bind(finalized_at)
        .bind(id)
        .bind(expected_token)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete a record in any state, returning it as it was when removed.
    pub async fn delete(&self, id: Uuid) -> sqlx::Result<Option<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "DELETE FROM files WHERE id = ? RETURNING {FILE_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Delete an unfinalized multipart record that still carries `token`.
    pub async fn delete_open_session(&self, id: Uuid, token: &str) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "DELETE FROM files
             WHERE id = ? AND finalized_at IS NULL AND multipart_token = ?",
        )
        .bind(id)
        .bind(token)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Atomically remove up to `limit` in-progress records created before
    /// `cutoff`, oldest first, and return them. Selection and deletion are
    /// one statement, so a record finalized concurrently is either removed
    /// before the finalize lands or not selected at all.
    pub async fn take_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> sqlx::Result<Vec<FileRecord>> {
        let sql = format!(
            "DELETE FROM files WHERE id IN (
                 SELECT id FROM files
                 WHERE finalized_at IS NULL AND created_at < ?
                 ORDER BY created_at ASC
                 LIMIT ?
             ) RETURNING {FILE_COLUMNS}"
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&*self.db)
            .await
    }

    /// Finalized records ordered by `(created_at, id)`, starting after
    /// `after`. Returns at most `limit` records and the cursor for the next
    /// page when more exist.
    pub async fn list_finalized(
        &self,
        after: Option<&ListCursor>,
        limit: u32,
    ) -> sqlx::Result<FilePage> {
        let fetch_limit = limit as i64 + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE finalized_at IS NOT NULL"
        ));
        if let Some(cursor) = after {
            builder.push(" AND (created_at > ");
            builder.push_bind(cursor.created_at);
            builder.push(" OR (created_at = ");
            builder.push_bind(cursor.created_at);
            builder.push(" AND id > ");
            builder.push_bind(cursor.id);
            builder.push("))");
        }
        builder.push(" ORDER BY created_at ASC, id ASC LIMIT ");
        builder.push_bind(fetch_limit);

        let mut files: Vec<FileRecord> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut next = None;
        if files.len() as i64 == fetch_limit {
            files.pop();
            next = files.last().map(ListCursor::for_record);
        }
        Ok(FilePage { files, next })
    }

    /// Round trip to the database for readiness checks.
    pub async fn ping(&self) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
    }
}
