//! UploadLifecycle: the upload state machine.
//!
//! No database transaction or write lock is held while the storage backend
//! is called. Each state change is one conditional statement, and a change
//! that finds the record already removed or finalized elsewhere makes
//! the operation fail with `NotFound` after undoing its own backend work.
//! Operations that transition a record take its [`RecordLocks`] entry, so
//! two transitions of the same record never interleave in this process.
//! Multipart part uploads take no lock.

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::record_locks::RecordLocks;
use crate::{
    models::{FilePart, FileRecord, MAX_FIELD_LEN, NewUpload},
    repository::{FilePage, FileRepository, ListCursor, RecordScope},
    storage::{StorageClient, StorageError},
};

pub const DEFAULT_LIST_LIMIT: u32 = 20;
pub const MAX_LIST_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(#[from] StorageError),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Database(sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

// SQLITE_BUSY and SQLITE_LOCKED; extended codes carry the primary code in the low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

fn is_lock_contention(err: &sqlx::Error) -> bool {
    let Some(db_err) = err.as_database_error() else {
        return false;
    };
    let by_code = db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED));
    by_code || db_err.message().contains("database is locked")
}

impl From<sqlx::Error> for UploadError {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_contention(&err) {
            UploadError::Conflict(format!("concurrent modification, retry later: {}", err))
        } else {
            UploadError::Database(err)
        }
    }
}

fn not_found(id: Uuid) -> UploadError {
    UploadError::NotFound(format!("file `{}` not found", id))
}

fn validate_filename(filename: &str) -> UploadResult<()> {
    if filename.is_empty() {
        return Err(UploadError::Validation("filename must not be empty".into()));
    }
    if filename.chars().count() > MAX_FIELD_LEN {
        return Err(UploadError::Validation(format!(
            "filename must be at most {} characters",
            MAX_FIELD_LEN
        )));
    }
    if filename
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(UploadError::Validation(
            "filename must not contain path separators or control characters".into(),
        ));
    }
    if filename == "." || filename == ".." {
        return Err(UploadError::Validation(format!(
            "`{}` is not a valid filename",
            filename
        )));
    }
    Ok(())
}

fn normalize_mime_type(mime_type: Option<String>) -> UploadResult<Option<String>> {
    match mime_type {
        Some(mime) if mime.is_empty() => Ok(None),
        Some(mime) if mime.chars().count() > MAX_FIELD_LEN => Err(UploadError::Validation(
            format!("mime_type must be at most {} characters", MAX_FIELD_LEN),
        )),
        other => Ok(other),
    }
}

fn validate_parts(parts: &[FilePart]) -> UploadResult<()> {
    if parts.is_empty() {
        return Err(UploadError::Validation(
            "at least one part hash is required".into(),
        ));
    }
    for part in parts {
        if part.part_number == 0 {
            return Err(UploadError::Validation(
                "part numbers must be positive".into(),
            ));
        }
        if part.hash.is_empty() {
            return Err(UploadError::Validation(format!(
                "hash of part {} must not be empty",
                part.part_number
            )));
        }
    }
    Ok(())
}

/// Release whatever backend state a removed record still owned.
///
/// An open multipart session is aborted and a finalized object is deleted.
/// An unfinalized single-part upload has nothing stored yet.
pub(crate) async fn release_backend_state(
    storage: &dyn StorageClient,
    file: &FileRecord,
) -> Result<(), StorageError> {
    let key = file.storage_key();
    if let Some(token) = file.multipart_token.as_deref() {
        if !file.is_finalized() {
            storage.multipart_abort(&key, token).await?;
            debug!(file_id = %file.id, key = %key, "aborted multipart session");
        }
    } else if file.is_finalized() {
        storage.delete(&key).await?;
        debug!(file_id = %file.id, key = %key, "deleted stored object");
    }
    Ok(())
}

/// Drives uploads from creation to finalization (or abort/delete), keeping
/// the metadata database and the storage backend consistent.
#[derive(Clone)]
pub struct UploadLifecycle {
    repo: FileRepository,
    storage: Arc<dyn StorageClient>,
    chunk_size: u64,
    locks: Arc<RecordLocks>,
}

impl UploadLifecycle {
    /// Uploads whose declared size is at least `chunk_size` bytes go through
    /// a multipart session.
    pub fn new(repo: FileRepository, storage: Arc<dyn StorageClient>, chunk_size: u64) -> Self {
        Self {
            repo,
            storage,
            chunk_size,
            locks: Arc::new(RecordLocks::new()),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn storage(&self) -> &Arc<dyn StorageClient> {
        &self.storage
    }

    pub fn repository(&self) -> &FileRepository {
        &self.repo
    }

    /// Create a new upload record, opening a multipart session when the
    /// declared size reaches the chunk threshold.
    pub async fn create(&self, request: NewUpload) -> UploadResult<FileRecord> {
        validate_filename(&request.filename)?;
        let mime_type = normalize_mime_type(request.mime_type)?;
        if request.size < 0 {
            return Err(UploadError::Validation("size must not be negative".into()));
        }

        let mut file = FileRecord {
            id: Uuid::new_v4(),
            filename: request.filename,
            mime_type,
            size: request.size,
            multipart_token: None,
            created_at: Utc::now(),
            finalized_at: None,
        };

        if request.size as u64 >= self.chunk_size {
            let token = self.storage.multipart_init(&file.storage_key()).await?;
            file.multipart_token = Some(token);
        }

        if let Err(err) = self.repo.insert(&file).await {
            if let Some(token) = file.multipart_token.as_deref() {
                if let Err(abort_err) = self
                    .storage
                    .multipart_abort(&file.storage_key(), token)
                    .await
                {
                    warn!(
                        file_id = %file.id,
                        "failed to abandon multipart session after insert failure: {}",
                        abort_err
                    );
                }
            }
            return Err(err.into());
        }

        info!(
            file_id = %file.id,
            size = file.size,
            multipart = file.multipart_token.is_some(),
            "created upload"
        );
        Ok(file)
    }

    /// Look up a record in any state.
    pub async fn get(&self, id: Uuid) -> UploadResult<FileRecord> {
        self.repo.find(id).await?.ok_or_else(|| not_found(id))
    }

    /// Page through finalized files, oldest first.
    pub async fn list_finalized(
        &self,
        limit: Option<u32>,
        continuation_token: Option<&str>,
    ) -> UploadResult<FilePage> {
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let cursor = match continuation_token.filter(|t| !t.is_empty()) {
            Some(token) => Some(ListCursor::decode(token).ok_or_else(|| {
                UploadError::Validation("invalid continuation token".into())
            })?),
            None => None,
        };
        Ok(self.repo.list_finalized(cursor.as_ref(), limit).await?)
    }

    /// Upload content to an in-progress record.
    ///
    /// Multipart uploads need a part number and return the backend's hash
    /// for that part. Single-part uploads take no part number, store the
    /// whole object and finalize the record.
    pub async fn upload_content(
        &self,
        id: Uuid,
        content: Bytes,
        part: Option<u32>,
    ) -> UploadResult<Option<String>> {
        let file = self
            .repo
            .find_in(id, RecordScope::NotFinalized)
            .await?
            .ok_or_else(|| not_found(id))?;

        if let Some(token) = file.multipart_token.as_deref() {
            let part_number = match part {
                Some(n) if n >= 1 => n,
                Some(_) => {
                    return Err(UploadError::Validation(
                        "part numbers must be positive".into(),
                    ));
                }
                None => {
                    return Err(UploadError::Validation(
                        "a part number is required for multipart uploads".into(),
                    ));
                }
            };
            let hash = match self
                .storage
                .multipart_upload_part(&file.storage_key(), token, part_number, content)
                .await
            {
                Ok(hash) => hash,
                Err(err) => return Err(self.session_failure(id, err).await),
            };
            debug!(file_id = %id, part = part_number, "uploaded part");
            return Ok(Some(hash));
        }

        if part.is_some() {
            return Err(UploadError::Validation(
                "single-part uploads do not take a part number".into(),
            ));
        }

        let _guard = self.locks.acquire(id).await;
        let file = self
            .repo
            .find_in(id, RecordScope::NotFinalized)
            .await?
            .filter(|file| file.multipart_token.is_none())
            .ok_or_else(|| not_found(id))?;
        let key = file.storage_key();

        self.storage.put(&key, content).await?;
        if !self.repo.mark_finalized(id, None, Utc::now()).await? {
            self.discard_orphan(id, &key).await?;
            return Err(not_found(id));
        }
        info!(file_id = %id, "finalized single-part upload");
        Ok(None)
    }

    /// Assemble the uploaded parts, in the given order, and finalize the record.
    pub async fn finalize(&self, id: Uuid, parts: &[FilePart]) -> UploadResult<()> {
        validate_parts(parts)?;

        let _guard = self.locks.acquire(id).await;
        let file = self
            .repo
            .find_in(id, RecordScope::MultipartNotFinalized)
            .await?
            .ok_or_else(|| not_found(id))?;
        let token = file.multipart_token.as_deref().ok_or_else(|| not_found(id))?;
        let key = file.storage_key();

        if let Err(err) = self.storage.multipart_finalize(&key, token, parts).await {
            return Err(self.session_failure(id, err).await);
        }
        if !self.repo.mark_finalized(id, Some(token), Utc::now()).await? {
            self.discard_orphan(id, &key).await?;
            return Err(not_found(id));
        }

        info!(file_id = %id, parts = parts.len(), "finalized multipart upload");
        Ok(())
    }

    /// Discard an open multipart upload and its record.
    pub async fn abort(&self, id: Uuid) -> UploadResult<()> {
        let _guard = self.locks.acquire(id).await;
        let file = self
            .repo
            .find_in(id, RecordScope::MultipartNotFinalized)
            .await?
            .ok_or_else(|| not_found(id))?;
        let token = file.multipart_token.as_deref().ok_or_else(|| not_found(id))?;

        if let Err(err) = self
            .storage
            .multipart_abort(&file.storage_key(), token)
            .await
        {
            return Err(self.session_failure(id, err).await);
        }
        if !self.repo.delete_open_session(id, token).await? {
            return Err(not_found(id));
        }

        info!(file_id = %id, "aborted multipart upload");
        Ok(())
    }

    /// Delete a record in any state. Backend state owed by the record is
    /// released only once the row is gone.
    pub async fn delete(&self, id: Uuid) -> UploadResult<()> {
        let _guard = self.locks.acquire(id).await;
        let file = self.repo.delete(id).await?.ok_or_else(|| not_found(id))?;

        info!(file_id = %id, "deleted file record");
        release_backend_state(self.storage.as_ref(), &file).await?;
        Ok(())
    }

    /// Map a failed session call. A session the backend no longer knows
    /// because the record was reaped or deleted meanwhile is `NotFound`.
    async fn session_failure(&self, id: Uuid, err: StorageError) -> UploadError {
        match self
            .repo
            .find_in(id, RecordScope::MultipartNotFinalized)
            .await
        {
            Ok(None) => not_found(id),
            Ok(Some(_)) => UploadError::Backend(err),
            Err(db_err) => db_err.into(),
        }
    }

    /// Remove an object written for a record that disappeared before it
    /// could be marked finalized.
    async fn discard_orphan(&self, id: Uuid, key: &str) -> UploadResult<()> {
        if self.repo.find(id).await?.is_none() {
            self.storage.delete(key).await?;
            debug!(file_id = %id, key, "discarded object of removed record");
        }
        Ok(())
    }

    /// Records with a transition in flight in this process.
    pub fn records_in_flight(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(n: u32, hash: &str) -> FilePart {
        FilePart {
            part_number: n,
            hash: hash.into(),
        }
    }

    #[test]
    fn filenames_are_validated() {
        assert!(validate_filename("report.pdf").is_ok());
        assert!(validate_filename(&"a".repeat(MAX_FIELD_LEN)).is_ok());

        for bad in ["", "..", "a/b", "a\\b", "line\nbreak"] {
            assert!(
                matches!(validate_filename(bad), Err(UploadError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_filename(&"a".repeat(MAX_FIELD_LEN + 1)).is_err());
    }

    #[test]
    fn empty_mime_type_becomes_none() {
        assert_eq!(normalize_mime_type(Some(String::new())).unwrap(), None);
        assert_eq!(
            normalize_mime_type(Some("text/plain".into())).unwrap(),
            Some("text/plain".into())
        );
        assert!(normalize_mime_type(Some("x".repeat(MAX_FIELD_LEN + 1))).is_err());
    }

    #[test]
    fn finalize_parts_are_validated() {
        assert!(validate_parts(&[part(1, "abc")]).is_ok());
        assert!(validate_parts(&[]).is_err());
        assert!(validate_parts(&[part(0, "abc")]).is_err());
        assert!(validate_parts(&[part(1, "")]).is_err());
    }

    #[test]
    fn non_database_errors_are_not_conflicts() {
        assert!(matches!(
            UploadError::from(sqlx::Error::RowNotFound),
            UploadError::Database(_)
        ));
        assert!(matches!(
            UploadError::from(sqlx::Error::PoolTimedOut),
            UploadError::Database(_)
        ));
    }
}
