//! Represents an uploaded (or in-progress) file and its upload state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::storage::StorageClient;

/// Maximum length of `filename` and `mime_type`, matching the column limits.
pub const MAX_FIELD_LEN: usize = 255;

/// Persistent metadata for a single upload.
///
/// Only the stored columns live here. Everything a client sees about the
/// upload's state (`is_finalized`, `is_multipart`, `url`, the storage key) is
/// computed from these fields on every read and never written back.
#[derive(Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    /// Server-generated identifier, immutable.
    pub id: Uuid,

    /// Display name. Immutable, because it is part of the storage key.
    pub filename: String,

    /// Content type (MIME type), if the client declared one.
    pub mime_type: Option<String>,

    /// Declared size in bytes. Fixes the chunking strategy at creation.
    pub size: i64,

    /// Multipart session handle issued by the backend while a multipart
    /// upload is open.
    pub multipart_token: Option<String>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the upload completed; `None` while it is still in progress.
    pub finalized_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// `true` once the content is complete and retrievable.
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// Chunking strategy of an in-progress upload.
    ///
    /// Finalized files no longer expose how they were uploaded, so this is
    /// `None` for them.
    pub fn is_multipart(&self) -> Option<bool> {
        if self.is_finalized() {
            None
        } else {
            Some(self.multipart_token.is_some())
        }
    }

    /// Backend object key: `{id}/{filename}`.
    pub fn storage_key(&self) -> String {
        storage_key(self.id, &self.filename)
    }

    /// Public URL of the content, resolvable only once finalized.
    pub fn url(&self, storage: &dyn StorageClient) -> Option<String> {
        if !self.is_finalized() {
            return None;
        }
        storage.url(&self.storage_key())
    }

    /// Client-facing projection with the derived fields filled in.
    pub fn to_view(&self, storage: &dyn StorageClient) -> FileView {
        FileView {
            id: self.id,
            filename: self.filename.clone(),
            mime_type: self.mime_type.clone(),
            size: self.size,
            is_multipart: self.is_multipart(),
            is_finalized: self.is_finalized(),
            url: self.url(storage),
            created_at: self.created_at,
            finalized_at: self.finalized_at,
        }
    }
}

/// Derive the backend key for a record. Both inputs are immutable, so the
/// key is stable for the life of the record.
pub fn storage_key(id: Uuid, filename: &str) -> String {
    format!("{}/{}", id, filename)
}

/// Serialized form of a [`FileRecord`]. Never carries the multipart token.
#[derive(Serialize, Clone, Debug)]
pub struct FileView {
    pub id: Uuid,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size: i64,
    pub is_multipart: Option<bool>,
    pub is_finalized: bool,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Request to start a new upload.
#[derive(Deserialize, Clone, Debug)]
pub struct NewUpload {
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub size: i64,
}

/// One entry of the ordered part list sent to finalize a multipart upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FilePart {
    /// Part number (1-based).
    #[serde(rename = "part")]
    pub part_number: u32,

    /// Hash returned by the backend when the part was uploaded.
    pub hash: String,
}
