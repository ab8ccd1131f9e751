//! Object storage backends.
//!
//! The upload core only talks to storage through [`StorageClient`]. Keys are
//! derived from file records (`{id}/{filename}`), so blobs are meaningless
//! without the metadata database.

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

use crate::models::FilePart;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("multipart session `{0}` not found")]
    UnknownSession(String),
    #[error("part {part} rejected: {reason}")]
    PartMismatch { part: u32, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Capability set the upload lifecycle needs from a storage backend.
///
/// Multipart operations are keyed by the object key plus the opaque session
/// token returned from [`StorageClient::multipart_init`].
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn put(&self, key: &str, content: Bytes) -> StorageResult<()>;

    /// Fails with [`StorageError::NotFound`] when the object is absent.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Removing an absent object is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn has(&self, key: &str) -> StorageResult<bool>;

    /// Public URL for `key`, if the backend can serve one.
    fn url(&self, key: &str) -> Option<String>;

    /// Open a multipart session and return its token.
    async fn multipart_init(&self, key: &str) -> StorageResult<String>;

    /// Store one part and return its content hash.
    async fn multipart_upload_part(
        &self,
        key: &str,
        token: &str,
        part_number: u32,
        content: Bytes,
    ) -> StorageResult<String>;

    /// Verify the hashes and assemble the parts, in the given order, into the
    /// object at `key`. The session is closed on success.
    async fn multipart_finalize(
        &self,
        key: &str,
        token: &str,
        parts: &[FilePart],
    ) -> StorageResult<()>;

    /// Discard the session and every part uploaded to it.
    async fn multipart_abort(&self, key: &str, token: &str) -> StorageResult<()>;
}

/// Hex MD5 of a part, used as its hash by the bundled backends.
pub(crate) fn part_hash(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}
