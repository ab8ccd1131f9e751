//! Core data model for upload metadata.
//!
//! `FileRecord` maps to the `files` table via `sqlx::FromRow`; `FileView`
//! is what clients see, serialized via `serde`.

pub mod file;

pub use file::{FilePart, FileRecord, FileView, NewUpload, MAX_FIELD_LEN};
