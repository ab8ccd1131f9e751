//! Defines routes for the upload API.
//!
//! ## Structure
//! - **File endpoints**
//!   - `GET    /files` - list finalized files (supports limit, continuation-token)
//!   - `POST   /files` - start an upload
//!   - `GET    /files/{id}` - view a file and its next links
//!   - `DELETE /files/{id}` - delete a file in any state
//!
//! - **Upload endpoints**
//!   - `POST   /files/{id}/upload` - single-part content, or one part with `?part=N`
//!   - `POST   /files/{id}/finalize` - assemble a multipart upload
//!   - `DELETE /files/{id}/abort` - discard a multipart upload
//!
//! - `GET /objects/{*key}` serves finalized content; the wildcard keeps the
//!   `{id}/{filename}` key intact.

use crate::handlers::{
    AppState,
    file_handlers::{
        abort_file, create_file, delete_file, finalize_file, get_object, list_files,
        upload_content, view_file,
    },
    health_handlers::{healthz, readyz},
};
use axum::{
    Router,
    routing::{delete, get, post},
};

/// Build the router for the upload API.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/files", get(list_files).post(create_file))
        .route("/files/{id}", get(view_file).delete(delete_file))
        .route("/files/{id}/upload", post(upload_content))
        .route("/files/{id}/finalize", post(finalize_file))
        .route("/files/{id}/abort", delete(abort_file))
        .route("/objects/{*key}", get(get_object))
}
