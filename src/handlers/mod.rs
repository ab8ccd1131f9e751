pub mod file_handlers;
pub mod health_handlers;

use crate::services::UploadLifecycle;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: UploadLifecycle,
    /// Largest upload body read into memory, in bytes.
    pub max_body_size: usize,
}

impl AppState {
    pub fn new(lifecycle: UploadLifecycle, max_body_size: usize) -> Self {
        Self {
            lifecycle,
            max_body_size,
        }
    }
}
