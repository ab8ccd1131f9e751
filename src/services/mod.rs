pub mod reaper;
pub mod record_locks;
pub mod upload_lifecycle;

pub use reaper::StaleUploadReaper;
pub use upload_lifecycle::{UploadError, UploadLifecycle, UploadResult};
