//! StaleUploadReaper: reclaims uploads that were never finalized.

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::upload_lifecycle::{UploadError, UploadResult, release_backend_state};
use crate::{models::FileRecord, repository::FileRepository, storage::StorageClient};

/// Records claimed per delete statement.
pub const REAP_BATCH_SIZE: u32 = 100;
/// Backend cleanups in flight at once after a batch is claimed.
const CLEANUP_CONCURRENCY: usize = 8;

#[derive(Clone)]
pub struct StaleUploadReaper {
    repo: FileRepository,
    storage: Arc<dyn StorageClient>,
    batch_size: u32,
}

impl StaleUploadReaper {
    pub fn new(repo: FileRepository, storage: Arc<dyn StorageClient>) -> Self {
        Self {
            repo,
            storage,
            batch_size: REAP_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Reclaim every in-progress upload older than `retention`.
    /// Returns the number of records removed.
    pub async fn reap_stale(&self, retention: Duration) -> UploadResult<u64> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|_| UploadError::Validation("retention window is too large".into()))?;
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .ok_or_else(|| UploadError::Validation("retention window is too large".into()))?;
        self.reap_created_before(cutoff).await
    }

    /// Reclaim every in-progress upload created before `cutoff`, one batch
    /// at a time, until a batch comes back empty.
    pub async fn reap_created_before(&self, cutoff: DateTime<Utc>) -> UploadResult<u64> {
        let mut total = 0u64;
        loop {
            let reclaimed = self.reap_batch(cutoff).await?;
            if reclaimed.is_empty() {
                break;
            }
            total += reclaimed.len() as u64;
            debug!(batch = reclaimed.len(), total, "reaped stale batch");
            self.release_all(reclaimed).await;
        }

        if total > 0 {
            info!(total, cutoff = %cutoff, "reclaimed stale uploads");
        }
        Ok(total)
    }

    /// Claim one batch. Selection and deletion are a single statement, so a
    /// finalize landing first keeps its record out of the batch.
    async fn reap_batch(&self, cutoff: DateTime<Utc>) -> UploadResult<Vec<FileRecord>> {
        Ok(self.repo.take_stale(cutoff, self.batch_size).await?)
    }

    /// Cleanup once the rows are gone; a failing record is logged and skipped.
    async fn release_all(&self, files: Vec<FileRecord>) {
        stream::iter(files)
            .for_each_concurrent(CLEANUP_CONCURRENCY, |file| async move {
                if let Err(err) = release_backend_state(self.storage.as_ref(), &file).await {
                    warn!(
                        file_id = %file.id,
                        key = %file.storage_key(),
                        "failed to release backend state of stale upload: {}",
                        err
                    );
                }
            })
            .await;
    }
}
