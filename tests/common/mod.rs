#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use file_uploads::{
    models::{FilePart, NewUpload},
    repository::{self, FileRepository},
    services::{StaleUploadReaper, UploadLifecycle},
    storage::{LocalStorage, MemoryStorage, StorageClient, StorageError, StorageResult},
};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

pub const MIB: u64 = 1024 * 1024;
/// Threshold used by most tests: 2 MiB.
pub const CHUNK_SIZE: u64 = 2 * MIB;

/// Storage that delegates to a [`MemoryStorage`] until told to fail.
#[derive(Default)]
pub struct FailingStorage {
    pub inner: MemoryStorage,
    pub fail_put: AtomicBool,
    pub fail_init: AtomicBool,
    pub fail_finalize: AtomicBool,
    pub fail_abort: AtomicBool,
}

fn injected() -> StorageError {
    StorageError::Io(io::Error::other("injected failure"))
}

fn check(flag: &AtomicBool) -> StorageResult<()> {
    if flag.load(Ordering::SeqCst) {
        Err(injected())
    } else {
        Ok(())
    }
}

#[async_trait]
impl StorageClient for FailingStorage {
    async fn put(&self, key: &str, content: Bytes) -> StorageResult<()> {
        check(&self.fail_put)?;
        self.inner.put(key, content).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        self.inner.has(key).await
    }

    fn url(&self, key: &str) -> Option<String> {
        self.inner.url(key)
    }

    async fn multipart_init(&self, key: &str) -> StorageResult<String> {
        check(&self.fail_init)?;
        self.inner.multipart_init(key).await
    }

    async fn multipart_upload_part(
        &self,
        key: &str,
        token: &str,
        part_number: u32,
        content: Bytes,
    ) -> StorageResult<String> {
        self.inner
            .multipart_upload_part(key, token, part_number, content)
            .await
    }

    async fn multipart_finalize(
        &self,
        key: &str,
        token: &str,
        parts: &[FilePart],
    ) -> StorageResult<()> {
        check(&self.fail_finalize)?;
        self.inner.multipart_finalize(key, token, parts).await
    }

    async fn multipart_abort(&self, key: &str, token: &str) -> StorageResult<()> {
        check(&self.fail_abort)?;
        self.inner.multipart_abort(key, token).await
    }
}

/// Holds armed backend calls open until [`Gate::open`] is called, so a
/// test can act while another operation is stuck in the backend.
pub struct Gate {
    permits: Semaphore,
    entered: Notify,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            permits: Semaphore::new(0),
            entered: Notify::new(),
        }
    }
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        let _permit = self.permits.acquire().await.unwrap();
    }

    /// Wait until some call is held at the gate.
    pub async fn entered(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.entered.notified())
            .await
            .expect("no backend call reached the gate");
    }

    /// Let every held call, and every later one, through.
    pub fn open(&self) {
        self.permits.add_permits(1024);
    }
}

/// Storage over a [`MemoryStorage`] whose armed calls wait at a [`Gate`].
///
/// `hold_put` and `hold_finalize` gate before delegating; `hold_finalize_reply`
/// gates after the backend already assembled the object. `hold_part` gates
/// the part with that number (0 gates none).
#[derive(Default)]
pub struct GatedStorage {
    pub inner: MemoryStorage,
    pub gate: Gate,
    pub hold_put: AtomicBool,
    pub hold_part: AtomicU32,
    pub hold_finalize: AtomicBool,
    pub hold_finalize_reply: AtomicBool,
}

#[async_trait]
impl StorageClient for GatedStorage {
    async fn put(&self, key: &str, content: Bytes) -> StorageResult<()> {
        if self.hold_put.load(Ordering::SeqCst) {
            self.gate.pass().await;
        }
        self.inner.put(key, content).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        self.inner.has(key).await
    }

    fn url(&self, key: &str) -> Option<String> {
        self.inner.url(key)
    }

    async fn multipart_init(&self, key: &str) -> StorageResult<String> {
        self.inner.multipart_init(key).await
    }

    async fn multipart_upload_part(
        &self,
        key: &str,
        token: &str,
        part_number: u32,
        content: Bytes,
    ) -> StorageResult<String> {
        if self.hold_part.load(Ordering::SeqCst) == part_number {
            self.gate.pass().await;
        }
        self.inner
            .multipart_upload_part(key, token, part_number, content)
            .await
    }

    async fn multipart_finalize(
        &self,
        key: &str,
        token: &str,
        parts: &[FilePart],
    ) -> StorageResult<()> {
        if self.hold_finalize.load(Ordering::SeqCst) {
            self.gate.pass().await;
        }
        let result = self.inner.multipart_finalize(key, token, parts).await;
        if self.hold_finalize_reply.load(Ordering::SeqCst) {
            self.gate.pass().await;
        }
        result
    }

    async fn multipart_abort(&self, key: &str, token: &str) -> StorageResult<()> {
        self.inner.multipart_abort(key, token).await
    }
}

/// A fresh database in a temp dir plus services over the given storage.
pub struct TestEnv<S> {
    _dir: TempDir,
    pub repo: FileRepository,
    pub storage: Arc<S>,
    pub lifecycle: UploadLifecycle,
    pub reaper: StaleUploadReaper,
}

impl<S> TestEnv<S> {
    /// Number of rows in the `files` table, in any state.
    pub async fn row_count(&self) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files")
            .fetch_one(&*self.repo.db)
            .await
            .unwrap()
    }
}

pub async fn setup_with<S: StorageClient + 'static>(storage: S, chunk_size: u64) -> TestEnv<S> {
    setup_in(tempfile::tempdir().unwrap(), storage, chunk_size).await
}

async fn setup_in<S: StorageClient + 'static>(
    dir: TempDir,
    storage: S,
    chunk_size: u64,
) -> TestEnv<S> {
    let url = format!("sqlite://{}", dir.path().join("uploads.db").display());
    let pool = repository::connect(&url).await.unwrap();
    repository::run_migrations(&pool).await.unwrap();

    let repo = FileRepository::new(Arc::new(pool));
    let storage = Arc::new(storage);
    let dyn_storage: Arc<dyn StorageClient> = storage.clone();
    TestEnv {
        _dir: dir,
        lifecycle: UploadLifecycle::new(repo.clone(), dyn_storage.clone(), chunk_size),
        reaper: StaleUploadReaper::new(repo.clone(), dyn_storage),
        repo,
        storage,
    }
}

pub async fn setup() -> TestEnv<MemoryStorage> {
    setup_with(MemoryStorage::new(None), CHUNK_SIZE).await
}

pub async fn setup_failing() -> TestEnv<FailingStorage> {
    setup_with(FailingStorage::default(), CHUNK_SIZE).await
}

pub async fn setup_gated() -> TestEnv<GatedStorage> {
    setup_with(GatedStorage::default(), CHUNK_SIZE).await
}

/// Services over a [`LocalStorage`] rooted next to the database.
pub async fn setup_local() -> TestEnv<LocalStorage> {
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(dir.path().join("objects"), None).unwrap();
    setup_in(dir, storage, CHUNK_SIZE).await
}

pub fn upload(filename: &str, size: u64) -> NewUpload {
    NewUpload {
        filename: filename.into(),
        mime_type: Some("application/octet-stream".into()),
        size: size as i64,
    }
}

pub fn part(part_number: u32, hash: impl Into<String>) -> FilePart {
    FilePart {
        part_number,
        hash: hash.into(),
    }
}
