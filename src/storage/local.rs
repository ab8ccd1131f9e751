//! Local filesystem backend.
//!
//! Objects live beneath `base_path/objects/{shard}/{shard}/{key}`; open
//! multipart sessions are staged in `base_path/.multipart/{token}/`, one file
//! per part plus a `key` file binding the session to its object key.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use super::{StorageClient, StorageError, StorageResult, part_hash};
use crate::models::FilePart;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const OBJECTS_DIR: &str = "objects";
const MULTIPART_DIR: &str = ".multipart";
const SESSION_KEY_FILE: &str = "key";

#[derive(Clone, Debug)]
pub struct LocalStorage {
    base_path: PathBuf,
    public_url: Option<String>,
}

impl LocalStorage {
    /// Create the backend rooted at `base_path`, creating its directories.
    ///
    /// `public_url` is the externally reachable prefix objects are served
    /// under; without it [`StorageClient::url`] returns `None`.
    pub fn new(base_path: impl Into<PathBuf>, public_url: Option<String>) -> io::Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(base_path.join(OBJECTS_DIR))?;
        std::fs::create_dir_all(base_path.join(MULTIPART_DIR))?;
        Ok(Self {
            base_path,
            public_url,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Reject keys that could escape the storage root. Dots are fine inside
    /// a segment; only `.` and `..` segments are refused.
    fn ensure_key_safe(key: &str) -> StorageResult<()> {
        let unsafe_key = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key
                .split('/')
                .any(|segment| matches!(segment, "" | "." | ".."))
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\');
        if unsafe_key {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn objects_root(&self) -> PathBuf {
        self.base_path.join(OBJECTS_DIR)
    }

    /// Two-level shard directories from MD5(key), to keep directories small.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.objects_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Staging directory of an open session. Tokens are UUIDs we issued;
    /// anything else cannot name a session.
    fn session_dir(&self, token: &str) -> StorageResult<PathBuf> {
        let token_id =
            Uuid::parse_str(token).map_err(|_| StorageError::UnknownSession(token.to_string()))?;
        Ok(self
            .base_path
            .join(MULTIPART_DIR)
            .join(token_id.simple().to_string()))
    }

    fn part_path(session: &Path, part_number: u32) -> PathBuf {
        session.join(format!("part-{:05}", part_number))
    }

    /// Resolve an open session and check that it belongs to `key`.
    async fn open_session(&self, key: &str, token: &str) -> StorageResult<PathBuf> {
        Self::ensure_key_safe(key)?;
        let session = self.session_dir(token)?;
        let owner = match fs::read_to_string(session.join(SESSION_KEY_FILE)).await {
            Ok(owner) => owner,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::UnknownSession(token.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if owner != key {
            return Err(StorageError::UnknownSession(token.to_string()));
        }
        Ok(session)
    }

    /// Write `content` next to `target` and atomically rename it into place.
    async fn write_atomically(target: &Path, content: &[u8]) -> StorageResult<()> {
        let (tmp_path, mut file) = Self::create_temp(target).await?;
        if let Err(err) = file.write_all(content).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Self::commit_temp(file, &tmp_path, target).await
    }

    async fn create_temp(target: &Path) -> StorageResult<(PathBuf, File)> {
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok((tmp_path, file))
    }

    /// Flush, fsync and rename; removes the temp file on any failure.
    async fn commit_temp(mut file: File, tmp_path: &Path, target: &Path) -> StorageResult<()> {
        let synced = match file.flush().await {
            Ok(()) => file.sync_all().await,
            Err(err) => Err(err),
        };
        if let Err(err) = synced {
            let _ = fs::remove_file(tmp_path).await;
            return Err(err.into());
        }
        drop(file);

        if let Err(err) = fs::rename(tmp_path, target).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(target).await?;
                fs::rename(tmp_path, target).await?;
            } else {
                let _ = fs::remove_file(tmp_path).await;
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageClient for LocalStorage {
    async fn put(&self, key: &str, content: Bytes) -> StorageResult<()> {
        Self::ensure_key_safe(key)?;
        Self::write_atomically(&self.object_path(key), &content).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        Self::ensure_key_safe(key)?;
        match fs::read(self.object_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        Self::ensure_key_safe(key)?;
        let path = self.object_path(key);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed physical file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = path.parent() {
            Self::prune_empty_dirs(parent, &self.objects_root()).await;
        }
        Ok(())
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        Self::ensure_key_safe(key)?;
        Ok(fs::try_exists(self.object_path(key)).await?)
    }

    fn url(&self, key: &str) -> Option<String> {
        self.public_url
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), key))
    }

    async fn multipart_init(&self, key: &str) -> StorageResult<String> {
        Self::ensure_key_safe(key)?;
        let token = Uuid::new_v4().to_string();
        let session = self.session_dir(&token)?;
        fs::create_dir_all(&session).await?;
        Self::write_atomically(&session.join(SESSION_KEY_FILE), key.as_bytes()).await?;
        debug!(key, token = %token, "opened multipart session");
        Ok(token)
    }

    async fn multipart_upload_part(
        &self,
        key: &str,
        token: &str,
        part_number: u32,
        content: Bytes,
    ) -> StorageResult<String> {
        let session = self.open_session(key, token).await?;
        Self::write_atomically(&Self::part_path(&session, part_number), &content).await?;
        Ok(part_hash(&content))
    }

    async fn multipart_finalize(
        &self,
        key: &str,
        token: &str,
        parts: &[FilePart],
    ) -> StorageResult<()> {
        let session = self.open_session(key, token).await?;
        if parts.is_empty() {
            return Err(StorageError::PartMismatch {
                part: 0,
                reason: "no parts to assemble".into(),
            });
        }

        let target = self.object_path(key);
        let (tmp_path, mut file) = Self::create_temp(&target).await?;
        for part in parts {
            let content = match fs::read(Self::part_path(&session, part.part_number)).await {
                Ok(content) => content,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(if err.kind() == ErrorKind::NotFound {
                        StorageError::PartMismatch {
                            part: part.part_number,
                            reason: "part was never uploaded".into(),
                        }
                    } else {
                        err.into()
                    });
                }
            };
            if part_hash(&content) != part.hash {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::PartMismatch {
                    part: part.part_number,
                    reason: "hash does not match uploaded content".into(),
                });
            }
            if let Err(err) = file.write_all(&content).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }
        Self::commit_temp(file, &tmp_path, &target).await?;

        if let Err(err) = fs::remove_dir_all(&session).await {
            debug!("failed to remove finalized session {}: {}", session.display(), err);
        }
        Ok(())
    }

    async fn multipart_abort(&self, key: &str, token: &str) -> StorageResult<()> {
        let session = self.open_session(key, token).await?;
        fs::remove_dir_all(&session).await?;
        debug!(key, token, "aborted multipart session");
        Ok(())
    }
}
