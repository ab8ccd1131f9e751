//! In-process backend for tests and local development.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

use super::{StorageClient, StorageError, StorageResult, part_hash};
use crate::models::FilePart;

#[derive(Default)]
struct Session {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Bytes>,
    sessions: HashMap<String, Session>,
    multipart_inits: usize,
}

/// Objects and multipart sessions kept in memory behind a mutex.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
    public_url: Option<String>,
}

impl MemoryStorage {
    pub fn new(public_url: Option<String>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            public_url,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Each critical section leaves the maps consistent, so poisoning is ignored.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of `multipart_init` calls served so far.
    pub fn multipart_init_count(&self) -> usize {
        self.lock().multipart_inits
    }

    /// `true` while the session behind `token` is open.
    pub fn has_session(&self, token: &str) -> bool {
        self.lock().sessions.contains_key(token)
    }

    pub fn open_session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }
}

fn session_mut<'a>(state: &'a mut State, key: &str, token: &str) -> StorageResult<&'a mut Session> {
    match state.sessions.get_mut(token) {
        Some(session) if session.key == key => Ok(session),
        _ => Err(StorageError::UnknownSession(token.to_string())),
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn put(&self, key: &str, content: Bytes) -> StorageResult<()> {
        self.lock().objects.insert(key.to_string(), content);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.lock().objects.remove(key);
        Ok(())
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        Ok(self.lock().objects.contains_key(key))
    }

    fn url(&self, key: &str) -> Option<String> {
        self.public_url
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), key))
    }

    async fn multipart_init(&self, key: &str) -> StorageResult<String> {
        let token = Uuid::new_v4().to_string();
        let mut state = self.lock();
        state.multipart_inits += 1;
        state.sessions.insert(
            token.clone(),
            Session {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(token)
    }

    async fn multipart_upload_part(
        &self,
        key: &str,
        token: &str,
        part_number: u32,
        content: Bytes,
    ) -> StorageResult<String> {
        let hash = part_hash(&content);
        let mut state = self.lock();
        session_mut(&mut state, key, token)?
            .parts
            .insert(part_number, content);
        Ok(hash)
    }

    async fn multipart_finalize(
        &self,
        key: &str,
        token: &str,
        parts: &[FilePart],
    ) -> StorageResult<()> {
        let mut state = self.lock();
        let session = session_mut(&mut state, key, token)?;
        if parts.is_empty() {
            return Err(StorageError::PartMismatch {
                part: 0,
                reason: "no parts to assemble".into(),
            });
        }

        let mut assembled = BytesMut::new();
        for part in parts {
            let content =
                session
                    .parts
                    .get(&part.part_number)
                    .ok_or_else(|| StorageError::PartMismatch {
                        part: part.part_number,
                        reason: "part was never uploaded".into(),
                    })?;
            if part_hash(content) != part.hash {
                return Err(StorageError::PartMismatch {
                    part: part.part_number,
                    reason: "hash does not match uploaded content".into(),
                });
            }
            assembled.extend_from_slice(content);
        }

        state.sessions.remove(token);
        state.objects.insert(key.to_string(), assembled.freeze());
        Ok(())
    }

    async fn multipart_abort(&self, key: &str, token: &str) -> StorageResult<()> {
        let mut state = self.lock();
        session_mut(&mut state, key, token)?;
        state.sessions.remove(token);
        Ok(())
    }
}
