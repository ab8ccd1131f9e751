//! In-process, per-record mutual exclusion.
//!
//! Operations that change a record's state around a backend call (single-part
//! upload, finalize, abort, delete) take the lock for that record id. Nothing
//! else waits: other records and multipart part uploads proceed unhindered.
//! Entries are dropped from the map once no holder or waiter remains.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type Slot = Arc<Mutex<()>>;

#[derive(Default)]
pub struct RecordLocks {
    slots: StdMutex<HashMap<Uuid, Slot>>,
}

/// Held while a record is being transitioned.
pub struct RecordGuard<'a> {
    locks: &'a RecordLocks,
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `id`.
    pub async fn acquire(&self, id: Uuid) -> RecordGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(id).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        RecordGuard {
            locks: self,
            id,
            guard: Some(guard),
        }
    }

    /// Number of records currently locked or awaited.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self
            .locks
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map itself still refers to the slot: nobody holds or awaits it.
        if slots
            .get(&self.id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.id);
        }
    }
}
