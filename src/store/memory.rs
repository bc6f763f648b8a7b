// SPDX-License-Identifier: MPL-2.0

use crate::lock;
use crate::store::{Persistence, PersistenceError};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Process-local persistence, used for anonymous sessions without storage and in tests.
#[derive(Default)]
pub struct MemoryPersistence {
    blob: Mutex<Option<String>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: impl Into<String>) -> Self {
        Self {
            blob: Mutex::new(Some(blob.into())),
            ..Self::default()
        }
    }

    /// Make subsequent writes fail until switched back.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn blob(&self) -> Option<String> {
        lock(&self.blob).clone()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Persistence for MemoryPersistence {
    fn read(&self) -> Result<Option<String>, PersistenceError> {
        Ok(lock(&self.blob).clone())
    }

    fn write(&self, blob: &str) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("storage quota exceeded".into()));
        }
        *lock(&self.blob) = Some(blob.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        *lock(&self.blob) = None;
        Ok(())
    }
}
