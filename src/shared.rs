//! Thread-safe handle around a [`Store`].
//!
//! Every store operation reads and may mutate the log, the cache and the
//! record count together, so the handle serializes all of them behind one
//! mutex.

use crate::error::Result;
use crate::records::{FileLog, RecordLog};
use crate::store::Store;
use crate::types::{Entries, Key, Lookup, StoreStats, Value, VerifyReport};
use parking_lot::Mutex;
use std::sync::Arc;

/// Cloneable, lock-protected store handle.
pub struct SharedStore<L = FileLog> {
    inner: Arc<Mutex<Store<L>>>,
}

impl<L> Clone for SharedStore<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: RecordLog> SharedStore<L> {
    pub fn new(store: Store<L>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.lock().get(key)
    }

    pub fn lookup(&self, key: &str) -> Result<Lookup> {
        self.inner.lock().lookup(key)
    }

    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.inner.lock().set(key, value)
    }

    pub fn set_many(&self, entries: Entries) -> Result<()> {
        self.inner.lock().set_many(entries)
    }

    pub fn delete(&self, key: impl Into<Key>) -> Result<()> {
        self.inner.lock().delete(key)
    }

    pub fn record_count(&self) -> u64 {
        self.inner.lock().record_count()
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.lock().stats()
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        self.inner.lock().verify()
    }

    /// Run several operations under one lock acquisition.
    pub fn with<R>(&self, f: impl FnOnce(&mut Store<L>) -> R) -> R {
        let mut store = self.inner.lock();
        f(&mut *store)
    }
}
