//! Record cache keyed by record number.
//!
//! Records are immutable once appended, so a cached entry never goes stale.
//! The default policy keeps every record it has seen; the bounded policy is
//! an LRU over record numbers and only changes how often the log is re-read.

use crate::types::{RecNo, Record};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// How many decoded records the store keeps in memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Keep every record ever read or written.
    #[default]
    Unbounded,

    /// Keep at most this many records, evicting the least recently used.
    Bounded(usize),
}

enum Slots {
    Unbounded(HashMap<RecNo, Arc<Record>>),
    Bounded(LruCache<RecNo, Arc<Record>>),
}

pub(crate) struct RecordCache {
    slots: Slots,
    hits: u64,
    misses: u64,
}

impl RecordCache {
    pub fn new(policy: CachePolicy) -> Self {
        let slots = match policy {
            CachePolicy::Unbounded => Slots::Unbounded(HashMap::new()),
            CachePolicy::Bounded(capacity) => {
                let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
                Slots::Bounded(LruCache::new(capacity))
            }
        };
        Self {
            slots,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, recno: RecNo) -> Option<Arc<Record>> {
        let found = match &mut self.slots {
            Slots::Unbounded(map) => map.get(&recno).cloned(),
            Slots::Bounded(lru) => lru.get(&recno).cloned(),
        };
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    pub fn insert(&mut self, recno: RecNo, record: Arc<Record>) {
        match &mut self.slots {
            Slots::Unbounded(map) => {
                map.insert(recno, record);
            }
            Slots::Bounded(lru) => {
                lru.put(recno, record);
            }
        }
    }

    pub fn len(&self) -> usize {
        match &self.slots {
            Slots::Unbounded(map) => map.len(),
            Slots::Bounded(lru) => lru.len(),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
