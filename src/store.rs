//! The checkpointing key-value store.
//!
//! Every write appends one update record to the log. Every
//! `checkpoint_freq`-th record is a checkpoint: a snapshot of all keys
//! touched since an older, more consolidated checkpoint (or since record 1).
//! Lookups walk the log backwards and use checkpoints to skip the ranges
//! they summarize.
//!
//! Checkpoint levels work like `dump` levels. Level 0 covers the full history
//! from record 1. A level `n` checkpoint covers everything after the most
//! recent checkpoint of a level below `n`.

use crate::cache::{CachePolicy, RecordCache};
use crate::codec;
use crate::error::{Result, StoreError};
use crate::records::{FileLog, RecordLog};
use crate::types::{
    CheckpointMeta, Entries, Key, Lookup, RecNo, Record, StoreStats, Value, VerifyReport,
    MAX_LEVEL,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Default number of records between checkpoints.
pub const DEFAULT_CHECKPOINT_FREQ: u64 = 10;

/// Default key overlap above which two checkpoints are merged.
pub const DEFAULT_MERGE_THRESHOLD: f64 = 0.8;

/// File name of the record log inside the store directory.
const LOG_FILE: &str = "records.log";

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory holding the record log.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the log file every N appends.
    pub sync_interval: u64,

    /// A checkpoint is written whenever the next record number is a multiple
    /// of this value.
    pub checkpoint_freq: u64,

    /// Fraction of the smaller key set two checkpoints must share before the
    /// older one is folded into the new one.
    pub merge_threshold: f64,

    /// Record cache policy.
    pub cache: CachePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            create_if_missing: true,
            sync_interval: FileLog::DEFAULT_SYNC_INTERVAL,
            checkpoint_freq: DEFAULT_CHECKPOINT_FREQ,
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            cache: CachePolicy::Unbounded,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_freq == 0 {
            return Err(StoreError::InvalidConfig(
                "checkpoint_freq must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.merge_threshold) {
            return Err(StoreError::InvalidConfig(format!(
                "merge_threshold must be within [0, 1], got {}",
                self.merge_threshold
            )));
        }
        if self.cache == CachePolicy::Bounded(0) {
            return Err(StoreError::InvalidConfig(
                "bounded cache needs a capacity of at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Single-writer key-value store over a record log.
///
/// All operations take `&mut self`: lookups populate the record cache. Wrap
/// the store in a [`SharedStore`](crate::SharedStore) to use it from several
/// threads.
pub struct Store<L = FileLog> {
    log: L,
    cache: RecordCache,

    /// Mirrors the log length. Only advanced by this store's own appends.
    record_count: u64,

    checkpoint_freq: u64,
    merge_threshold: f64,
    checkpoints_written: u64,
}

impl Store<FileLog> {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store directory.
    pub fn create(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.path)?;
        let log = FileLog::open_with_sync_interval(config.path.join(LOG_FILE), config.sync_interval)?;
        Self::with_log(log, &config)
    }

    /// Open an existing store directory.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if !config.path.join(LOG_FILE).exists() {
            return Err(StoreError::NotInitialized);
        }
        let log = FileLog::open_with_sync_interval(config.path.join(LOG_FILE), config.sync_interval)?;
        Self::with_log(log, &config)
    }

    /// Force the log to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.log.sync()
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        self.log.path()
    }
}

impl<L: RecordLog> Store<L> {
    /// Build a store on top of an existing log.
    ///
    /// The most recent record, if any, fixes the record count and seeds the
    /// cache. An empty log answers `NotFound`, which starts the count at 0.
    pub fn with_log(log: L, config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let mut cache = RecordCache::new(config.cache);
        let record_count = match log.most_recent() {
            Ok((recno, bytes)) => {
                let record = codec::decode(recno, &bytes)?;
                cache.insert(recno, Arc::new(record));
                recno.0
            }
            Err(StoreError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };

        info!(record_count, "opened store");

        Ok(Self {
            log,
            cache,
            record_count,
            checkpoint_freq: config.checkpoint_freq,
            merge_threshold: config.merge_threshold,
            checkpoints_written: 0,
        })
    }

    /// Number of records in the log, checkpoints included.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// The underlying log.
    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            record_count: self.record_count,
            cached_records: self.cache.len() as u64,
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
            checkpoints_written: self.checkpoints_written,
        }
    }

    // --- Record access ---

    /// Read a record through the cache.
    ///
    /// A negative `recno` is taken relative to the record count:
    /// `record_count + recno`.
    pub fn read_record(&mut self, recno: i64) -> Result<Arc<Record>> {
        let at = if recno < 0 {
            self.record_count as i64 + recno
        } else {
            recno
        };
        if at < 1 {
            return Err(StoreError::NotFound(recno));
        }
        self.record(RecNo(at as u64))
    }

    fn record(&mut self, at: RecNo) -> Result<Arc<Record>> {
        if let Some(record) = self.cache.get(at) {
            return Ok(record);
        }

        trace!(recno = at.0, "record cache miss");
        let bytes = self.log.read(at.0 as i64)?;
        let record = Arc::new(codec::decode(at, &bytes)?);
        self.cache.insert(at, Arc::clone(&record));
        Ok(record)
    }

    /// Append a record. Nothing is advanced unless the log accepted it.
    fn append_record(&mut self, record: Record) -> Result<RecNo> {
        let bytes = codec::encode(&record)?;
        let recno = self.log.append(&bytes)?;

        let expected = RecNo(self.record_count + 1);
        if recno != expected {
            return Err(StoreError::CorruptedLog(format!(
                "log assigned record {} where {} was expected; is another writer active?",
                recno, expected
            )));
        }

        self.record_count = recno.0;
        self.cache.insert(recno, Arc::new(record));
        Ok(recno)
    }

    // --- Lookups ---

    /// Most recent value of `key`.
    ///
    /// Returns `None` both when the key was deleted and when it was never
    /// written. Use [`lookup`](Self::lookup) to tell the two apart.
    pub fn get(&mut self, key: &str) -> Result<Option<Value>> {
        Ok(self.lookup(key)?.into_value())
    }

    /// Most recent assignment of `key`, keeping tombstones apart from keys
    /// that were never written.
    pub fn lookup(&mut self, key: &str) -> Result<Lookup> {
        let found = |value: &Option<Value>| match value {
            Some(v) => Lookup::Value(v.clone()),
            None => Lookup::Tombstone,
        };

        let mut cur = self.record_count;
        while cur > 0 {
            let record = self.record(RecNo(cur))?;
            match &*record {
                Record::Update(entries) => {
                    if let Some(value) = entries.get(key) {
                        return Ok(found(value));
                    }
                    cur -= 1;
                }
                Record::Checkpoint(meta, snapshot) => {
                    meta.check(RecNo(cur))?;
                    if let Some(value) = snapshot.get(key) {
                        return Ok(found(value));
                    }
                    // Everything in the range is summarized by the snapshot.
                    cur = meta.first().0 - 1;
                }
            }
        }

        Ok(Lookup::Missing)
    }

    /// Most recent value of `key`, decoded from JSON.
    pub fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    // --- Writes ---

    /// Apply several assignments as one update record. `None` deletes a key.
    ///
    /// If the update would land just before a checkpoint slot, the checkpoint
    /// is written first.
    pub fn set_many(&mut self, entries: Entries) -> Result<()> {
        if entries.is_empty() {
            return Err(StoreError::InvalidOperation(
                "an update needs at least one key".into(),
            ));
        }

        if (self.record_count + 1) % self.checkpoint_freq == 0 {
            self.create_checkpoint()?;
        }

        self.append_record(Record::Update(entries))?;
        Ok(())
    }

    /// Set `key` to `value`.
    pub fn set(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let mut entries = Entries::new();
        entries.insert(key.into(), Some(value.into()));
        self.set_many(entries)
    }

    /// Set `key` to the JSON encoding of `value`.
    pub fn set_json<T: Serialize>(&mut self, key: impl Into<Key>, value: &T) -> Result<()> {
        self.set(key, serde_json::to_vec(value)?)
    }

    /// Record a tombstone for `key`. History is kept.
    pub fn delete(&mut self, key: impl Into<Key>) -> Result<()> {
        let mut entries = Entries::new();
        entries.insert(key.into(), None);
        self.set_many(entries)
    }

    // --- Checkpoints ---

    /// Append a checkpoint covering the open end of the log.
    ///
    /// The scan walks backwards collecting the newest assignment of every key.
    /// Checkpoints at the current level or above are absorbed. The first one
    /// below the current level is either merged, when its keys mostly
    /// overlap the collected ones, or cited as the prefix, in which case the
    /// new checkpoint sits one level above it.
    fn create_checkpoint(&mut self) -> Result<RecNo> {
        let upper = self.record_count;
        let mut cur = upper;
        let mut level = MAX_LEVEL;
        let mut newdata = Entries::new();
        let mut merged = 0u32;

        while cur > 0 {
            let record = self.record(RecNo(cur))?;
            match &*record {
                Record::Update(entries) => {
                    for (key, value) in entries {
                        newdata.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                    cur -= 1;
                }
                Record::Checkpoint(meta, olddata) => {
                    meta.check(RecNo(cur))?;

                    if meta.level < level {
                        if worth_merging(self.merge_threshold, olddata, &newdata) {
                            let mut combined = olddata.clone();
                            combined.append(&mut newdata);
                            newdata = combined;
                            level = meta.level;
                            merged += 1;
                            cur = meta.first().0 - 1;
                        } else {
                            level = meta.level + 1;
                            break;
                        }
                    } else {
                        for (key, value) in olddata {
                            newdata.entry(key.clone()).or_insert_with(|| value.clone());
                        }
                        cur = meta.first().0 - 1;
                    }
                }
            }
        }

        let lower = cur + 1;
        if lower == 1 {
            level = 0;
        }

        let meta = CheckpointMeta {
            range: (RecNo(lower), RecNo(upper)),
            level,
        };
        debug!(
            lower,
            upper,
            level,
            keys = newdata.len(),
            merged,
            "writing checkpoint"
        );

        let at = self.append_record(Record::Checkpoint(meta, newdata))?;
        self.checkpoints_written += 1;
        Ok(at)
    }

    /// Walk the whole log and check every checkpoint's range and level.
    pub fn verify(&mut self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();

        for n in 1..=self.record_count {
            let at = RecNo(n);
            let record = self.record(at)?;
            match &*record {
                Record::Update(_) => report.updates += 1,
                Record::Checkpoint(meta, _) => {
                    meta.check(at)?;
                    if meta.first() == RecNo(1) && meta.level != 0 {
                        return Err(StoreError::CorruptedLog(format!(
                            "checkpoint at {} covers the full history at level {}",
                            at, meta.level
                        )));
                    }
                    report.checkpoints += 1;
                    report.levels[meta.level as usize] += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Whether two key sets overlap enough to fold the older checkpoint in.
fn worth_merging(threshold: f64, old: &Entries, new: &Entries) -> bool {
    let (small, large) = if old.len() <= new.len() {
        (old, new)
    } else {
        (new, old)
    };
    let shared = small.keys().filter(|k| large.contains_key(*k)).count();
    shared as f64 > threshold * small.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::MemoryLog;

    fn memory_store() -> Store<MemoryLog> {
        Store::with_log(MemoryLog::new(), &StoreConfig::default()).unwrap()
    }

    fn checkpoint_at(store: &mut Store<MemoryLog>, recno: i64) -> (CheckpointMeta, Entries) {
        match &*store.read_record(recno).unwrap() {
            Record::Checkpoint(meta, snapshot) => (*meta, snapshot.clone()),
            other => panic!("expected checkpoint at {}, got {:?}", recno, other),
        }
    }

    fn keys(names: &[&str]) -> Entries {
        names
            .iter()
            .map(|k| (k.to_string(), Some(b"x".to_vec())))
            .collect()
    }

    #[test]
    fn test_first_checkpoint_covers_full_history() {
        let mut store = memory_store();
        for i in 1..=9 {
            store.set(format!("k{}", i), format!("v{}", i)).unwrap();
        }
        assert_eq!(store.record_count(), 9);

        store.set("k10", "v10").unwrap();
        assert_eq!(store.record_count(), 11);

        let (meta, snapshot) = checkpoint_at(&mut store, 10);
        assert_eq!(meta.range, (RecNo(1), RecNo(9)));
        assert_eq!(meta.level, 0);
        assert_eq!(snapshot.len(), 9);
        for i in 1..=9 {
            assert_eq!(
                snapshot[&format!("k{}", i)],
                Some(format!("v{}", i).into_bytes())
            );
        }

        match &*store.read_record(11).unwrap() {
            Record::Update(entries) => {
                assert_eq!(entries["k10"], Some(b"v10".to_vec()));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_stops_at_checkpoint_snapshot() {
        let mut store = memory_store();
        for i in 1..=10 {
            store.set(format!("k{}", i), format!("v{}", i)).unwrap();
        }

        let before = store.stats();
        assert_eq!(store.get("k5").unwrap(), Some(b"v5".to_vec()));

        // Record 11, then the checkpoint at 10. Both cached on append.
        let after = store.stats();
        assert_eq!(after.cache_hits, before.cache_hits + 2);
        assert_eq!(after.cache_misses, 0);
    }

    #[test]
    fn test_disjoint_keys_raise_level() {
        let mut store = memory_store();
        for i in 1..=18 {
            store.set(format!("k{}", i), "v").unwrap();
        }
        // 1..9 updates, 10 checkpoint, 11..19 updates
        assert_eq!(store.record_count(), 19);

        store.set("k19", "v").unwrap();
        let (meta, snapshot) = checkpoint_at(&mut store, 20);
        assert_eq!(meta.range, (RecNo(11), RecNo(19)));
        assert_eq!(meta.level, 1);
        assert_eq!(snapshot.len(), 9);
        assert!(!snapshot.contains_key("k1"));

        // Third checkpoint cites the level 1 one and climbs to level 2.
        for i in 20..=28 {
            store.set(format!("k{}", i), "v").unwrap();
        }
        let (meta, _) = checkpoint_at(&mut store, 30);
        assert_eq!(meta.range, (RecNo(21), RecNo(29)));
        assert_eq!(meta.level, 2);
    }

    #[test]
    fn test_overlapping_keys_merge_into_full_snapshot() {
        let mut store = memory_store();
        for i in 1..=9 {
            store.set(format!("k{}", i), "r0").unwrap();
        }
        store.set("k1", "r0").unwrap();
        for i in 2..=9 {
            store.set(format!("k{}", i), "r1").unwrap();
        }
        // 1..9 updates, 10 checkpoint, 11..19 updates
        assert_eq!(store.record_count(), 19);

        store.set("k1", "r2").unwrap();
        let (meta, snapshot) = checkpoint_at(&mut store, 20);
        assert_eq!(meta.range, (RecNo(1), RecNo(19)));
        assert_eq!(meta.level, 0);
        assert_eq!(snapshot.len(), 9);
        assert_eq!(snapshot["k1"], Some(b"r0".to_vec()));
        assert_eq!(snapshot["k9"], Some(b"r1".to_vec()));

        assert_eq!(store.get("k1").unwrap(), Some(b"r2".to_vec()));
        assert_eq!(store.get("k2").unwrap(), Some(b"r1".to_vec()));
    }

    #[test]
    fn test_merge_keeps_inner_level() {
        let mut store = memory_store();
        // 1..9, checkpoint 10 (level 0), 11..19, checkpoint 20 (level 1), 21
        for i in 1..=19 {
            store.set(format!("k{}", i), "old").unwrap();
        }
        assert_eq!(checkpoint_at(&mut store, 20).0.level, 1);

        // Rewrite most of the level 1 keys.
        for i in 10..=17 {
            store.set(format!("k{}", i), "new").unwrap();
        }
        assert_eq!(store.record_count(), 29);

        store.set("k18", "new").unwrap();
        let (meta, snapshot) = checkpoint_at(&mut store, 30);
        // Folded in the level 1 checkpoint, then cited the level 0 one.
        assert_eq!(meta.range, (RecNo(11), RecNo(29)));
        assert_eq!(meta.level, 1);
        assert_eq!(snapshot.len(), 10);
        assert_eq!(snapshot["k10"], Some(b"new".to_vec()));
        assert_eq!(snapshot["k18"], Some(b"old".to_vec()));
        assert_eq!(snapshot["k19"], Some(b"old".to_vec()));
        assert!(!snapshot.contains_key("k9"));
    }

    #[test]
    fn test_level_nine_checkpoints_are_absorbed() {
        let mut store = memory_store();
        let mut n = 0;
        while store.record_count() < 111 {
            n += 1;
            store.set(format!("k{}", n), "v").unwrap();
        }

        // Disjoint rounds climb one level per checkpoint.
        for j in 1..=10u8 {
            let (meta, _) = checkpoint_at(&mut store, j as i64 * 10);
            assert_eq!(meta.level, j - 1);
        }

        // The level 9 checkpoint at 100 is absorbed, the level 8 one at 90 cited.
        let (meta, snapshot) = checkpoint_at(&mut store, 110);
        assert_eq!(meta.range, (RecNo(91), RecNo(109)));
        assert_eq!(meta.level, 9);
        assert_eq!(snapshot.len(), 18);

        assert_eq!(store.get("k1").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get(&format!("k{}", n)).unwrap(), Some(b"v".to_vec()));

        let report = store.verify().unwrap();
        assert_eq!(report.checkpoints, 11);
        assert_eq!(report.levels[9], 2);
    }

    #[test]
    fn test_tombstones_survive_checkpoints() {
        let mut store = memory_store();
        store.set("gone", "v").unwrap();
        store.delete("gone").unwrap();
        for i in 0..10 {
            store.set(format!("k{}", i), "v").unwrap();
        }

        let (_, snapshot) = checkpoint_at(&mut store, 10);
        assert_eq!(snapshot["gone"], None);
        assert_eq!(store.lookup("gone").unwrap(), Lookup::Tombstone);
        assert_eq!(store.lookup("never").unwrap(), Lookup::Missing);
        assert_eq!(store.get("gone").unwrap(), None);
    }

    #[test]
    fn test_every_write_checkpoints_with_freq_one() {
        let config = StoreConfig {
            checkpoint_freq: 1,
            ..Default::default()
        };
        let mut store = Store::with_log(MemoryLog::new(), &config).unwrap();

        store.set("a", "1").unwrap();
        let (meta, snapshot) = checkpoint_at(&mut store, 1);
        assert_eq!(meta.range, (RecNo(1), RecNo(0)));
        assert_eq!(meta.level, 0);
        assert!(snapshot.is_empty());

        store.set("b", "2").unwrap();
        store.set("a", "3").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get("b").unwrap(), Some(b"2".to_vec()));
        store.verify().unwrap();
    }

    #[test]
    fn test_empty_update_rejected() {
        let mut store = memory_store();
        assert!(matches!(
            store.set_many(Entries::new()),
            Err(StoreError::InvalidOperation(_))
        ));
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn test_negative_read_is_relative_to_count() {
        let mut store = memory_store();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        store.set("c", "3").unwrap();

        match &*store.read_record(-1).unwrap() {
            Record::Update(entries) => assert!(entries.contains_key("b")),
            other => panic!("expected update, got {:?}", other),
        }
        assert!(matches!(store.read_record(-3), Err(StoreError::NotFound(-3))));
        assert!(matches!(store.read_record(0), Err(StoreError::NotFound(0))));
        assert!(matches!(store.read_record(4), Err(StoreError::NotFound(4))));
    }

    #[test]
    fn test_worth_merging_threshold() {
        let old = keys(&["a", "b", "c", "d", "e"]);
        assert!(worth_merging(0.8, &old, &keys(&["a", "b", "c", "d", "e", "f"])));
        // 4 of 5 is exactly 0.8, which is not above it.
        assert!(!worth_merging(0.8, &old, &keys(&["a", "b", "c", "d", "z"])));
        assert!(!worth_merging(0.8, &old, &Entries::new()));
        assert!(worth_merging(0.0, &old, &keys(&["a"])));
    }

    #[test]
    fn test_invalid_config() {
        let config = StoreConfig {
            checkpoint_freq: 0,
            ..Default::default()
        };
        assert!(matches!(
            Store::with_log(MemoryLog::new(), &config),
            Err(StoreError::InvalidConfig(_))
        ));

        let config = StoreConfig {
            merge_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StoreError::InvalidConfig(_))));
    }
}
