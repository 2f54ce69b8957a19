//! Core types for the checkpointing store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Highest (least consolidated) checkpoint level.
pub const MAX_LEVEL: u8 = 9;

/// Keys are plain strings.
pub type Key = String;

/// Values are opaque bytes.
pub type Value = Vec<u8>;

/// Key assignments carried by an update or a checkpoint snapshot.
///
/// `None` is a tombstone: the key was explicitly deleted.
pub type Entries = BTreeMap<Key, Option<Value>>;

/// Position of a record in the log, starting at 1.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RecNo(pub u64);

impl fmt::Debug for RecNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecNo({})", self.0)
    }
}

impl fmt::Display for RecNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Header of a checkpoint record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// First and last record summarized by this checkpoint (inclusive).
    pub range: (RecNo, RecNo),

    /// Consolidation level, 0 meaning full history from record 1.
    pub level: u8,
}

impl CheckpointMeta {
    pub fn first(&self) -> RecNo {
        self.range.0
    }

    pub fn last(&self) -> RecNo {
        self.range.1
    }

    /// Check the positional and level invariants for a checkpoint stored at `at`.
    ///
    /// The checkpoint must cover the records directly preceding it, its range
    /// must start at or after record 1, and its level must be at most
    /// [`MAX_LEVEL`].
    pub fn check(&self, at: RecNo) -> Result<()> {
        if self.last().0 + 1 != at.0 {
            return Err(StoreError::CorruptedLog(format!(
                "checkpoint at {} covers up to {}, expected {}",
                at,
                self.last(),
                at.0.saturating_sub(1)
            )));
        }
        if self.first().0 == 0 || self.first().0 > at.0 {
            return Err(StoreError::CorruptedLog(format!(
                "checkpoint at {} has invalid range start {}",
                at,
                self.first()
            )));
        }
        if self.level > MAX_LEVEL {
            return Err(StoreError::CorruptedLog(format!(
                "checkpoint at {} has level {} (max {})",
                at, self.level, MAX_LEVEL
            )));
        }
        Ok(())
    }
}

/// A single record in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    /// One or more key assignments written together.
    Update(Entries),

    /// Consolidated view of all assignments effective as of `meta.range.1`.
    Checkpoint(CheckpointMeta, Entries),
}

impl Record {
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, Record::Checkpoint(..))
    }
}

/// Outcome of a lookup that keeps tombstones apart from missing keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The most recent assignment set a value.
    Value(Value),

    /// The most recent assignment was a delete.
    Tombstone,

    /// The key was never assigned.
    Missing,
}

impl Lookup {
    /// Collapse into the `get` representation, where tombstones and missing
    /// keys are both `None`.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Lookup::Value(v) => Some(v),
            Lookup::Tombstone | Lookup::Missing => None,
        }
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub record_count: u64,
    pub cached_records: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub checkpoints_written: u64,
}

/// Summary produced by a full invariant walk of the log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub updates: u64,
    pub checkpoints: u64,

    /// Number of checkpoints per level.
    pub levels: [u64; MAX_LEVEL as usize + 1],
}
