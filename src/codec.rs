//! Record encoding.
//!
//! Records are MessagePack with named struct fields. An update is a map of
//! key to value-or-nil. A checkpoint is a two element array holding its
//! metadata map and its snapshot map. The leading marker byte tells the two
//! apart on read.

use crate::error::{Result, StoreError};
use crate::types::{CheckpointMeta, Entries, RecNo, Record};

/// Encode a record for appending to the log.
pub fn encode(record: &Record) -> Result<Vec<u8>> {
    let bytes = match record {
        Record::Update(entries) => rmp_serde::to_vec_named(entries)?,
        Record::Checkpoint(meta, snapshot) => rmp_serde::to_vec_named(&(meta, snapshot))?,
    };
    Ok(bytes)
}

/// Decode the record stored at `at`.
///
/// Anything that is neither an update nor a checkpoint is reported as a
/// corrupted log.
pub fn decode(at: RecNo, bytes: &[u8]) -> Result<Record> {
    let corrupt = |e: rmp_serde::decode::Error| {
        StoreError::CorruptedLog(format!("record {} does not decode: {}", at, e))
    };

    match bytes.first() {
        // fixmap, map16, map32
        Some(0x80..=0x8f | 0xde | 0xdf) => {
            let entries: Entries = rmp_serde::from_slice(bytes).map_err(corrupt)?;
            Ok(Record::Update(entries))
        }
        // fixarray, array16, array32
        Some(0x90..=0x9f | 0xdc | 0xdd) => {
            let (meta, snapshot): (CheckpointMeta, Entries) =
                rmp_serde::from_slice(bytes).map_err(corrupt)?;
            Ok(Record::Checkpoint(meta, snapshot))
        }
        Some(marker) => Err(StoreError::CorruptedLog(format!(
            "record {} has unknown shape (marker {:#04x})",
            at, marker
        ))),
        None => Err(StoreError::CorruptedLog(format!("record {} is empty", at))),
    }
}
