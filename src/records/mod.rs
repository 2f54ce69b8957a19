//! Record log abstraction.
//!
//! A record log is an ordered, append-only sequence of opaque byte records
//! numbered from 1. The store only ever talks to it through [`RecordLog`].

mod log;
mod memory;

pub use log::FileLog;
pub use memory::MemoryLog;

use crate::error::{Result, StoreError};
use crate::types::RecNo;

/// Append-only log of opaque records.
pub trait RecordLog {
    /// Append a record, returning its number. Numbers start at 1 and grow by one.
    fn append(&mut self, data: &[u8]) -> Result<RecNo>;

    /// Read a record. A negative `recno` counts back from the end, `-1` being
    /// the most recent record.
    fn read(&self, recno: i64) -> Result<Vec<u8>>;

    /// Number of records in the log.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent record and its number.
    fn most_recent(&self) -> Result<(RecNo, Vec<u8>)> {
        let len = self.len();
        if len == 0 {
            return Err(StoreError::NotFound(-1));
        }
        Ok((RecNo(len), self.read(len as i64)?))
    }
}

/// Resolve a possibly negative record number against a log of `len` records.
pub(crate) fn resolve(recno: i64, len: u64) -> Result<RecNo> {
    let resolved = if recno < 0 {
        len as i64 + recno + 1
    } else {
        recno
    };
    if resolved < 1 || resolved as u64 > len {
        return Err(StoreError::NotFound(recno));
    }
    Ok(RecNo(resolved as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_positive_and_negative() {
        assert_eq!(resolve(1, 5).unwrap(), RecNo(1));
        assert_eq!(resolve(5, 5).unwrap(), RecNo(5));
        assert_eq!(resolve(-1, 5).unwrap(), RecNo(5));
        assert_eq!(resolve(-5, 5).unwrap(), RecNo(1));
    }

    #[test]
    fn test_resolve_out_of_range() {
        assert!(matches!(resolve(0, 5), Err(StoreError::NotFound(0))));
        assert!(matches!(resolve(6, 5), Err(StoreError::NotFound(6))));
        assert!(matches!(resolve(-6, 5), Err(StoreError::NotFound(-6))));
        assert!(matches!(resolve(-1, 0), Err(StoreError::NotFound(-1))));
    }
}
