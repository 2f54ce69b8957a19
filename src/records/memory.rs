//! In-memory record log.

use super::{resolve, RecordLog};
use crate::error::Result;
use crate::types::RecNo;

/// A record log held entirely in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryLog {
    records: Vec<Vec<u8>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordLog for MemoryLog {
    fn append(&mut self, data: &[u8]) -> Result<RecNo> {
        self.records.push(data.to_vec());
        Ok(RecNo(self.records.len() as u64))
    }

    fn read(&self, recno: i64) -> Result<Vec<u8>> {
        let at = resolve(recno, self.len())?;
        Ok(self.records[(at.0 - 1) as usize].clone())
    }

    fn len(&self) -> u64 {
        self.records.len() as u64
    }
}
