//! File-backed append-only record log.

use super::{resolve, RecordLog};
use crate::error::{Result, StoreError};
use crate::types::RecNo;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Magic bytes opening every log entry.
const LOG_MAGIC: &[u8; 4] = b"KVL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Entry header size: magic + version + recno + payload length + header crc32.
const ENTRY_HEADER_SIZE: u64 = 4 + 1 + 8 + 4 + 4;

/// Bytes of the header covered by the header checksum.
const HEADER_CHECKED_SIZE: usize = 4 + 1 + 8 + 4;

/// Entry trailer size: crc32 of the payload.
const ENTRY_TRAILER_SIZE: u64 = 4;

/// Append-only record log stored in a single file.
///
/// The file is locked exclusively for the lifetime of the log, so a second
/// writer on the same path fails fast with [`StoreError::Locked`].
pub struct FileLog {
    /// Path to the log file.
    path: PathBuf,

    /// Log file handle.
    file: Mutex<File>,

    /// Held for its exclusive lock.
    _lock_file: File,

    /// File offset of each record, indexed by `recno - 1`.
    offsets: Vec<u64>,

    /// Current file size (for appending).
    file_size: u64,

    /// Number of writes since last sync.
    writes_since_sync: u64,

    /// Sync every N writes.
    sync_interval: u64,

    /// Set when a failed append could not be rolled back. The file may hold a
    /// partial entry, so no further appends are accepted until reopened.
    broken: Option<String>,
}

impl FileLog {
    /// Default sync interval - sync every 100 writes.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a record log with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a record log with a custom sync interval.
    /// - sync_interval = 0 or 1: sync every write
    /// - sync_interval = 100: sync every 100 writes
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_file = Self::acquire_lock(&path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let (offsets, valid_end) = Self::scan(&mut file, file_size)?;

        if valid_end < file_size {
            warn!(
                path = %path.display(),
                valid_end,
                file_size,
                "truncating torn entry at end of log"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            _lock_file: lock_file,
            offsets,
            file_size: valid_end,
            writes_since_sync: 0,
            sync_interval: sync_interval.max(1),
            broken: None,
        })
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte size of the valid entries, after any torn tail was truncated on open.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.lock().sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.with_extension("lock"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }

    /// Walk every entry, checking framing and checksums.
    ///
    /// Returns the offset of each entry and the end of the last complete one.
    /// An entry cut short by the end of the file is a torn append and is left
    /// for the caller to truncate. Headers carry their own checksum, so a
    /// damaged length field fails here instead of passing for a torn tail.
    fn scan(file: &mut File, file_size: u64) -> Result<(Vec<u64>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&*file);
        let mut offsets = Vec::new();
        let mut offset = 0u64;

        while offset < file_size {
            if file_size - offset < ENTRY_HEADER_SIZE {
                break;
            }

            let expected = RecNo(offsets.len() as u64 + 1);
            let len = Self::read_header(&mut reader, expected)?;

            let end = offset + ENTRY_HEADER_SIZE + len as u64 + ENTRY_TRAILER_SIZE;
            if end > file_size {
                break;
            }

            Self::read_payload(&mut reader, len)?;
            offsets.push(offset);
            offset = end;
        }

        Ok((offsets, offset))
    }

    /// Read and check an entry header, returning the payload length.
    fn read_header(reader: &mut impl Read, expected: RecNo) -> Result<u32> {
        let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
        reader.read_exact(&mut header)?;

        if &header[0..4] != LOG_MAGIC {
            return Err(StoreError::InvalidFormat(format!(
                "Invalid entry magic for record {}",
                expected
            )));
        }

        if header[4] != LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported log version: {}",
                header[4]
            )));
        }

        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&header[HEADER_CHECKED_SIZE..]);
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&header[..HEADER_CHECKED_SIZE]);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let mut recno_bytes = [0u8; 8];
        recno_bytes.copy_from_slice(&header[5..13]);
        let recno = u64::from_le_bytes(recno_bytes);
        if recno != expected.0 {
            return Err(StoreError::InvalidFormat(format!(
                "Entry numbered {} where {} was expected",
                recno, expected
            )));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[13..17]);
        Ok(u32::from_le_bytes(len_bytes))
    }

    /// Read a payload and its trailing checksum.
    fn read_payload(reader: &mut impl Read, len: u32) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&payload);

        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok(payload)
    }

    fn encode_entry(recno: RecNo, data: &[u8]) -> Result<Vec<u8>> {
        let len = u32::try_from(data.len()).map_err(|_| {
            StoreError::LogWriteFailure(format!("record of {} bytes is too large", data.len()))
        })?;

        let mut buf =
            Vec::with_capacity((ENTRY_HEADER_SIZE + ENTRY_TRAILER_SIZE) as usize + data.len());
        buf.extend_from_slice(LOG_MAGIC);
        buf.push(LOG_VERSION);
        buf.extend_from_slice(&recno.0.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        let header_checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&header_checksum.to_le_bytes());
        buf.extend_from_slice(data);
        buf.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
        Ok(buf)
    }

    fn write_entry(file: &mut File, offset: u64, entry: &[u8], sync: bool) -> io::Result<()> {
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(entry)?;
        if sync {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl RecordLog for FileLog {
    fn append(&mut self, data: &[u8]) -> Result<RecNo> {
        if let Some(reason) = &self.broken {
            return Err(StoreError::LogWriteFailure(format!(
                "log must be reopened after a failed rollback: {}",
                reason
            )));
        }

        let recno = RecNo(self.offsets.len() as u64 + 1);
        let entry = Self::encode_entry(recno, data)?;
        let offset = self.file_size;
        let sync = self.writes_since_sync + 1 >= self.sync_interval;

        let mut file = self.file.lock();
        if let Err(e) = Self::write_entry(&mut file, offset, &entry, sync) {
            // Drop whatever part of the entry made it to the file.
            return Err(match file.set_len(offset) {
                Ok(()) => StoreError::LogWriteFailure(e.to_string()),
                Err(rollback) => {
                    let reason = format!("{}; truncating to {} failed: {}", e, offset, rollback);
                    error!(path = %self.path.display(), %reason, "log left with a partial entry");
                    self.broken = Some(reason.clone());
                    StoreError::LogWriteFailure(reason)
                }
            });
        }
        drop(file);

        self.offsets.push(offset);
        self.file_size += entry.len() as u64;
        self.writes_since_sync = if sync { 0 } else { self.writes_since_sync + 1 };

        Ok(recno)
    }

    fn read(&self, recno: i64) -> Result<Vec<u8>> {
        let at = resolve(recno, self.len())?;
        let offset = self.offsets[(at.0 - 1) as usize];

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let len = Self::read_header(&mut *file, at)?;
        Self::read_payload(&mut *file, len)
    }

    fn len(&self) -> u64 {
        self.offsets.len() as u64
    }
}

impl Drop for FileLog {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.file.lock().sync_all();
    }
}
