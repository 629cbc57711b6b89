//! Write-ahead logging with a rotating dual-file journal.
//!
//! Every in-memory mutation of a page is journaled here before (and
//! alongside) being written back to the data file, so that after a crash
//! the data file can be brought to a consistent state by replaying
//! committed work and reverting uncommitted work.
//!
//! # Architecture
//!
//! - Two append-only files (`<base>.log0` / `<base>.log1`), exactly one
//!   current at a time; checkpoints rotate between them, truncating the
//!   retired file so the log never grows past roughly two checkpoint
//!   windows.
//! - Fixed 40-byte entry headers with monotonic LSNs, followed by optional
//!   before-/after-image payloads.
//! - A reverse-chronological iterator across the pair, used by recovery.
//!
//! # Recovery Process
//!
//! On open of a non-empty log:
//! 1. Backward analysis classifies every transaction as committed, aborted
//!    or in-flight and locates the most recent checkpoint.
//! 2. Redo replays committed after-images forward from the checkpoint.
//! 3. Undo restores before-images of in-flight transactions.
//!
//! The log is cleared afterwards and LSN assignment restarts at 1.

mod entry;
mod file_pair;
mod iterator;
mod recovery;
mod writer;

pub use entry::{EntryKind, LogEntry, ENTRY_HEADER_SIZE, NO_LSN};
pub use iterator::LogIterator;
pub use recovery::{recover, RecoveryReport};
pub use writer::{Log, DEFAULT_CHECKPOINT_THRESHOLD};

use crate::error::{QuillError, Result};

/// Magic bytes identifying a quilldb log file.
pub const LOG_MAGIC: u32 = u32::from_le_bytes(*b"QWAL");

/// Size of the per-file log header in bytes.
pub const LOG_HEADER_SIZE: usize = 32;

/// Header flag bit: this file was the current file at last close.
const HEADER_FLAG_CURRENT: u32 = 1;

/// Per-file log header.
///
/// The header records where the file left off at the last orderly close
/// (rotation, clear or close). It is a hint only: open rebuilds the true
/// tail position by scanning the entries, so a crash between header
/// rewrites cannot misdirect recovery.
#[derive(Debug, Clone, Copy)]
pub struct LogHeader {
    /// Magic bytes for file identification.
    pub magic: u32,
    /// Header flags (current-file marker).
    pub flags: u32,
    /// LSN of the last checkpoint at the time of the last header write.
    pub last_checkpoint_lsn: u64,
    /// Highest LSN in this file at the time of the last header write.
    pub last_lsn: u64,
}

impl LogHeader {
    /// Creates a fresh header.
    #[must_use]
    pub fn new(current: bool) -> Self {
        Self {
            magic: LOG_MAGIC,
            flags: if current { HEADER_FLAG_CURRENT } else { 0 },
            last_checkpoint_lsn: 0,
            last_lsn: 0,
        }
    }

    /// Returns true if this file was marked current at the last close.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.flags & HEADER_FLAG_CURRENT != 0
    }

    /// Sets or clears the current-file marker.
    pub fn set_current(&mut self, current: bool) {
        if current {
            self.flags |= HEADER_FLAG_CURRENT;
        } else {
            self.flags &= !HEADER_FLAG_CURRENT;
        }
    }

    /// Validates the header magic.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::InvalidFileHeader`] on mismatch.
    pub fn validate(&self) -> Result<()> {
        if self.magic != LOG_MAGIC {
            return Err(QuillError::InvalidFileHeader(format!(
                "bad magic 0x{:08x}",
                self.magic
            )));
        }
        Ok(())
    }

    /// Encodes the header to its on-disk representation.
    #[must_use]
    pub fn encode(&self) -> [u8; LOG_HEADER_SIZE] {
        let mut buf = [0u8; LOG_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        // bytes 8..16 reserved
        buf[16..24].copy_from_slice(&self.last_checkpoint_lsn.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_lsn.to_le_bytes());
        buf
    }

    /// Decodes a header from its on-disk representation.
    #[must_use]
    pub fn decode(buf: &[u8; LOG_HEADER_SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            last_checkpoint_lsn: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            last_lsn: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        }
    }
}
