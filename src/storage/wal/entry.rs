//! Log entry types and the fixed binary entry codec.
//!
//! The entry record is part of the on-disk format and is therefore encoded
//! by hand rather than through a serialization framework: a 40-byte
//! little-endian header followed by `data_size` payload bytes. The entry
//! kind lives in the high nibble of the flags word.

use crate::error::{QuillError, Result};

/// Size of the fixed entry header in bytes.
pub const ENTRY_HEADER_SIZE: usize = 40;

/// LSN value reserved as the "no entry" sentinel. Real entries always carry
/// an LSN >= 1.
pub const NO_LSN: u64 = 0;

/// Bit position of the entry kind within the flags word.
const KIND_SHIFT: u32 = 28;
/// Mask of the flag bits that are free for actual flags.
const FLAGS_MASK: u32 = (1 << KIND_SHIFT) - 1;

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// A transaction was started.
    TxnBegin = 1,
    /// A transaction was aborted.
    TxnAbort = 2,
    /// A transaction was committed.
    TxnCommit = 3,
    /// Checkpoint marker; entries before it need no redo.
    Checkpoint = 4,
    /// A page was written back to the data file (advisory).
    FlushPage = 5,
    /// Before-image of a byte range.
    Prewrite = 6,
    /// After-image of a byte range.
    Write = 7,
    /// Before- and after-image in one record (old image first).
    Overwrite = 8,
}

impl TryFrom<u8> for EntryKind {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(EntryKind::TxnBegin),
            2 => Ok(EntryKind::TxnAbort),
            3 => Ok(EntryKind::TxnCommit),
            4 => Ok(EntryKind::Checkpoint),
            5 => Ok(EntryKind::FlushPage),
            6 => Ok(EntryKind::Prewrite),
            7 => Ok(EntryKind::Write),
            8 => Ok(EntryKind::Overwrite),
            _ => Err(()),
        }
    }
}

/// A decoded log entry header.
///
/// Control entries (begin/abort/commit/checkpoint/flush-page) carry no
/// payload; `Prewrite` and `Write` carry one image, `Overwrite` carries the
/// old and new images concatenated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    /// Log sequence number; unique and strictly increasing.
    pub lsn: u64,
    /// Owning transaction, or 0 for system entries.
    pub txn_id: u64,
    /// Byte offset in the data file the payload refers to.
    pub offset: u64,
    /// Size of the trailing payload in bytes (0 for control entries).
    pub data_size: u64,
    /// Reserved flag bits (low 28 bits of the flags word).
    pub flags: u32,
    /// Entry kind (stored in the high nibble of the flags word).
    pub kind: EntryKind,
}

impl LogEntry {
    /// Creates a new entry.
    #[must_use]
    pub fn new(kind: EntryKind, txn_id: u64, lsn: u64, offset: u64, data_size: u64) -> Self {
        Self {
            lsn,
            txn_id,
            offset,
            data_size,
            flags: 0,
            kind,
        }
    }

    /// Creates a transaction-begin entry.
    #[must_use]
    pub fn txn_begin(txn_id: u64, lsn: u64) -> Self {
        Self::new(EntryKind::TxnBegin, txn_id, lsn, 0, 0)
    }

    /// Creates a transaction-abort entry.
    #[must_use]
    pub fn txn_abort(txn_id: u64, lsn: u64) -> Self {
        Self::new(EntryKind::TxnAbort, txn_id, lsn, 0, 0)
    }

    /// Creates a transaction-commit entry.
    #[must_use]
    pub fn txn_commit(txn_id: u64, lsn: u64) -> Self {
        Self::new(EntryKind::TxnCommit, txn_id, lsn, 0, 0)
    }

    /// Creates a checkpoint entry.
    #[must_use]
    pub fn checkpoint(lsn: u64) -> Self {
        Self::new(EntryKind::Checkpoint, 0, lsn, 0, 0)
    }

    /// Creates a flush-page entry for the page at `offset`.
    #[must_use]
    pub fn flush_page(lsn: u64, offset: u64) -> Self {
        Self::new(EntryKind::FlushPage, 0, lsn, offset, 0)
    }

    /// Creates a prewrite (before-image) entry header.
    #[must_use]
    pub fn prewrite(txn_id: u64, lsn: u64, offset: u64, data_size: u64) -> Self {
        Self::new(EntryKind::Prewrite, txn_id, lsn, offset, data_size)
    }

    /// Creates a write (after-image) entry header.
    #[must_use]
    pub fn write(txn_id: u64, lsn: u64, offset: u64, data_size: u64) -> Self {
        Self::new(EntryKind::Write, txn_id, lsn, offset, data_size)
    }

    /// Creates an overwrite entry header. `data_size` covers both images.
    #[must_use]
    pub fn overwrite(txn_id: u64, lsn: u64, offset: u64, data_size: u64) -> Self {
        Self::new(EntryKind::Overwrite, txn_id, lsn, offset, data_size)
    }

    /// Returns true if this entry carries a payload.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.data_size > 0
    }

    /// Encodes the header to its on-disk representation.
    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.lsn.to_le_bytes());
        buf[8..16].copy_from_slice(&self.txn_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.data_size.to_le_bytes());
        let flags_word = (self.flags & FLAGS_MASK) | ((self.kind as u32) << KIND_SHIFT);
        buf[32..36].copy_from_slice(&flags_word.to_le_bytes());
        // bytes 36..40 reserved
        buf
    }

    /// Decodes a header from its on-disk representation.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Corrupted`] if the kind nibble is not a known
    /// entry kind.
    pub fn decode(buf: &[u8; ENTRY_HEADER_SIZE]) -> Result<Self> {
        let lsn = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let txn_id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let offset = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let data_size = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        let flags_word = u32::from_le_bytes(buf[32..36].try_into().unwrap());

        let kind_raw = (flags_word >> KIND_SHIFT) as u8;
        let kind = EntryKind::try_from(kind_raw)
            .map_err(|()| QuillError::Corrupted(format!("Unknown log entry kind: {kind_raw}")))?;

        Ok(Self {
            lsn,
            txn_id,
            offset,
            data_size,
            flags: flags_word & FLAGS_MASK,
            kind,
        })
    }
}
