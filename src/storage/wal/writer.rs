//! The log writer: append operations, LSN assignment and checkpoint policy.

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{QuillError, Result};
use crate::storage::wal::entry::LogEntry;
use crate::storage::wal::file_pair::LogFilePair;
use crate::storage::wal::iterator::LogIterator;
use crate::storage::wal::LOG_HEADER_SIZE;
use crate::transaction::Transaction;

/// Default checkpoint threshold, in closed transactions per file.
pub const DEFAULT_CHECKPOINT_THRESHOLD: usize = 64;

/// The write-ahead log.
///
/// Owns the file pair and all append state. All appends are serialized on
/// the single writer; LSN assignment is atomic with respect to the append
/// (the entry is stamped and the counter incremented before the bytes reach
/// the file).
#[derive(Debug)]
pub struct Log {
    base: PathBuf,
    pair: LogFilePair,
    /// Index of the current file (0 or 1).
    current: usize,
    /// Next LSN to assign. Starts at 1; 0 is reserved.
    lsn: u64,
    /// LSN of the most recent checkpoint entry.
    last_checkpoint_lsn: u64,
    /// Closed-transaction count per file that triggers a checkpoint.
    threshold: usize,
    /// Transactions begun in each file and not yet committed or aborted.
    open_txns: [usize; 2],
    /// Transactions begun in each file and since committed or aborted.
    closed_txns: [usize; 2],
}

impl Log {
    /// Creates a fresh log: both files truncated to their headers, LSN 1,
    /// file 0 current.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Io`] if the files cannot be created.
    pub fn create(base: &Path) -> Result<Self> {
        let pair = LogFilePair::create(base)?;
        Ok(Self {
            base: base.to_path_buf(),
            pair,
            current: 0,
            lsn: 1,
            last_checkpoint_lsn: 0,
            threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            open_txns: [0; 2],
            closed_txns: [0; 2],
        })
    }

    /// Opens an existing log.
    ///
    /// Both headers are validated and each file is scanned to rebuild its
    /// entry index; the file holding the higher LSN becomes current and LSN
    /// assignment resumes past it. Transaction counters restart at zero:
    /// an opened non-empty log is read (and recovered), not appended to.
    ///
    /// # Errors
    ///
    /// [`QuillError::FileNotFound`] if a file is missing,
    /// [`QuillError::InvalidFileHeader`] on a bad magic,
    /// [`QuillError::Io`] otherwise.
    pub fn open(base: &Path) -> Result<Self> {
        let pair = LogFilePair::open(base)?;
        let current = pair.infer_current();
        let max_lsn = pair.last_lsn(0).max(pair.last_lsn(1));
        let last_checkpoint_lsn = pair
            .header(0)
            .last_checkpoint_lsn
            .max(pair.header(1).last_checkpoint_lsn);

        Ok(Self {
            base: base.to_path_buf(),
            pair,
            current,
            lsn: max_lsn + 1,
            last_checkpoint_lsn,
            threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            open_txns: [0; 2],
            closed_txns: [0; 2],
        })
    }

    /// Returns the base path the log files derive from.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Returns the next LSN that will be assigned.
    #[must_use]
    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    /// Returns the index of the current file (0 or 1).
    #[must_use]
    pub fn current_file(&self) -> usize {
        self.current
    }

    /// Returns the LSN of the most recent checkpoint (0 if none).
    #[must_use]
    pub fn last_checkpoint_lsn(&self) -> u64 {
        self.last_checkpoint_lsn
    }

    /// Returns the checkpoint threshold.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Sets the checkpoint threshold.
    pub fn set_threshold(&mut self, threshold: usize) {
        self.threshold = threshold;
    }

    /// Returns the number of open transactions begun in file `idx`.
    #[must_use]
    pub fn open_txns(&self, idx: usize) -> usize {
        self.open_txns[idx]
    }

    /// Returns the number of closed transactions begun in file `idx`.
    #[must_use]
    pub fn closed_txns(&self, idx: usize) -> usize {
        self.closed_txns[idx]
    }

    /// Returns true iff both files contain only their header.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pair.size(0) == LOG_HEADER_SIZE as u64 && self.pair.size(1) == LOG_HEADER_SIZE as u64
    }

    /// Appends a transaction-begin entry.
    ///
    /// # Errors
    ///
    /// Any I/O failure; the caller must treat the transaction as failed.
    pub fn append_txn_begin(&mut self, txn: &Transaction) -> Result<()> {
        let entry = LogEntry::txn_begin(txn.id(), self.next_lsn());
        self.pair.append(self.current, &entry, &[])?;
        self.open_txns[self.current] += 1;
        Ok(())
    }

    /// Appends a transaction-commit entry and fsyncs the current file: the
    /// commit is the durability fence. May insert a checkpoint and rotate
    /// afterwards (see [`Log::set_threshold`]).
    ///
    /// # Errors
    ///
    /// Any I/O failure; the caller must treat the transaction as failed.
    pub fn append_txn_commit(&mut self, txn: &Transaction) -> Result<()> {
        let entry = LogEntry::txn_commit(txn.id(), self.next_lsn());
        self.pair.append(self.current, &entry, &[])?;
        self.pair.sync(self.current)?;
        self.close_txn_counter();
        self.maybe_checkpoint()
    }

    /// Appends a transaction-abort entry. Counter bookkeeping matches
    /// commit; no fsync is required since aborted work is never redone.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    pub fn append_txn_abort(&mut self, txn: &Transaction) -> Result<()> {
        let entry = LogEntry::txn_abort(txn.id(), self.next_lsn());
        self.pair.append(self.current, &entry, &[])?;
        self.close_txn_counter();
        self.maybe_checkpoint()
    }

    /// Appends a checkpoint entry and fsyncs. Does not rotate by itself.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    pub fn append_checkpoint(&mut self) -> Result<()> {
        let entry = LogEntry::checkpoint(self.next_lsn());
        self.pair.append(self.current, &entry, &[])?;
        self.pair.sync(self.current)?;
        self.last_checkpoint_lsn = entry.lsn;
        Ok(())
    }

    /// Appends a flush-page entry for the page at `page_offset`.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    pub fn append_flush_page(&mut self, page_offset: u64) -> Result<()> {
        let entry = LogEntry::flush_page(self.next_lsn(), page_offset);
        self.pair.append(self.current, &entry, &[])
    }

    /// Appends a prewrite entry carrying the before-image of a byte range.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    pub fn append_prewrite(&mut self, txn_id: u64, offset: u64, data: &[u8]) -> Result<()> {
        let entry = LogEntry::prewrite(txn_id, self.next_lsn(), offset, data.len() as u64);
        self.pair.append(self.current, &entry, &[data])
    }

    /// Appends a write entry carrying the after-image of a byte range.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    pub fn append_write(&mut self, txn_id: u64, offset: u64, data: &[u8]) -> Result<()> {
        let entry = LogEntry::write(txn_id, self.next_lsn(), offset, data.len() as u64);
        self.pair.append(self.current, &entry, &[data])
    }

    /// Appends an overwrite entry carrying both images in one record, old
    /// image first. Both images must have the same length.
    ///
    /// # Errors
    ///
    /// Any I/O failure, or [`QuillError::Storage`] on mismatched lengths.
    pub fn append_overwrite(
        &mut self,
        txn_id: u64,
        offset: u64,
        old: &[u8],
        new: &[u8],
    ) -> Result<()> {
        if old.len() != new.len() {
            return Err(QuillError::Storage(format!(
                "overwrite images differ in length ({} vs {})",
                old.len(),
                new.len()
            )));
        }
        let entry = LogEntry::overwrite(
            txn_id,
            self.next_lsn(),
            offset,
            (old.len() + new.len()) as u64,
        );
        self.pair.append(self.current, &entry, &[old, new])
    }

    /// Returns true if the next commit or abort will insert a checkpoint.
    ///
    /// The database layer uses this to flush dirty pages before the commit,
    /// so that nothing preceding the checkpoint still needs redo.
    #[must_use]
    pub fn checkpoint_pending(&self) -> bool {
        self.open_txns[self.current] == 1
            && self.open_txns[self.current] + self.closed_txns[self.current] >= self.threshold
    }

    /// Truncates both files to their headers and resets all append state:
    /// LSN back to 1, counters to zero, file 0 current.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    pub fn clear(&mut self) -> Result<()> {
        self.pair.truncate_to_header(0)?;
        self.pair.truncate_to_header(1)?;
        self.current = 0;
        self.lsn = 1;
        self.last_checkpoint_lsn = 0;
        self.open_txns = [0; 2];
        self.closed_txns = [0; 2];
        self.write_headers()
    }

    /// Closes the log. Unless `dont_clear` is set, the log is cleared so a
    /// subsequent open finds it empty. `dont_clear` exists to preserve the
    /// log across a close so it can be recovered on the next open.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    pub fn close(mut self, dont_clear: bool) -> Result<()> {
        if dont_clear {
            self.write_headers()?;
        } else {
            self.clear()?;
        }
        self.pair.sync(0)?;
        self.pair.sync(1)
    }

    /// Returns an iterator over the entries in reverse chronological order.
    #[must_use]
    pub fn iter(&self) -> LogIterator<'_> {
        LogIterator::new(self)
    }

    pub(crate) fn pair(&self) -> &LogFilePair {
        &self.pair
    }

    fn next_lsn(&mut self) -> u64 {
        let lsn = self.lsn;
        self.lsn += 1;
        lsn
    }

    fn close_txn_counter(&mut self) {
        // the begin of this txn is in the current file: rotation is blocked
        // while any transaction is open
        self.open_txns[self.current] = self.open_txns[self.current].saturating_sub(1);
        self.closed_txns[self.current] += 1;
    }

    /// Inserts a checkpoint and rotates once the current file has seen
    /// `threshold` transactions and none remain open. An otherwise-eligible
    /// rotation is delayed until the commit or abort that brings the open
    /// count to zero.
    fn maybe_checkpoint(&mut self) -> Result<()> {
        if self.open_txns[self.current] != 0 {
            return Ok(());
        }
        if self.open_txns[self.current] + self.closed_txns[self.current] < self.threshold {
            return Ok(());
        }
        self.append_checkpoint()?;
        self.rotate()
    }

    /// Flips the current file and truncates the new current file to its
    /// header. After two successive rotations the older file is guaranteed
    /// to hold nothing needed for recovery.
    fn rotate(&mut self) -> Result<()> {
        let retired = self.current;
        self.current = 1 - self.current;
        self.pair.truncate_to_header(self.current)?;
        self.open_txns[self.current] = 0;
        self.closed_txns[self.current] = 0;
        self.write_headers()?;
        debug!(
            "log rotated: file {} -> file {} (checkpoint lsn {})",
            retired, self.current, self.last_checkpoint_lsn
        );
        Ok(())
    }

    fn write_headers(&mut self) -> Result<()> {
        for idx in 0..2 {
            self.pair
                .update_header(idx, idx == self.current, self.last_checkpoint_lsn)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_log() -> (Log, TempDir) {
        let temp = TempDir::new().unwrap();
        let log = Log::create(&temp.path().join("test.db")).unwrap();
        (log, temp)
    }

    #[test]
    fn test_fresh_log_state() {
        let (log, _temp) = create_test_log();
        assert_eq!(log.lsn(), 1);
        assert_eq!(log.current_file(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_begin_updates_counters_and_lsn() {
        let (mut log, _temp) = create_test_log();
        let txn = Transaction::new(1);

        log.append_txn_begin(&txn).unwrap();
        assert_eq!(log.lsn(), 2);
        assert!(!log.is_empty());
        assert_eq!(log.open_txns(0), 1);
        assert_eq!(log.closed_txns(0), 0);
        assert_eq!(log.open_txns(1), 0);
        assert_eq!(log.closed_txns(1), 0);
    }

    #[test]
    fn test_commit_migrates_counter() {
        let (mut log, _temp) = create_test_log();
        let txn = Transaction::new(1);

        log.append_txn_begin(&txn).unwrap();
        log.append_txn_commit(&txn).unwrap();
        assert_eq!(log.lsn(), 3);
        assert_eq!(log.open_txns(0), 0);
        assert_eq!(log.closed_txns(0), 1);
    }

    #[test]
    fn test_abort_migrates_counter() {
        let (mut log, _temp) = create_test_log();
        let txn = Transaction::new(1);

        log.append_txn_begin(&txn).unwrap();
        log.append_txn_abort(&txn).unwrap();
        assert_eq!(log.lsn(), 3);
        assert_eq!(log.open_txns(0), 0);
        assert_eq!(log.closed_txns(0), 1);
    }

    #[test]
    fn test_control_appends_advance_lsn() {
        let (mut log, _temp) = create_test_log();
        let data: Vec<u8> = (0..100).collect();

        log.append_checkpoint().unwrap();
        assert_eq!(log.lsn(), 2);
        log.append_flush_page(4096).unwrap();
        assert_eq!(log.lsn(), 3);
        log.append_prewrite(1, 0, &data).unwrap();
        assert_eq!(log.lsn(), 4);
        log.append_write(1, 0, &data).unwrap();
        assert_eq!(log.lsn(), 5);
        log.append_overwrite(1, 0, &data, &data).unwrap();
        assert_eq!(log.lsn(), 6);
    }

    #[test]
    fn test_overwrite_rejects_mismatched_images() {
        let (mut log, _temp) = create_test_log();
        let err = log.append_overwrite(1, 0, &[1, 2], &[1]).unwrap_err();
        assert!(matches!(err, QuillError::Storage(_)));
    }

    #[test]
    fn test_checkpoint_rotates_at_threshold() {
        let (mut log, _temp) = create_test_log();
        log.set_threshold(5);
        assert_eq!(log.threshold(), 5);
        assert_eq!(log.current_file(), 0);

        for id in 1..=7 {
            let txn = Transaction::new(id);
            log.append_txn_begin(&txn).unwrap();
            log.append_txn_commit(&txn).unwrap();
        }

        assert_eq!(log.current_file(), 1);
    }

    #[test]
    fn test_two_checkpoints_rotate_back() {
        let (mut log, _temp) = create_test_log();
        log.set_threshold(5);

        for id in 1..=11 {
            let txn = Transaction::new(id);
            log.append_txn_begin(&txn).unwrap();
            log.append_txn_commit(&txn).unwrap();
        }

        assert_eq!(log.current_file(), 0);
    }

    #[test]
    fn test_rotation_waits_for_open_txns() {
        let (mut log, _temp) = create_test_log();
        log.set_threshold(2);

        let long_lived = Transaction::new(1);
        log.append_txn_begin(&long_lived).unwrap();
        for id in 2..=4 {
            let txn = Transaction::new(id);
            log.append_txn_begin(&txn).unwrap();
            log.append_txn_commit(&txn).unwrap();
        }
        // three transactions closed, but one is still open
        assert_eq!(log.current_file(), 0);

        log.append_txn_commit(&long_lived).unwrap();
        assert_eq!(log.current_file(), 1);
    }

    #[test]
    fn test_clear_resets_log() {
        let (mut log, _temp) = create_test_log();
        let txn = Transaction::new(1);
        log.append_txn_begin(&txn).unwrap();
        assert!(!log.is_empty());
        assert_eq!(log.lsn(), 2);

        log.clear().unwrap();
        assert!(log.is_empty());
        assert_eq!(log.lsn(), 1);
        assert_eq!(log.current_file(), 0);
        assert_eq!(log.open_txns(0), 0);
    }

    #[test]
    fn test_close_clear_then_reopen_is_empty() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("test.db");

        let mut log = Log::create(&base).unwrap();
        let txn = Transaction::new(1);
        log.append_txn_begin(&txn).unwrap();
        log.append_txn_commit(&txn).unwrap();
        log.close(false).unwrap();

        let log = Log::open(&base).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.lsn(), 1);
    }

    #[test]
    fn test_close_dont_clear_preserves_entries() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("test.db");

        let mut log = Log::create(&base).unwrap();
        let txn = Transaction::new(1);
        log.append_txn_begin(&txn).unwrap();
        log.close(true).unwrap();

        let log = Log::open(&base).unwrap();
        assert!(!log.is_empty());
        assert_eq!(log.lsn(), 2);
    }
}
