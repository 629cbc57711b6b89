//! quilldb - embedded key/value store with crash recovery.
//!
//! Durability comes from a dual-file rotating write-ahead log: every page
//! mutation is journaled (before-image on first touch, after-image at
//! commit) so a crashed database can be brought back to its last committed
//! state by replaying the log. See [`storage::wal`] for the log itself and
//! [`storage::wal::recover`] for the three-pass recovery algorithm.

pub mod error;
pub mod storage;
pub mod transaction;

use std::path::{Path, PathBuf};

use log::debug;

pub use error::{QuillError, Result};
pub use storage::{Log, Pager, RecoveryReport, DEFAULT_CHECKPOINT_THRESHOLD};
pub use transaction::Transaction;

use storage::{recover, KvStore};

/// Configuration for opening or creating a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Maintain a write-ahead log alongside the data file (default: true).
    pub enable_recovery: bool,
    /// On open, recover a non-empty log automatically instead of failing
    /// with [`QuillError::NeedRecovery`] (default: false).
    pub auto_recovery: bool,
    /// Closed transactions per log file before a checkpoint is inserted and
    /// the log rotates.
    pub checkpoint_threshold: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enable_recovery: true,
            auto_recovery: false,
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
        }
    }
}

/// An embedded key/value database.
///
/// Single-writer: one mutator at a time drives `insert`/`erase`/`commit`;
/// concurrent readers go through `find`. Close the database explicitly:
/// dropping it without [`Database::close`] is treated as a crash and leaves
/// the log behind for recovery.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    pager: Pager,
    store: KvStore,
    log: Option<Log>,
    next_txn_id: u64,
}

impl Database {
    /// Creates a new database, truncating any existing files at `path`.
    ///
    /// With recovery enabled the log file pair is created alongside the
    /// data file, LSN 1, file 0 current.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Io`] if a file cannot be created.
    pub fn create(path: &Path, config: &DatabaseConfig) -> Result<Self> {
        let pager = Pager::create(path)?;
        let mut log = if config.enable_recovery {
            let mut log = Log::create(path)?;
            log.set_threshold(config.checkpoint_threshold);
            Some(log)
        } else {
            None
        };
        let store = KvStore::create(&pager, log.as_mut())?;
        // the superblock must be durable before the first transaction: a
        // crash right after create would otherwise leave a data file with
        // no readable header
        pager.flush_all(log.as_mut())?;
        pager.sync()?;
        pager.end_txn(0, false);

        Ok(Self {
            path: path.to_path_buf(),
            pager,
            store,
            log,
            next_txn_id: 1,
        })
    }

    /// Opens an existing database.
    ///
    /// With recovery enabled the log pair is opened (or created, if this is
    /// the first recovery-enabled open of the file). A non-empty log means
    /// the last close was not clean: without `auto_recovery` the open fails
    /// with [`QuillError::NeedRecovery`] and every file is left untouched;
    /// with it, recovery runs and the log is cleared before the store is
    /// loaded.
    ///
    /// # Errors
    ///
    /// [`QuillError::FileNotFound`] for a missing data file,
    /// [`QuillError::InvalidFileHeader`] for a corrupt log header,
    /// [`QuillError::NeedRecovery`] as described above.
    pub fn open(path: &Path, config: &DatabaseConfig) -> Result<Self> {
        let pager = Pager::open(path)?;

        let log = if config.enable_recovery {
            let mut log = match Log::open(path) {
                Ok(log) => log,
                Err(QuillError::FileNotFound(_)) => Log::create(path)?,
                Err(e) => return Err(e),
            };
            log.set_threshold(config.checkpoint_threshold);

            if !log.is_empty() {
                if !config.auto_recovery {
                    return Err(QuillError::NeedRecovery);
                }
                let report = recover(&mut log, &pager)?;
                debug!(
                    "auto-recovery finished: {} redone, {} undone",
                    report.redone_images, report.undone_images
                );
            }
            Some(log)
        } else {
            None
        };

        let store = KvStore::open(&pager)?;
        Ok(Self {
            path: path.to_path_buf(),
            pager,
            store,
            log,
            next_txn_id: 1,
        })
    }

    /// Returns the database path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begins a transaction, journaling its begin entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails.
    pub fn begin(&mut self) -> Result<Transaction> {
        let txn = Transaction::new(self.next_txn_id);
        self.next_txn_id += 1;
        if let Some(log) = self.log.as_mut() {
            log.append_txn_begin(&txn)?;
        }
        Ok(txn)
    }

    /// Commits a transaction: after-images of every page it dirtied are
    /// journaled, then the commit entry is appended and fsynced. When the
    /// commit will trigger a checkpoint, dirty pages are flushed first so
    /// nothing before the checkpoint needs redo.
    ///
    /// # Errors
    ///
    /// Any I/O failure; the caller must treat the transaction as failed and
    /// abort it.
    pub fn commit(&mut self, txn: Transaction) -> Result<()> {
        if let Some(log) = self.log.as_mut() {
            self.pager.commit_images(log, txn.id())?;
            if log.checkpoint_pending() {
                self.pager.flush_all(Some(&mut *log))?;
                self.pager.sync()?;
            }
            log.append_txn_commit(&txn)?;
        }
        self.pager.end_txn(txn.id(), false);
        Ok(())
    }

    /// Aborts a transaction: the abort entry is journaled and every page
    /// the transaction touched is restored in the cache from its captured
    /// before-image.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails (the in-memory rollback still
    /// happens).
    pub fn abort(&mut self, txn: Transaction) -> Result<()> {
        let result = match self.log.as_mut() {
            Some(log) => log.append_txn_abort(&txn),
            None => Ok(()),
        };
        self.pager.end_txn(txn.id(), true);
        // the rollback may have reverted the superblock (e.g. a page
        // allocated by the aborted transaction); reload it
        self.store = KvStore::open(&self.pager)?;
        result
    }

    /// Inserts or overwrites a key in its own transaction.
    ///
    /// # Errors
    ///
    /// Any storage or journaling failure; the implicit transaction is
    /// aborted on failure.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let txn = self.begin()?;
        match self
            .store
            .insert(&self.pager, self.log.as_mut(), txn.id(), key, value)
        {
            Ok(()) => self.commit(txn),
            Err(e) => {
                let _ = self.abort(txn);
                Err(e)
            }
        }
    }

    /// Looks up a key.
    ///
    /// # Errors
    ///
    /// Returns an error on a read failure or page corruption.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.lookup(&self.pager, key)
    }

    /// Erases a key in its own transaction. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Any storage or journaling failure; the implicit transaction is
    /// aborted on failure.
    pub fn erase(&mut self, key: &[u8]) -> Result<bool> {
        let txn = self.begin()?;
        match self
            .store
            .erase(&self.pager, self.log.as_mut(), txn.id(), key)
        {
            Ok(found) => {
                self.commit(txn)?;
                Ok(found)
            }
            Err(e) => {
                let _ = self.abort(txn);
                Err(e)
            }
        }
    }

    /// Inserts a key inside an already-open transaction.
    ///
    /// # Errors
    ///
    /// Any storage or journaling failure; the caller decides whether to
    /// abort.
    pub fn insert_in(&mut self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        self.store
            .insert(&self.pager, self.log.as_mut(), txn.id(), key, value)
    }

    /// Returns true if there is no log or the log is empty.
    #[must_use]
    pub fn is_log_empty(&self) -> bool {
        self.log.as_ref().map_or(true, Log::is_empty)
    }

    /// Returns the write-ahead log, if recovery is enabled.
    #[must_use]
    pub fn log(&self) -> Option<&Log> {
        self.log.as_ref()
    }

    /// Returns the write-ahead log mutably, if recovery is enabled.
    pub fn log_mut(&mut self) -> Option<&mut Log> {
        self.log.as_mut()
    }

    /// Returns the pager.
    #[must_use]
    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// Closes the database: dirty pages are written back (journaling their
    /// flush markers), the data file is fsynced, and the log is closed.
    /// The log is cleared unless `dont_clear` asks to preserve it for a
    /// later recovery.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    pub fn close(mut self, dont_clear: bool) -> Result<()> {
        match self.log.take() {
            Some(mut log) => {
                self.pager.flush_all(Some(&mut log))?;
                self.pager.sync()?;
                log.close(dont_clear)
            }
            None => {
                self.pager.flush_all(None)?;
                self.pager.sync()
            }
        }
    }
}
