//! Page cache and journaling hooks.
//!
//! The pager sits between the store and the data file. Mutations happen on
//! cached frames; the write-ahead log sees a before-image the first time a
//! transaction dirties a page (`add_page_before`), after-images when the
//! transaction commits (`commit_images`), and a flush marker when a dirty
//! page is finally written back (`flush_all`).
//!
//! The engine is single-writer, so there is no eviction and no pinning: a
//! frame stays cached until recovery invalidates it or the pager is
//! dropped. Readers may fetch concurrently; the page table is behind a
//! `parking_lot` lock.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use parking_lot::{Mutex, RwLock};

use crate::error::{QuillError, Result};
use crate::storage::page::{DiskManager, Page, PageId, PAGE_SIZE};
use crate::storage::wal::Log;
use crate::transaction::SYSTEM_TXN_ID;

/// A cached page frame.
#[derive(Debug)]
struct Frame {
    data: Vec<u8>,
    dirty: bool,
    /// Transaction that last dirtied this frame (system id when none).
    dirty_txn: u64,
}

/// Page cache over the data file.
#[derive(Debug)]
pub struct Pager {
    disk: RwLock<DiskManager>,
    /// Cached frames by page byte offset, ordered so flushes and commit
    /// images are emitted deterministically.
    frames: RwLock<BTreeMap<u64, Frame>>,
    /// Before-images captured per (txn, page offset); doubles as the
    /// "already journaled" set that keeps prewrites to one per transaction
    /// per page.
    journal: Mutex<HashMap<(u64, u64), Vec<u8>>>,
}

impl Pager {
    /// Creates a new data file and an empty cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            disk: RwLock::new(DiskManager::create(path)?),
            frames: RwLock::new(BTreeMap::new()),
            journal: Mutex::new(HashMap::new()),
        })
    }

    /// Opens an existing data file.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::FileNotFound`] if the file does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            disk: RwLock::new(DiskManager::open(path)?),
            frames: RwLock::new(BTreeMap::new()),
            journal: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Returns the number of pages in the data file.
    #[must_use]
    pub fn num_pages(&self) -> u32 {
        self.disk.read().num_pages()
    }

    /// Returns a copy of the page at `offset`, loading it into the cache if
    /// necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the disk read fails.
    pub fn fetch(&self, offset: u64) -> Result<Vec<u8>> {
        {
            let frames = self.frames.read();
            if let Some(frame) = frames.get(&offset) {
                return Ok(frame.data.clone());
            }
        }

        let page = self.disk.read().read_page(PageId::from_offset(offset))?;
        let mut frames = self.frames.write();
        let frame = frames.entry(offset).or_insert_with(|| Frame {
            data: page.data.to_vec(),
            dirty: false,
            dirty_txn: SYSTEM_TXN_ID,
        });
        Ok(frame.data.clone())
    }

    /// Journals the before-image of the page at `offset` for `txn_id`.
    ///
    /// Invoked before a page is first mutated by a transaction. The image is
    /// captured once per (transaction, page); repeated calls are no-ops.
    /// When a log is present, a prewrite entry is appended; the image is
    /// also retained in memory so an abort can restore the frame without
    /// re-reading the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be loaded or the append fails.
    pub fn add_page_before(
        &self,
        log: Option<&mut Log>,
        txn_id: u64,
        offset: u64,
    ) -> Result<()> {
        let image = self.fetch(offset)?;

        let mut journal = self.journal.lock();
        if journal.contains_key(&(txn_id, offset)) {
            return Ok(());
        }
        if let Some(log) = log {
            log.append_prewrite(txn_id, offset, &image)?;
        }
        journal.insert((txn_id, offset), image);
        Ok(())
    }

    /// Replaces the content of the page at `offset` under `txn_id`,
    /// journaling the before-image first.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Page`] if `bytes` is not exactly one page, or
    /// any journaling/IO failure.
    pub fn update(
        &self,
        log: Option<&mut Log>,
        txn_id: u64,
        offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        if bytes.len() != PAGE_SIZE {
            return Err(QuillError::Page(format!(
                "page update must cover a full page ({} bytes given)",
                bytes.len()
            )));
        }
        self.add_page_before(log, txn_id, offset)?;

        let mut frames = self.frames.write();
        let frame = frames.get_mut(&offset).ok_or_else(|| {
            QuillError::Page(format!("page at offset {offset} vanished from the cache"))
        })?;
        frame.data.copy_from_slice(bytes);
        frame.dirty = true;
        frame.dirty_txn = txn_id;
        Ok(())
    }

    /// Allocates a fresh page under `txn_id` and returns its byte offset.
    ///
    /// The zeroed image is journaled as the page's before-image so an undo
    /// restores the page to empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be extended or the append fails.
    pub fn allocate_page(&self, log: Option<&mut Log>, txn_id: u64) -> Result<u64> {
        let page_id = self.disk.write().allocate_page()?;
        let offset = page_id.offset();

        let zeros = vec![0u8; PAGE_SIZE];
        if let Some(log) = log {
            log.append_prewrite(txn_id, offset, &zeros)?;
        }
        self.journal.lock().insert((txn_id, offset), zeros.clone());

        self.frames.write().insert(
            offset,
            Frame {
                data: zeros,
                dirty: true,
                dirty_txn: txn_id,
            },
        );
        Ok(offset)
    }

    /// Appends the after-image of every page `txn_id` dirtied. Called right
    /// before the commit entry so redo can replay the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if an append fails.
    pub fn commit_images(&self, log: &mut Log, txn_id: u64) -> Result<()> {
        let frames = self.frames.read();
        for (&offset, frame) in frames.iter() {
            if frame.dirty && frame.dirty_txn == txn_id {
                log.append_write(txn_id, offset, &frame.data)?;
            }
        }
        Ok(())
    }

    /// Ends a transaction in the cache. On rollback every frame the
    /// transaction touched is restored from its captured before-image; on
    /// commit the images are simply discarded.
    pub fn end_txn(&self, txn_id: u64, rollback: bool) {
        let mut journal = self.journal.lock();
        let touched: Vec<(u64, Vec<u8>)> = {
            let keys: Vec<(u64, u64)> = journal
                .keys()
                .filter(|(txn, _)| *txn == txn_id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| journal.remove(&key).map(|image| (key.1, image)))
                .collect()
        };
        drop(journal);

        if !rollback {
            return;
        }

        let mut frames = self.frames.write();
        for (offset, image) in touched {
            if let Some(frame) = frames.get_mut(&offset) {
                frame.data.copy_from_slice(&image);
                // the restored content may still differ from disk if an
                // earlier committed transaction never flushed this page
                frame.dirty = true;
                frame.dirty_txn = SYSTEM_TXN_ID;
            }
        }
    }

    /// Writes every dirty frame back to the data file, emitting a
    /// flush-page entry per page written.
    ///
    /// # Errors
    ///
    /// Returns an error on any write or append failure.
    pub fn flush_all(&self, mut log: Option<&mut Log>) -> Result<()> {
        let mut frames = self.frames.write();
        let disk = self.disk.read();
        for (&offset, frame) in frames.iter_mut() {
            if !frame.dirty {
                continue;
            }
            disk.write_at(offset, &frame.data)?;
            if let Some(log) = log.as_deref_mut() {
                log.append_flush_page(offset)?;
            }
            frame.dirty = false;
            frame.dirty_txn = SYSTEM_TXN_ID;
        }
        Ok(())
    }

    /// Marks every cached frame clean without writing it back.
    ///
    /// Test hook: simulates a crash that loses the writeback, leaving the
    /// data file behind the log.
    pub fn mark_all_clean(&self) {
        let mut frames = self.frames.write();
        for frame in frames.values_mut() {
            frame.dirty = false;
            frame.dirty_txn = SYSTEM_TXN_ID;
        }
    }

    /// Writes a recovery image directly to the data file, invalidating any
    /// cached frames the byte range overlaps.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn apply_image(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.disk.read().write_at(offset, bytes)?;

        let start = PageId::from_offset(offset).page_idx;
        let end = PageId::from_offset(offset + bytes.len().max(1) as u64 - 1).page_idx;
        let mut frames = self.frames.write();
        for idx in start..=end {
            frames.remove(&PageId::new(idx).offset());
        }
        Ok(())
    }

    /// Issues an fsync on the data file.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.disk.read().sync()
    }

    /// Reads the page at `offset` straight from disk, bypassing the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_page_uncached(&self, offset: u64) -> Result<Page> {
        self.disk.read().read_page(PageId::from_offset(offset))
    }
}
