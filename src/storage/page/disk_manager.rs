//! Disk manager for page-level I/O on the data file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{QuillError, Result};
use crate::storage::page::{Page, PageId, PAGE_SIZE};

/// Manages disk I/O for the data file.
///
/// The disk manager handles:
/// - Reading and writing pages to/from the data file
/// - Allocating new pages (file extension)
/// - The data-file fsync used as the final durability fence of recovery
#[derive(Debug)]
pub struct DiskManager {
    /// Path to the data file.
    path: PathBuf,
    /// File handle for the data file.
    file: File,
    /// Next available page index.
    next_page_idx: u32,
}

impl DiskManager {
    /// Creates a new data file, truncating any existing one.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::Io`] if the file cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| QuillError::Io(format!("Failed to create data file: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_page_idx: 0,
        })
    }

    /// Opens an existing data file.
    ///
    /// # Errors
    ///
    /// Returns [`QuillError::FileNotFound`] if the file does not exist,
    /// [`QuillError::Io`] for any other failure.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    QuillError::FileNotFound(path.display().to_string())
                } else {
                    QuillError::Io(format!("Failed to open data file: {e}"))
                }
            })?;

        let file_len = file
            .metadata()
            .map_err(|e| QuillError::Io(format!("Failed to get file metadata: {e}")))?
            .len();

        let next_page_idx = file_len.div_ceil(PAGE_SIZE as u64) as u32;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_page_idx,
        })
    }

    /// Returns the path to the data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of pages in the data file.
    #[must_use]
    pub fn num_pages(&self) -> u32 {
        self.next_page_idx
    }

    /// Reads a page from disk.
    ///
    /// If the page doesn't exist yet (beyond current file size), returns a
    /// zeroed page.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(page_id.offset()))
            .map_err(|e| QuillError::Io(format!("Failed to seek to {page_id}: {e}")))?;

        let mut data = [0u8; PAGE_SIZE];
        match file.read_exact(&mut data) {
            Ok(()) => Ok(Page::from_data(page_id, data)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Page not materialized yet
                Ok(Page::zeroed(page_id))
            }
            Err(e) => Err(QuillError::Io(format!("Failed to read {page_id}: {e}"))),
        }
    }

    /// Writes a page to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_page(&self, page: &Page) -> Result<()> {
        self.write_at(page.id.offset(), &page.data)
    }

    /// Writes raw bytes at an arbitrary byte offset.
    ///
    /// Used by recovery to restore before- and after-images, which address
    /// the data file by byte range rather than page id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| QuillError::Io(format!("Failed to seek to offset {offset}: {e}")))?;
        file.write_all(bytes)
            .map_err(|e| QuillError::Io(format!("Failed to write at offset {offset}: {e}")))
    }

    /// Allocates a new page and returns its ID.
    ///
    /// The file is extended so the page exists (zero-filled); the content is
    /// written later through the pager.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be extended.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let page_idx = self.next_page_idx;
        self.next_page_idx += 1;

        let new_size = u64::from(page_idx + 1) * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .map_err(|e| QuillError::Io(format!("Failed to extend data file: {e}")))?;

        Ok(PageId::new(page_idx))
    }

    /// Flushes all buffered writes to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| QuillError::Io(format!("Failed to sync data file: {e}")))
    }

    /// Returns the size of the data file in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn file_size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| QuillError::Io(format!("Failed to get file size: {e}")))
    }
}
