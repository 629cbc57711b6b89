//! The append-only log file pair.
//!
//! Two files share a common base path, suffixed `.log0` and `.log1`. Exactly
//! one is current at any time; appends go only to the current file and
//! rotation truncates the retired file back to its header.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{QuillError, Result};
use crate::storage::wal::entry::{LogEntry, ENTRY_HEADER_SIZE};
use crate::storage::wal::{LogHeader, LOG_HEADER_SIZE};

/// Returns the paths of the two log files for a database base path.
pub(crate) fn log_paths(base: &Path) -> (PathBuf, PathBuf) {
    let mut p0 = base.as_os_str().to_os_string();
    p0.push(".log0");
    let mut p1 = base.as_os_str().to_os_string();
    p1.push(".log1");
    (PathBuf::from(p0), PathBuf::from(p1))
}

/// One file of the pair, together with the entry index rebuilt at open.
#[derive(Debug)]
pub(crate) struct LogFile {
    file: File,
    path: PathBuf,
    header: LogHeader,
    /// Byte offset of every complete entry, in append order.
    entry_offsets: Vec<u64>,
    /// Highest LSN of a complete entry in this file (0 if none).
    last_lsn: u64,
    /// Byte offset one past the last complete entry.
    tail: u64,
}

impl LogFile {
    fn create(path: PathBuf, current: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| QuillError::Io(format!("Failed to create log file: {e}")))?;

        let header = LogHeader::new(current);
        let mut log_file = Self {
            file,
            path,
            header,
            entry_offsets: Vec::new(),
            last_lsn: 0,
            tail: LOG_HEADER_SIZE as u64,
        };
        log_file.write_header()?;
        Ok(log_file)
    }

    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    QuillError::FileNotFound(path.display().to_string())
                } else {
                    QuillError::Io(format!("Failed to open log file: {e}"))
                }
            })?;

        let mut buf = [0u8; LOG_HEADER_SIZE];
        let mut reader = &file;
        reader.seek(SeekFrom::Start(0)).map_err(io_err)?;
        reader.read_exact(&mut buf).map_err(|e| {
            QuillError::InvalidFileHeader(format!("log file shorter than its header: {e}"))
        })?;
        let header = LogHeader::decode(&buf);
        header.validate()?;

        let mut log_file = Self {
            file,
            path,
            header,
            entry_offsets: Vec::new(),
            last_lsn: 0,
            tail: LOG_HEADER_SIZE as u64,
        };
        log_file.scan_entries()?;
        Ok(log_file)
    }

    /// Walks the file forward from the header, indexing every complete
    /// entry. A partial or garbled tail (a crash mid-append) is dropped:
    /// everything from the first bad record on is treated as absent and will
    /// be overwritten by the next append.
    fn scan_entries(&mut self) -> Result<()> {
        let file_len = self
            .file
            .metadata()
            .map_err(|e| QuillError::Io(format!("Failed to get log file metadata: {e}")))?
            .len();

        let mut pos = LOG_HEADER_SIZE as u64;
        let mut prev_lsn = 0u64;
        let mut header_buf = [0u8; ENTRY_HEADER_SIZE];

        while pos + ENTRY_HEADER_SIZE as u64 <= file_len {
            let mut reader = &self.file;
            reader.seek(SeekFrom::Start(pos)).map_err(io_err)?;
            reader.read_exact(&mut header_buf).map_err(io_err)?;

            let entry = match LogEntry::decode(&header_buf) {
                Ok(entry) => entry,
                Err(_) => break,
            };
            // LSNs are strictly increasing within a file; anything else is a
            // stale or partial record
            if entry.lsn <= prev_lsn {
                break;
            }
            let end = pos + ENTRY_HEADER_SIZE as u64 + entry.data_size;
            if end > file_len {
                break;
            }

            self.entry_offsets.push(pos);
            prev_lsn = entry.lsn;
            pos = end;
        }

        if pos < file_len {
            warn!(
                "dropping truncated tail of {} ({} bytes past offset {})",
                self.path.display(),
                file_len - pos,
                pos
            );
        }

        self.last_lsn = prev_lsn;
        self.tail = pos;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        self.file.write_all(&self.header.encode()).map_err(io_err)?;
        Ok(())
    }

    fn append(&mut self, entry: &LogEntry, payloads: &[&[u8]]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.tail)).map_err(io_err)?;
        self.file.write_all(&entry.encode()).map_err(io_err)?;
        let mut written = ENTRY_HEADER_SIZE as u64;
        for payload in payloads {
            self.file.write_all(payload).map_err(io_err)?;
            written += payload.len() as u64;
        }

        self.entry_offsets.push(self.tail);
        self.tail += written;
        self.last_lsn = entry.lsn;
        Ok(())
    }

    fn truncate_to_header(&mut self) -> Result<()> {
        self.file
            .set_len(LOG_HEADER_SIZE as u64)
            .map_err(|e| QuillError::Io(format!("Failed to truncate log file: {e}")))?;
        self.entry_offsets.clear();
        self.last_lsn = 0;
        self.tail = LOG_HEADER_SIZE as u64;
        Ok(())
    }

    fn read_entry_at(&self, offset: u64) -> Result<(LogEntry, Option<Vec<u8>>)> {
        let mut reader = &self.file;
        reader.seek(SeekFrom::Start(offset)).map_err(io_err)?;

        let mut header_buf = [0u8; ENTRY_HEADER_SIZE];
        reader.read_exact(&mut header_buf).map_err(io_err)?;
        let entry = LogEntry::decode(&header_buf)?;

        if !entry.has_payload() {
            return Ok((entry, None));
        }

        let len = entry.data_size as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| QuillError::OutOfMemory(format!("log payload of {len} bytes")))?;
        data.resize(len, 0);
        reader.read_exact(&mut data).map_err(io_err)?;
        Ok((entry, Some(data)))
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| QuillError::Io(format!("Failed to sync log file: {e}")))
    }
}

fn io_err(e: std::io::Error) -> QuillError {
    QuillError::Io(format!("Log file I/O failed: {e}"))
}

/// The two log files.
#[derive(Debug)]
pub(crate) struct LogFilePair {
    files: [LogFile; 2],
}

impl LogFilePair {
    /// Creates both files with `O_CREAT|O_TRUNC` semantics, each receiving a
    /// fresh header. File 0 is marked current.
    pub(crate) fn create(base: &Path) -> Result<Self> {
        let (p0, p1) = log_paths(base);
        Ok(Self {
            files: [LogFile::create(p0, true)?, LogFile::create(p1, false)?],
        })
    }

    /// Opens both files, validating their headers and rebuilding the entry
    /// indexes.
    pub(crate) fn open(base: &Path) -> Result<Self> {
        let (p0, p1) = log_paths(base);
        Ok(Self {
            files: [LogFile::open(p0)?, LogFile::open(p1)?],
        })
    }

    /// Infers the current file: the one holding the higher LSN, falling back
    /// to the header marker when both files are empty.
    pub(crate) fn infer_current(&self) -> usize {
        let [f0, f1] = &self.files;
        if f0.last_lsn == 0 && f1.last_lsn == 0 {
            usize::from(f1.header.is_current())
        } else {
            usize::from(f1.last_lsn > f0.last_lsn)
        }
    }

    pub(crate) fn append(&mut self, idx: usize, entry: &LogEntry, payloads: &[&[u8]]) -> Result<()> {
        self.files[idx].append(entry, payloads)
    }

    pub(crate) fn truncate_to_header(&mut self, idx: usize) -> Result<()> {
        self.files[idx].truncate_to_header()
    }

    pub(crate) fn read_entry_at(&self, idx: usize, offset: u64) -> Result<(LogEntry, Option<Vec<u8>>)> {
        self.files[idx].read_entry_at(offset)
    }

    pub(crate) fn entry_count(&self, idx: usize) -> usize {
        self.files[idx].entry_offsets.len()
    }

    pub(crate) fn entry_offset(&self, idx: usize, n: usize) -> u64 {
        self.files[idx].entry_offsets[n]
    }

    pub(crate) fn last_lsn(&self, idx: usize) -> u64 {
        self.files[idx].last_lsn
    }

    pub(crate) fn size(&self, idx: usize) -> u64 {
        self.files[idx].tail
    }

    pub(crate) fn header(&self, idx: usize) -> &LogHeader {
        &self.files[idx].header
    }

    pub(crate) fn sync(&self, idx: usize) -> Result<()> {
        self.files[idx].sync()
    }

    pub(crate) fn update_header(
        &mut self,
        idx: usize,
        current: bool,
        last_checkpoint_lsn: u64,
    ) -> Result<()> {
        let file = &mut self.files[idx];
        file.header.set_current(current);
        file.header.last_checkpoint_lsn = last_checkpoint_lsn;
        file.header.last_lsn = file.last_lsn;
        file.write_header()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::entry::EntryKind;
    use tempfile::TempDir;

    fn base_path(temp: &TempDir) -> PathBuf {
        temp.path().join("test.db")
    }

    #[test]
    fn test_create_writes_two_header_only_files() {
        let temp = TempDir::new().unwrap();
        let pair = LogFilePair::create(&base_path(&temp)).unwrap();

        for idx in 0..2 {
            assert_eq!(pair.size(idx), LOG_HEADER_SIZE as u64);
            assert_eq!(pair.entry_count(idx), 0);
        }
        assert_eq!(pair.infer_current(), 0);

        let (p0, p1) = log_paths(&base_path(&temp));
        assert_eq!(p0.metadata().unwrap().len(), LOG_HEADER_SIZE as u64);
        assert_eq!(p1.metadata().unwrap().len(), LOG_HEADER_SIZE as u64);
    }

    #[test]
    fn test_open_missing_pair() {
        let temp = TempDir::new().unwrap();
        let err = LogFilePair::open(&base_path(&temp)).unwrap_err();
        assert!(matches!(err, QuillError::FileNotFound(_)));
    }

    #[test]
    fn test_open_bad_magic() {
        let temp = TempDir::new().unwrap();
        let base = base_path(&temp);
        LogFilePair::create(&base).unwrap();

        let (p0, _) = log_paths(&base);
        std::fs::write(&p0, vec![0xAA; LOG_HEADER_SIZE]).unwrap();

        let err = LogFilePair::open(&base).unwrap_err();
        assert!(matches!(err, QuillError::InvalidFileHeader(_)));
    }

    #[test]
    fn test_scan_rebuilds_entry_index() {
        let temp = TempDir::new().unwrap();
        let base = base_path(&temp);
        {
            let mut pair = LogFilePair::create(&base).unwrap();
            pair.append(0, &LogEntry::txn_begin(1, 1), &[]).unwrap();
            pair.append(0, &LogEntry::write(1, 2, 0, 4), &[&[9, 8, 7, 6]])
                .unwrap();
            pair.sync(0).unwrap();
        }

        let pair = LogFilePair::open(&base).unwrap();
        assert_eq!(pair.entry_count(0), 2);
        assert_eq!(pair.last_lsn(0), 2);
        assert_eq!(pair.infer_current(), 0);

        let (entry, data) = pair.read_entry_at(0, pair.entry_offset(0, 1)).unwrap();
        assert_eq!(entry.kind, EntryKind::Write);
        assert_eq!(data.as_deref(), Some(&[9, 8, 7, 6][..]));
    }

    #[test]
    fn test_scan_drops_truncated_tail() {
        let temp = TempDir::new().unwrap();
        let base = base_path(&temp);
        {
            let mut pair = LogFilePair::create(&base).unwrap();
            pair.append(0, &LogEntry::txn_begin(1, 1), &[]).unwrap();
            pair.sync(0).unwrap();
        }

        // simulate a crash mid-append: half an entry header at the tail
        let (p0, _) = log_paths(&base);
        let mut bytes = std::fs::read(&p0).unwrap();
        bytes.extend_from_slice(&LogEntry::txn_commit(1, 2).encode()[..20]);
        std::fs::write(&p0, bytes).unwrap();

        let pair = LogFilePair::open(&base).unwrap();
        assert_eq!(pair.entry_count(0), 1);
        assert_eq!(pair.last_lsn(0), 1);
    }

    #[test]
    fn test_scan_drops_payload_short_of_data_size() {
        let temp = TempDir::new().unwrap();
        let base = base_path(&temp);
        {
            let mut pair = LogFilePair::create(&base).unwrap();
            pair.append(0, &LogEntry::txn_begin(1, 1), &[]).unwrap();
            pair.sync(0).unwrap();
        }

        // entry header claims 100 payload bytes but only 3 made it to disk
        let (p0, _) = log_paths(&base);
        let mut bytes = std::fs::read(&p0).unwrap();
        bytes.extend_from_slice(&LogEntry::write(1, 2, 0, 100).encode());
        bytes.extend_from_slice(&[1, 2, 3]);
        std::fs::write(&p0, bytes).unwrap();

        let pair = LogFilePair::open(&base).unwrap();
        assert_eq!(pair.entry_count(0), 1);
    }
}
