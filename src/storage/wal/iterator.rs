//! Reverse-chronological iteration over the log file pair.

use crate::error::Result;
use crate::storage::wal::entry::LogEntry;
use crate::storage::wal::writer::Log;

/// Iterator over log entries, newest first.
///
/// Starts at the most recently written entry of the current file; when it
/// reaches that file's header it continues from the tail of the other file.
/// Past the end it yields `Ok(None)`, the in-memory rendering of the
/// reserved LSN-0 sentinel.
///
/// Payload buffers are freshly allocated per call and owned by the caller;
/// the iterator never mutates the log.
pub struct LogIterator<'a> {
    log: &'a Log,
    /// File currently being walked.
    file: usize,
    /// Entries not yet yielded from this file.
    remaining: usize,
    /// Whether the iterator already moved off the current file.
    switched: bool,
}

impl<'a> LogIterator<'a> {
    pub(crate) fn new(log: &'a Log) -> Self {
        let file = log.current_file();
        Self {
            log,
            file,
            remaining: log.pair().entry_count(file),
            switched: false,
        }
    }

    /// Returns the next entry going backwards in time, with its payload if
    /// it carries one, or `None` past the oldest entry.
    ///
    /// # Errors
    ///
    /// [`crate::QuillError::Io`] on a read failure,
    /// [`crate::QuillError::OutOfMemory`] if the payload allocation fails.
    pub fn next_entry(&mut self) -> Result<Option<(LogEntry, Option<Vec<u8>>)>> {
        while self.remaining == 0 {
            if self.switched {
                return Ok(None);
            }
            self.switched = true;
            self.file = 1 - self.file;
            self.remaining = self.log.pair().entry_count(self.file);
        }

        self.remaining -= 1;
        let offset = self.log.pair().entry_offset(self.file, self.remaining);
        self.log
            .pair()
            .read_entry_at(self.file, offset)
            .map(Some)
    }
}
