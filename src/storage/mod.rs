//! Storage layer: pages, the pager, the record store and the write-ahead
//! log.

pub mod page;
pub mod pager;
pub mod store;
pub mod wal;

pub use page::{DiskManager, Page, PageId, PAGE_SIZE};
pub use pager::Pager;
pub use store::{DatabaseHeader, KvStore, DB_MAGIC, DB_VERSION};
pub use wal::{
    recover, EntryKind, Log, LogEntry, LogHeader, LogIterator, RecoveryReport,
    DEFAULT_CHECKPOINT_THRESHOLD, ENTRY_HEADER_SIZE, LOG_HEADER_SIZE, LOG_MAGIC, NO_LSN,
};
