//! Error types for quilldb operations.

use thiserror::Error;

/// Result type alias using [`QuillError`].
pub type Result<T> = std::result::Result<T, QuillError>;

/// Error types for quilldb operations.
#[derive(Debug, Error)]
pub enum QuillError {
    // ==================== WAL Boundary Errors ====================
    /// Underlying read/write/fsync failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Open of a nonexistent file.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Log file header failed the magic or size check.
    #[error("Invalid log file header: {0}")]
    InvalidFileHeader(String),

    /// The log is non-empty and the database was opened without
    /// auto-recovery. Re-open with auto-recovery to recover.
    #[error("Log is not empty; open with auto-recovery enabled")]
    NeedRecovery,

    /// A payload allocation failed during iteration or recovery.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    // ==================== Storage Errors ====================
    /// General storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Page-related errors.
    #[error("Page error: {0}")]
    Page(String),

    /// Checksum validation failure.
    #[error("Checksum mismatch: {0}")]
    Checksum(String),

    /// Database file corruption detected.
    #[error("Corrupted database: {0}")]
    Corrupted(String),

    /// Invalid database magic bytes.
    #[error("Invalid database file: {0}")]
    InvalidDatabaseFile(String),

    /// Unsupported database version.
    #[error("Unsupported database version: {version} (max supported: {max_supported})")]
    UnsupportedVersion { version: u32, max_supported: u32 },

    // ==================== Transaction Errors ====================
    /// Transaction lifecycle errors.
    #[error("Transaction error: {0}")]
    Transaction(String),
}
