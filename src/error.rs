//! Engine error kinds.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Index miss, tombstoned record, or lazily-expired key.
    #[error("key not found")]
    KeyNotFound,

    /// A pointer refers to a fid that is no longer registered. Outside of
    /// races against a concurrent merge this indicates corruption.
    #[error("log file {0} is missing")]
    LogFileMissing(u32),

    #[error("open log file failed: {0}")]
    OpenLogFailed(String),

    #[error("corrupt log entry: {0}")]
    CorruptEntry(&'static str),

    /// Internal sentinel returned by scanners when the zeroed end-of-data
    /// header is reached. Never surfaced to callers of the public API.
    #[error("end of log data")]
    EndOfLog,

    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// The discard file has no free slots. Hitting this during rollover
    /// implies more than 682 live log files in one category.
    #[error("discard file has no free slots")]
    DiscardFull,

    /// The bounded discard channel rejected a record. Accounting accuracy
    /// is lost from this point on, so the error is unrecoverable; size the
    /// buffer generously via `Config::discard_buffer_size`.
    #[error("discard channel overflowed")]
    DiscardOverflow,

    #[error("index is out of range")]
    WrongIndex,

    #[error("value is not an integer")]
    InvalidValueType,

    #[error("integer overflow")]
    IntegerOverflow,
}
