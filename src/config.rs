//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::io::IoKind;

/// Configuration for a [`Db`](crate::Db) instance.
///
/// All options other than `db_path` have defaults suitable for production
/// use; tests shrink `max_log_file_size` to force frequent rollover.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the log files and the `DISCARD/` subdirectory.
    pub db_path: PathBuf,

    /// Capacity of a single log file. A write that would push the active
    /// file past this size triggers rollover to a new fid.
    pub max_log_file_size: u64,

    /// Suggested cadence for background merge passes. The engine itself
    /// does not schedule merges; callers use this as a timer hint.
    pub log_file_merge_interval: Duration,

    /// I/O backend for log and discard files.
    pub io_kind: IoKind,

    /// Capacity of the per-category discard channel, in records. Overflow
    /// is unrecoverable (see [`Error::DiscardOverflow`](crate::Error)), so
    /// this should stay generous.
    pub discard_buffer_size: usize,

    /// A log file whose invalidated ratio exceeds this threshold becomes a
    /// merge candidate.
    pub log_file_gc_ratio: f64,

    /// Shard count for the archived-file registry, rounded up to the
    /// minimum of 32.
    pub index_shard_count: usize,
}

impl Config {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            max_log_file_size: 512 << 20,
            log_file_merge_interval: Duration::from_secs(8 * 60 * 60),
            io_kind: IoKind::File,
            discard_buffer_size: 8 << 20,
            log_file_gc_ratio: 0.5,
            index_shard_count: 32,
        }
    }
}
