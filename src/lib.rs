//! emberdb — an embedded, log-structured multi-structure key-value store.
//!
//! Five value categories (string, list, hash, set, sorted set) share one
//! Bitcask-shaped engine: every mutation appends to a per-category active
//! log file, an in-memory index points readers at the exact file and
//! offset, and a merge pass compacts files whose invalidated ratio (as
//! tracked by per-file discard counters) crosses a threshold.
//!
//! ```no_run
//! use emberdb::{Config, Db};
//!
//! let db = Db::open(Config::new("/tmp/emberdb"))?;
//! db.set(b"greeting", b"hello")?;
//! assert_eq!(db.get(b"greeting")?.as_ref(), b"hello");
//! db.close()?;
//! # Ok::<(), emberdb::Error>(())
//! ```

mod config;
mod db;
mod discard;
mod error;
mod index;
mod io;
mod logfile;
mod sharded;

pub use config::Config;
pub use db::{Db, WriteBatch};
pub use error::{Error, Result};
pub use io::IoKind;
pub use logfile::{Category, EntryStatus, LogEntry};
