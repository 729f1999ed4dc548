//! Per-file discard accounting.
//!
//! Each category owns one fixed-size discard file of 682 twelve-byte
//! slots:
//!
//! ```text
//! +-----+------------+----------------+
//! | fid |  total_sz  |  discarded_sz  |
//! +-----+------------+----------------+
//!   u32      u32           u32          (little-endian)
//! ```
//!
//! Writers never touch the counters directly: they push the displaced
//! pointer onto a bounded channel and a dedicated consumer thread folds
//! it into the slot for that fid. Merge reads the slots back to pick
//! compaction candidates.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::io::{FileIo, IoController};

pub(crate) const DISCARD_DIR: &str = "DISCARD";
pub(crate) const DISCARD_FILE_SUFFIX: &str = "discard";

const RECORD_SIZE: u64 = 12;
const FILE_SIZE: u64 = 2 << 12;
const SLOT_COUNT: u64 = FILE_SIZE / RECORD_SIZE;

/// One invalidation: `bytes` of the entry at `fid` are now garbage.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DiscardRecord {
    pub fid: u32,
    pub bytes: u32,
}

struct DiscardState {
    file: FileIo,
    /// Slot offset of each live fid.
    location: FxHashMap<u32, u64>,
    /// Offsets of zeroed slots available for allocation.
    free_list: Vec<u64>,
}

impl DiscardState {
    fn alloc(&mut self, fid: u32) -> Result<u64> {
        if let Some(&offset) = self.location.get(&fid) {
            return Ok(offset);
        }
        let offset = self.free_list.pop().ok_or(Error::DiscardFull)?;
        self.location.insert(fid, offset);
        Ok(offset)
    }

    fn incr(&mut self, fid: u32, bytes: u32) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let offset = self.alloc(fid)? + 8;
        let mut buf = [0u8; 4];
        self.file.read_exact_at(&mut buf, offset)?;
        let discarded = u32::from_le_bytes(buf).saturating_add(bytes);
        self.file.write_all_at(&discarded.to_le_bytes(), offset)?;
        Ok(())
    }

    fn zero_slot(&mut self, fid: u32) -> Result<()> {
        if let Some(offset) = self.location.remove(&fid) {
            self.file.write_all_at(&[0u8; RECORD_SIZE as usize], offset)?;
            self.free_list.push(offset);
        }
        Ok(())
    }
}

/// Discard accounting for one category.
pub(crate) struct Discard {
    state: Arc<Mutex<DiscardState>>,
    tx: Mutex<Option<SyncSender<DiscardRecord>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Discard {
    /// Opens (or creates) the discard file and rebuilds the slot tables by
    /// scanning every slot, then starts the consumer thread.
    pub(crate) fn open(dir: &Path, name: &str, buffer_size: usize) -> Result<Discard> {
        let file = FileIo::open(&dir.join(name), FILE_SIZE)?;

        let mut location = FxHashMap::default();
        let mut free_list = Vec::new();
        for slot in 0..SLOT_COUNT {
            let offset = slot * RECORD_SIZE;
            let mut buf = [0u8; RECORD_SIZE as usize];
            file.read_exact_at(&mut buf, offset)?;
            let fid = u32::from_le_bytes(buf[..4].try_into().unwrap());
            let total = u32::from_le_bytes(buf[4..8].try_into().unwrap());
            if fid == 0 && total == 0 {
                free_list.push(offset);
            } else {
                location.insert(fid, offset);
            }
        }
        debug!(name, live = location.len(), "opened discard file");

        let state = Arc::new(Mutex::new(DiscardState {
            file,
            location,
            free_list,
        }));
        let (tx, rx) = mpsc::sync_channel(buffer_size.max(1));
        let consumer = spawn_consumer(name.to_string(), Arc::clone(&state), rx);

        Ok(Discard {
            state,
            tx: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Registers a newly activated log file with its byte cap. A fid that
    /// already owns a slot keeps it.
    pub(crate) fn set_total(&self, fid: u32, total: u32) -> Result<()> {
        if fid == 0 || total == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.location.contains_key(&fid) {
            return Ok(());
        }
        let offset = state.alloc(fid)?;
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&fid.to_le_bytes());
        buf[4..].copy_from_slice(&total.to_le_bytes());
        state.file.write_all_at(&buf, offset)?;
        Ok(())
    }

    /// Queues an invalidation for the consumer. Never blocks; a full
    /// channel means accounting is lost, which later merges cannot
    /// tolerate, so it surfaces as [`Error::DiscardOverflow`].
    pub(crate) fn send(&self, record: DiscardRecord) -> Result<()> {
        if record.bytes == 0 {
            return Ok(());
        }
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Ok(()); // already closed; nothing left to account
        };
        match tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                error!(fid = record.fid, "discard channel full; accounting lost");
                Err(Error::DiscardOverflow)
            }
            Err(TrySendError::Disconnected(_)) => Ok(()),
        }
    }

    /// Zeroes the slot for `fid` after the file was merged away.
    pub(crate) fn clear(&self, fid: u32) -> Result<()> {
        self.state.lock().zero_slot(fid)
    }

    /// Same as [`clear`](Discard::clear); used when a file is deleted
    /// without going through merge.
    pub(crate) fn remove(&self, fid: u32) -> Result<()> {
        self.clear(fid)
    }

    /// Compaction candidate list: every fid (except the active one) whose
    /// discarded ratio exceeds `ratio`, ascending so older files compact
    /// first.
    pub(crate) fn candidates(&self, active_fid: u32, ratio: f64) -> Result<Vec<u32>> {
        let state = self.state.lock();
        let mut ccl = Vec::new();
        for slot in 0..SLOT_COUNT {
            let mut buf = [0u8; RECORD_SIZE as usize];
            state.file.read_exact_at(&mut buf, slot * RECORD_SIZE)?;
            let fid = u32::from_le_bytes(buf[..4].try_into().unwrap());
            let total = u32::from_le_bytes(buf[4..8].try_into().unwrap());
            let discarded = u32::from_le_bytes(buf[8..12].try_into().unwrap());
            if fid == 0 || fid == active_fid || total == 0 {
                continue;
            }
            if discarded as f64 / total as f64 > ratio {
                ccl.push(fid);
            }
        }
        ccl.sort_unstable();
        Ok(ccl)
    }

    /// Current `(total, discarded)` for a fid, if it owns a slot.
    pub(crate) fn stats(&self, fid: u32) -> Result<Option<(u32, u32)>> {
        let state = self.state.lock();
        let Some(&offset) = state.location.get(&fid) else {
            return Ok(None);
        };
        let mut buf = [0u8; RECORD_SIZE as usize];
        state.file.read_exact_at(&mut buf, offset)?;
        Ok(Some((
            u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        )))
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.state.lock().file.sync()
    }

    /// Drops the sender so the consumer drains and exits, then joins it
    /// and syncs the file. Idempotent.
    pub(crate) fn close(&self) -> Result<()> {
        drop(self.tx.lock().take());
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
        self.sync()
    }
}

impl Drop for Discard {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn spawn_consumer(
    name: String,
    state: Arc<Mutex<DiscardState>>,
    rx: Receiver<DiscardRecord>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("discard-{name}"))
        .spawn(move || {
            while let Ok(record) = rx.recv() {
                if let Err(e) = state.lock().incr(record.fid, record.bytes) {
                    error!(fid = record.fid, error = %e, "discard update failed");
                }
            }
        })
        .expect("spawn discard consumer")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_discard(dir: &Path) -> Discard {
        Discard::open(dir, "strsdiscard", 1024).expect("open discard")
    }

    fn drain(d: &Discard) {
        // close flushes the channel; reopen-style tests construct anew
        d.close().expect("close discard");
    }

    #[test]
    fn set_total_allocates_one_slot_per_fid() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let d = open_discard(dir.path());
        d.set_total(1, 1000)?;
        d.set_total(1, 2000)?; // second call keeps the original slot
        assert_eq!(d.stats(1)?, Some((1000, 0)));
        assert_eq!(d.stats(2)?, None);
        Ok(())
    }

    #[test]
    fn consumer_accumulates_discarded_bytes() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let d = open_discard(dir.path());
        d.set_total(1, 1000)?;
        d.send(DiscardRecord { fid: 1, bytes: 100 })?;
        d.send(DiscardRecord { fid: 1, bytes: 50 })?;
        drain(&d);
        assert_eq!(d.stats(1)?, Some((1000, 150)));
        Ok(())
    }

    #[test]
    fn slot_tables_survive_reopen() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        {
            let d = open_discard(dir.path());
            d.set_total(3, 900)?;
            d.send(DiscardRecord { fid: 3, bytes: 600 })?;
            d.close()?;
        }
        let d = open_discard(dir.path());
        assert_eq!(d.stats(3)?, Some((900, 600)));
        assert_eq!(d.candidates(4, 0.5)?, vec![3]);
        Ok(())
    }

    #[test]
    fn candidates_exclude_active_and_sort_ascending() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let d = open_discard(dir.path());
        for fid in [5u32, 2, 9] {
            d.set_total(fid, 100)?;
            d.send(DiscardRecord { fid, bytes: 80 })?;
        }
        d.set_total(1, 100)?; // below ratio, not a candidate
        drain(&d);

        assert_eq!(d.candidates(9, 0.5)?, vec![2, 5]);
        assert_eq!(d.candidates(0, 0.5)?, vec![2, 5, 9]);
        assert_eq!(d.candidates(0, 0.9)?, Vec::<u32>::new());
        Ok(())
    }

    #[test]
    fn clear_returns_slot_to_free_list() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let d = open_discard(dir.path());
        d.set_total(7, 500)?;
        d.send(DiscardRecord { fid: 7, bytes: 400 })?;
        drain(&d);

        d.clear(7)?;
        assert_eq!(d.stats(7)?, None);
        assert_eq!(d.candidates(0, 0.1)?, Vec::<u32>::new());

        // the freed slot is reusable
        d.set_total(8, 100)?;
        assert_eq!(d.stats(8)?, Some((100, 0)));
        Ok(())
    }

    #[test]
    fn overflowing_channel_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let d = Discard::open(dir.path(), "strsdiscard", 1)?;
        d.set_total(1, 100)?;
        // stall the consumer by holding the state lock, then overfill
        let guard = d.state.lock();
        let mut overflowed = false;
        for _ in 0..64 {
            match d.send(DiscardRecord { fid: 1, bytes: 1 }) {
                Err(Error::DiscardOverflow) => {
                    overflowed = true;
                    break;
                }
                Err(e) => return Err(e.into()),
                Ok(()) => {}
            }
        }
        drop(guard);
        assert!(overflowed);
        Ok(())
    }

    #[test]
    fn full_slot_table_reports_discard_full() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let d = open_discard(dir.path());
        for fid in 1..=SLOT_COUNT as u32 {
            d.set_total(fid, 100)?;
        }
        assert!(matches!(
            d.set_total(SLOT_COUNT as u32 + 1, 100),
            Err(Error::DiscardFull)
        ));
        Ok(())
    }
}
