//! A single storage folder: one sector-data file plus one
//! sector-metadata file, together exposing a fixed number of
//! equally-sized slots.
//!
//! offsets within the sector file: slot `i` lives at `i * sector_size`.
//! offsets within the metadata file: slot `i` lives at `i *
//! SECTOR_METADATA_DISK_SIZE`, storing `{ id[0..12], refcount: u16-LE }`.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use io_at::{ReadAt, WriteAt};

use crate::bitfield::Bitfield;
use crate::consts::{SECTOR_DATA_FILE_NAME, SECTOR_METADATA_DISK_SIZE, SECTOR_METADATA_FILE_NAME};
use crate::hooks::TestHooks;
use crate::salt::SectorId;

/// Lock-free I/O and capacity counters, readable without the folder's
/// mutex. Mutated only while the folder's mutex is held (so updates to
/// `free_slots` stay consistent with the bitfield), but reads for
/// placement decisions and `storage_folders()` snapshots never block.
#[derive(Debug, Default)]
pub struct FolderCounters {
    pub successful_reads: AtomicU64,
    pub successful_writes: AtomicU64,
    pub failed_reads: AtomicU64,
    pub failed_writes: AtomicU64,
    pub free_slots: AtomicU64,
    /// Mirrors the folder's current `capacity_slots()`, updated
    /// alongside `free_slots` every time the folder's size or usage
    /// changes, so a stats snapshot never has to take the folder mutex
    /// (which a long-running grow/shrink holds for the duration of its
    /// I/O) just to report capacity.
    pub capacity_slots: AtomicU64,
    pub progress_numerator: AtomicU64,
    pub progress_denominator: AtomicU64,
}

impl FolderCounters {
    pub fn snapshot_free(&self) -> u64 {
        self.free_slots.load(Ordering::Relaxed)
    }

    pub fn snapshot_capacity(&self) -> u64 {
        self.capacity_slots.load(Ordering::Relaxed)
    }

    pub fn snapshot_failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }
}

pub struct StorageFolder {
    pub index: u16,
    pub path: PathBuf,
    usage: Bitfield,
    sector_file: File,
    metadata_file: File,
    sector_size: u64,
    /// Slots returned by `allocate_slot` but not yet confirmed by
    /// `commit_slot`. Not set in `usage` yet; tracked so invariant #2
    /// ("queued-but-not-yet-committed" bits are excluded) can be checked
    /// and so a crash mid-add never double-allocates on recovery (the
    /// WAL simply never records the slot as used).
    queued: HashSet<u64>,
}

impl StorageFolder {
    /// Creates the two backing files for a brand-new folder of
    /// `initial_slots` slots (zero-filled) and returns the handle. Used
    /// only by the announce phase of `add_storage_folder`; growth beyond
    /// this point goes through [`StorageFolder::grow`].
    pub fn create(
        index: u16,
        path: PathBuf,
        initial_slots: u64,
        sector_size: u64,
    ) -> io::Result<Self> {
        let sector_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.join(SECTOR_DATA_FILE_NAME))?;
        let metadata_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.join(SECTOR_METADATA_FILE_NAME))?;
        sector_file.set_len(initial_slots * sector_size)?;
        metadata_file.set_len(initial_slots * SECTOR_METADATA_DISK_SIZE)?;
        Ok(StorageFolder {
            index,
            path,
            usage: Bitfield::with_capacity_slots(initial_slots),
            sector_file,
            metadata_file,
            sector_size,
            queued: HashSet::new(),
        })
    }

    /// Reopens an existing folder's backing files at startup, restoring
    /// the in-memory `usage` bitfield from the persisted settings
    /// snapshot (the files themselves carry no bitfield, only the raw
    /// slot contents).
    pub fn open(index: u16, path: PathBuf, usage: Bitfield, sector_size: u64) -> io::Result<Self> {
        let sector_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.join(SECTOR_DATA_FILE_NAME))?;
        let metadata_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.join(SECTOR_METADATA_FILE_NAME))?;
        Ok(StorageFolder {
            index,
            path,
            usage,
            sector_file,
            metadata_file,
            sector_size,
            queued: HashSet::new(),
        })
    }

    pub fn capacity_slots(&self) -> u64 {
        self.usage.capacity_slots()
    }

    pub fn usage(&self) -> &Bitfield {
        &self.usage
    }

    /// Direct access used only when reconciling in-memory state against
    /// a WAL record's recorded usage snapshot (`apply_state_change`).
    pub fn usage_mut(&mut self) -> &mut Bitfield {
        &mut self.usage
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    /// Picks a free slot near `hint` and immediately sets its usage bit,
    /// so a second `reserve_slot` call (racing on the same folder before
    /// this one reaches `commit_slot`) never scans the same slot as
    /// free. `queued` tracks only that the slot's metadata record and
    /// commit are still pending, not whether the bit is set. Returns
    /// `None` if the folder is full.
    pub fn reserve_slot(&mut self, hint: u64) -> Option<u64> {
        let slot = self.usage.find_free_near(hint)?;
        self.usage.set(slot);
        self.queued.insert(slot);
        Some(slot)
    }

    /// Writes the sector bytes at `slot`. Counted into
    /// `successful_writes`/`failed_writes` by the caller, since the
    /// caller (ops::sector_ops) holds the shared [`FolderCounters`].
    pub fn write_slot(&self, hooks: &dyn TestHooks, slot: u64, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(data.len() as u64, self.sector_size);
        if let Some(result) = hooks.instead_of_sector_write(self.index, slot) {
            return result;
        }
        self.sector_file.write_at(data, slot * self.sector_size)
    }

    pub fn read_slot(&self, hooks: &dyn TestHooks, slot: u64) -> io::Result<Vec<u8>> {
        if let Some(result) = hooks.instead_of_sector_read(self.index, slot) {
            result?;
        }
        let mut buf = vec![0u8; self.sector_size as usize];
        self.sector_file.read_at(&mut buf, slot * self.sector_size)?;
        Ok(buf)
    }

    /// Writes the 14-byte metadata record, makes sure the usage bit is
    /// set (it already is for a fresh add, via `reserve_slot`; a virtual
    /// add re-calls this with the bit already set from the original
    /// add), and clears the slot's queued mark.
    pub fn commit_slot(&mut self, slot: u64, id: &SectorId, refcount: u16) -> io::Result<()> {
        self.write_metadata_record(slot, id, refcount)?;
        self.usage.set(slot);
        self.queued.remove(&slot);
        Ok(())
    }

    /// Updates only the refcount of an already-committed slot (virtual
    /// add / remove-without-reaching-zero). The id must be unchanged.
    pub fn update_refcount(&mut self, slot: u64, id: &SectorId, refcount: u16) -> io::Result<()> {
        self.write_metadata_record(slot, id, refcount)
    }

    /// Clears the usage bit and zeroes the metadata record. Used by
    /// delete, by remove-reaching-zero, and to unwind a failed
    /// `allocate_slot` attempt.
    pub fn release_slot(&mut self, slot: u64) -> io::Result<()> {
        self.write_metadata_record(slot, &[0u8; crate::consts::SECTOR_ID_LEN], 0)?;
        self.usage.clear(slot);
        self.queued.remove(&slot);
        Ok(())
    }

    /// Undoes a reservation made by [`StorageFolder::reserve_slot`]
    /// whose sector-file write failed: clears the usage bit `reserve_slot`
    /// set, so the slot is free again for the next candidate. No
    /// metadata record exists for it yet, so there's nothing to zero.
    pub fn abandon_reservation(&mut self, slot: u64) {
        self.usage.clear(slot);
        self.queued.remove(&slot);
    }

    fn write_metadata_record(&mut self, slot: u64, id: &SectorId, refcount: u16) -> io::Result<()> {
        let mut record = [0u8; SECTOR_METADATA_DISK_SIZE as usize];
        record[..crate::consts::SECTOR_ID_LEN].copy_from_slice(id);
        record[crate::consts::SECTOR_ID_LEN..].copy_from_slice(&refcount.to_le_bytes());
        self.metadata_file
            .write_at(&record, slot * SECTOR_METADATA_DISK_SIZE)
    }

    /// Reads back the metadata record at `slot`, returning `(id,
    /// refcount)`. Used by recovery to rebuild the in-memory sector
    /// index from the raw folder contents when needed, and by
    /// evacuation to find out what's being moved.
    pub fn read_metadata_record(&self, slot: u64) -> io::Result<(SectorId, u16)> {
        let mut record = [0u8; SECTOR_METADATA_DISK_SIZE as usize];
        self.metadata_file
            .read_at(&mut record, slot * SECTOR_METADATA_DISK_SIZE)?;
        let mut id = [0u8; crate::consts::SECTOR_ID_LEN];
        id.copy_from_slice(&record[..crate::consts::SECTOR_ID_LEN]);
        let refcount = u16::from_le_bytes([
            record[crate::consts::SECTOR_ID_LEN],
            record[crate::consts::SECTOR_ID_LEN + 1],
        ]);
        Ok((id, refcount))
    }

    pub fn sync(&self) -> io::Result<()> {
        self.sector_file.sync_all()?;
        self.metadata_file.sync_all()?;
        Ok(())
    }

    /// Extends both backing files by `extra_slots`, in fixed-size steps
    /// so progress can be reported via `progress`. Does not touch the
    /// in-memory bitfield; the caller grows it separately once every
    /// step has landed.
    pub fn grow_files(
        &mut self,
        extra_slots: u64,
        progress_numerator: &AtomicU64,
        progress_denominator: &AtomicU64,
    ) -> io::Result<()> {
        let total_bytes = extra_slots * self.sector_size;
        let total_meta_bytes = extra_slots * SECTOR_METADATA_DISK_SIZE;
        progress_denominator.store(total_bytes, Ordering::Relaxed);
        progress_numerator.store(0, Ordering::Relaxed);

        let base_slots = self.usage.capacity_slots();
        let step = crate::consts::FOLDER_RESIZE_STEP_BYTES;
        let mut done = 0u64;
        while done < total_bytes {
            let chunk = step.min(total_bytes - done);
            self.sector_file
                .set_len((base_slots * self.sector_size) + done + chunk)?;
            done += chunk;
            progress_numerator.store(done, Ordering::Relaxed);
        }
        self.metadata_file
            .set_len((base_slots * SECTOR_METADATA_DISK_SIZE) + total_meta_bytes)?;
        self.usage.grow(extra_slots);
        Ok(())
    }

    /// Truncates both backing files down to `new_slots`. Callers must
    /// have already evacuated and cleared every bit at or beyond
    /// `new_slots`.
    pub fn shrink_files(&mut self, new_slots: u64) -> io::Result<()> {
        debug_assert!((new_slots..self.usage.capacity_slots()).all(|s| !self.usage.is_set(s)));
        self.sector_file.set_len(new_slots * self.sector_size)?;
        self.metadata_file
            .set_len(new_slots * SECTOR_METADATA_DISK_SIZE)?;
        self.usage.shrink(new_slots);
        Ok(())
    }

    /// Closes and removes both backing files, then the folder directory
    /// itself if it is now empty. Used by `remove_storage_folder`'s
    /// finalize phase.
    pub fn close_and_remove(self) -> io::Result<()> {
        let path = self.path.clone();
        drop(self.sector_file);
        drop(self.metadata_file);
        fs::remove_file(path.join(SECTOR_DATA_FILE_NAME))?;
        fs::remove_file(path.join(SECTOR_METADATA_FILE_NAME))?;
        Ok(())
    }

    /// Used by recovery to unwind an `unfinished_add` whose completion
    /// record never appeared: closes the handles and removes whatever
    /// was created.
    pub fn abort_unfinished_add(self) -> io::Result<()> {
        self.close_and_remove()
    }
}

/// A folder plus the lock guarding it and its lock-free counters. This is
/// the unit stored in the WAL's folder table: the per-folder mutex is the
/// innermost lock in the hierarchy (§5), acquired only after the WAL lock
/// has already been released or is about to be.
pub struct FolderHandle {
    /// Immutable copy of the folder's path, readable without taking
    /// `folder`'s mutex (a folder never changes path after creation).
    pub path: PathBuf,
    pub folder: parking_lot::Mutex<StorageFolder>,
    pub counters: FolderCounters,
}

impl FolderHandle {
    pub fn new(folder: StorageFolder) -> Arc<Self> {
        let counters = FolderCounters::default();
        counters.free_slots.store(folder.usage().count_free(), Ordering::Relaxed);
        counters.capacity_slots.store(folder.capacity_slots(), Ordering::Relaxed);
        let path = folder.path.clone();
        Arc::new(FolderHandle { path, folder: parking_lot::Mutex::new(folder), counters })
    }
}

pub fn validate_folder_path(path: &Path) -> io::Result<()> {
    if !path.is_absolute() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path is not absolute"));
    }
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path is not a directory"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoopHooks;

    #[test]
    fn commit_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = StorageFolder::create(0, dir.path().to_path_buf(), 64, 4096).unwrap();
        let id = [1u8; crate::consts::SECTOR_ID_LEN];
        let slot = folder.reserve_slot(0).unwrap();
        let data = vec![0xAB; 4096];
        folder.write_slot(&NoopHooks, slot, &data).unwrap();
        folder.commit_slot(slot, &id, 1).unwrap();
        assert!(folder.usage().is_set(slot));
        let read_back = folder.read_slot(&NoopHooks, slot).unwrap();
        assert_eq!(read_back, data);
        let (stored_id, refcount) = folder.read_metadata_record(slot).unwrap();
        assert_eq!(stored_id, id);
        assert_eq!(refcount, 1);
    }

    #[test]
    fn release_clears_bit_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = StorageFolder::create(0, dir.path().to_path_buf(), 64, 4096).unwrap();
        let id = [2u8; crate::consts::SECTOR_ID_LEN];
        let slot = folder.reserve_slot(0).unwrap();
        folder.commit_slot(slot, &id, 1).unwrap();
        folder.release_slot(slot).unwrap();
        assert!(!folder.usage().is_set(slot));
        let (stored_id, refcount) = folder.read_metadata_record(slot).unwrap();
        assert_eq!(stored_id, [0u8; crate::consts::SECTOR_ID_LEN]);
        assert_eq!(refcount, 0);
    }

    #[test]
    fn grow_then_shrink() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = StorageFolder::create(0, dir.path().to_path_buf(), 64, 4096).unwrap();
        let num = AtomicU64::new(0);
        let den = AtomicU64::new(0);
        folder.grow_files(64, &num, &den).unwrap();
        assert_eq!(folder.capacity_slots(), 128);
        folder.shrink_files(64).unwrap();
        assert_eq!(folder.capacity_slots(), 64);
    }
}
