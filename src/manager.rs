//! `ContractManager`: the public entry point. Owns the WAL outright (see
//! §9's note on the upstream's WAL/manager cyclic reference — here the
//! dependency runs one way), the shutdown barrier, and the background
//! sync-loop thread; every operation is a thin, `tracing::instrument`ed
//! dispatch into [`crate::ops`] guarded by the [`ThreadGroup`].
//!
//! This module also owns startup recovery: reading the settings
//! snapshot and WAL, rebuilding the in-memory sector index from the
//! folders' own metadata files, and resolving any long-running
//! operation that was announced but never finalized.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::bitfield::Bitfield;
use crate::consts::{Profile, WAL_FILE_NAME};
use crate::error::ContractManagerError;
use crate::folder::{FolderHandle, StorageFolder};
use crate::hooks::{NoopHooks, TestHooks};
use crate::index::{SectorIndex, SectorLocation};
use crate::ops::{folder_ops, sector_ops};
use crate::salt::{SectorId, SectorSalt};
use crate::settings;
use crate::threadgroup::ThreadGroup;
use crate::wal::{self, StateChange, Wal};

/// A point-in-time snapshot of one storage folder's public stats, as
/// returned by [`ContractManager::storage_folders`].
#[derive(Debug, Clone)]
pub struct StorageFolderMetadata {
    pub index: u16,
    pub path: PathBuf,
    pub capacity: u64,
    pub capacity_remaining: u64,
    pub failed_reads: u64,
    pub failed_writes: u64,
    pub successful_reads: u64,
    pub successful_writes: u64,
    pub progress_numerator: u64,
    pub progress_denominator: u64,
}

pub struct ContractManager {
    wal: Arc<Wal>,
    profile: Profile,
    hooks: Arc<dyn TestHooks>,
    threads: Arc<ThreadGroup>,
    shutdown: Arc<AtomicBool>,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ContractManager {
    /// Opens (or, if the persist directory is empty, creates) a Contract
    /// Manager rooted at `persist_dir`, using production `TestHooks`.
    pub fn new(persist_dir: PathBuf, sector_size: u64, profile: Profile) -> Result<Self, ContractManagerError> {
        Self::with_hooks(persist_dir, sector_size, profile, Arc::new(NoopHooks))
    }

    /// Like [`ContractManager::new`], but with an injected [`TestHooks`]
    /// so tests can simulate crashes at precise points (see §9 and the
    /// `TestHooks` doc comment).
    pub fn with_hooks(
        persist_dir: PathBuf,
        sector_size: u64,
        profile: Profile,
        hooks: Arc<dyn TestHooks>,
    ) -> Result<Self, ContractManagerError> {
        fs::create_dir_all(&persist_dir).map_err(|e| ContractManagerError::io("create persist directory", e))?;

        let recovered = recover(&persist_dir, sector_size, hooks.as_ref())?;

        let wal = wal::Wal::create_fresh(
            persist_dir.clone(),
            hooks.clone(),
            sector_size,
            recovered.salt,
            recovered.revision,
            recovered.storage_folders,
            recovered.sector_index,
        )
        .map_err(|e| ContractManagerError::io("create fresh WAL", e))?;

        // Resolved aborts/completions from recovery are appended as
        // their own record and forced durable with one synchronous
        // sync before the background loop (and any caller) can observe
        // the freshly opened manager, so a second crash immediately
        // after open can't re-discover the same unfinished operation.
        if !recovered.recovery_record.is_empty() {
            let mut inner = wal.lock();
            Wal::append_locked(&mut inner, recovered.recovery_record);
            drop(inner);
            wal.sync_once();
        }

        let threads = Arc::new(ThreadGroup::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let sync_thread = wal.clone().spawn_sync_loop(profile.sync_interval, shutdown.clone());

        Ok(ContractManager {
            wal,
            profile,
            hooks,
            threads,
            shutdown,
            sync_thread: Mutex::new(Some(sync_thread)),
        })
    }

    fn guard(&self) -> Result<crate::threadgroup::GroupGuard<'_>, ContractManagerError> {
        self.threads.add().ok_or(ContractManagerError::ShuttingDown)
    }

    #[tracing::instrument(skip(self, data), fields(bytes = data.len()))]
    pub fn add_sector(&self, merkle_root: &[u8; 32], data: &[u8]) -> Result<SectorId, ContractManagerError> {
        let _guard = self.guard()?;
        if data.len() as u64 != self.wal.sector_size {
            return Err(ContractManagerError::io(
                "sector data length mismatch",
                io::Error::new(io::ErrorKind::InvalidInput, "data length does not match configured sector size"),
            ));
        }
        sector_ops::add_sector(&self.wal, self.hooks.as_ref(), merkle_root, data)
    }

    #[tracing::instrument(skip(self))]
    pub fn remove_sector(&self, merkle_root: &[u8; 32]) -> Result<(), ContractManagerError> {
        let _guard = self.guard()?;
        let id = self.wal.salt.sector_id(merkle_root);
        sector_ops::remove_sector(&self.wal, &id)
    }

    #[tracing::instrument(skip(self))]
    pub fn delete_sector(&self, merkle_root: &[u8; 32]) -> Result<(), ContractManagerError> {
        let _guard = self.guard()?;
        let id = self.wal.salt.sector_id(merkle_root);
        sector_ops::delete_sector(&self.wal, &id)
    }

    #[tracing::instrument(skip(self))]
    pub fn read_sector(&self, merkle_root: &[u8; 32]) -> Result<Vec<u8>, ContractManagerError> {
        let _guard = self.guard()?;
        let id = self.wal.salt.sector_id(merkle_root);
        sector_ops::read_sector(&self.wal, self.hooks.as_ref(), &id)
    }

    #[tracing::instrument(skip(self))]
    pub fn add_storage_folder(&self, path: PathBuf, size_bytes: u64) -> Result<u16, ContractManagerError> {
        let _guard = self.guard()?;
        let slots = self.slots_for_bytes(size_bytes)?;
        folder_ops::add_storage_folder(&self.wal, &self.profile, path, slots)
    }

    /// Grows or shrinks storage folder `index` to `new_size_bytes`. A
    /// shrink that can't evacuate every sector at or beyond the new
    /// boundary fails with `insufficient_capacity` unless `force` is
    /// set, in which case unhoused sectors are dropped and the returned
    /// count says how many (§9's resolution of the open question about
    /// evacuation under force).
    #[tracing::instrument(skip(self))]
    pub fn resize_storage_folder(&self, index: u16, new_size_bytes: u64, force: bool) -> Result<u64, ContractManagerError> {
        let _guard = self.guard()?;
        let slots = self.slots_for_bytes(new_size_bytes)?;
        folder_ops::resize_storage_folder(&self.wal, self.hooks.as_ref(), &self.profile, index, slots, force)
    }

    /// Removes storage folder `index` entirely, evacuating its sectors
    /// first. See [`ContractManager::resize_storage_folder`] for what
    /// `force` does when evacuation can't find room for everything.
    #[tracing::instrument(skip(self))]
    pub fn remove_storage_folder(&self, index: u16, force: bool) -> Result<u64, ContractManagerError> {
        let _guard = self.guard()?;
        folder_ops::remove_storage_folder(&self.wal, self.hooks.as_ref(), index, force)
    }

    /// A point-in-time snapshot of every storage folder's stats. Reads
    /// only atomic counters — never a folder's own mutex, which a
    /// long-running grow/shrink holds for the duration of its I/O — so
    /// polling this during a resize observes live progress instead of
    /// blocking until the resize finishes.
    pub fn storage_folders(&self) -> Vec<StorageFolderMetadata> {
        let handles: Vec<(u16, Arc<FolderHandle>)> = {
            let inner = self.wal.lock();
            inner.storage_folders.iter().map(|(&index, handle)| (index, handle.clone())).collect()
        };
        handles
            .into_iter()
            .map(|(index, handle)| StorageFolderMetadata {
                index,
                path: handle.path.clone(),
                capacity: handle.counters.snapshot_capacity() * self.wal.sector_size,
                capacity_remaining: handle.counters.snapshot_free() * self.wal.sector_size,
                failed_reads: handle.counters.failed_reads.load(Ordering::Relaxed),
                failed_writes: handle.counters.failed_writes.load(Ordering::Relaxed),
                successful_reads: handle.counters.successful_reads.load(Ordering::Relaxed),
                successful_writes: handle.counters.successful_writes.load(Ordering::Relaxed),
                progress_numerator: handle.counters.progress_numerator.load(Ordering::Relaxed),
                progress_denominator: handle.counters.progress_denominator.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Orderly shutdown: refuse new operations, wait for in-flight ones
    /// to finish, force one last sync, then stop the background loop.
    /// Idempotent.
    pub fn close(&self) {
        self.threads.close();
        self.wal.sync_once();
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.sync_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn slots_for_bytes(&self, size_bytes: u64) -> Result<u64, ContractManagerError> {
        if size_bytes % self.wal.sector_size != 0 {
            return Err(ContractManagerError::BadSectorAlignment {
                size_bytes,
                sector_size: self.wal.sector_size,
            });
        }
        Ok(size_bytes / self.wal.sector_size)
    }
}

impl Drop for ContractManager {
    fn drop(&mut self) {
        self.close();
    }
}

struct Recovered {
    salt: SectorSalt,
    storage_folders: HashMap<u16, Arc<FolderHandle>>,
    sector_index: SectorIndex,
    revision: u64,
    /// Aborts/completions of unfinished long-running operations
    /// discovered during this recovery, already applied to
    /// `storage_folders`/the backing files; staged here so the caller
    /// can append it as the first durable record of the new WAL.
    recovery_record: StateChange,
}

/// Loads the settings snapshot and sector salt (generating a fresh salt
/// on first init), reopens every persisted folder and rebuilds the
/// sector index from each folder's own metadata file, then replays the
/// WAL (if any) on top and resolves whatever long-running operation it
/// left unfinished.
fn recover(dir: &std::path::Path, sector_size: u64, hooks: &dyn TestHooks) -> Result<Recovered, ContractManagerError> {
    let settings = settings::load(dir).map_err(|e| ContractManagerError::io("load settings", io::Error::new(io::ErrorKind::Other, e.to_string())))?;

    let (salt, mut storage_folders, mut sector_index) = match settings {
        Some(s) => {
            let salt = s.sector_salt().map_err(|e| ContractManagerError::io("decode sector salt", e))?;
            let mut folders = HashMap::new();
            let mut index = SectorIndex::new();
            for pf in &s.storage_folders {
                let usage = Bitfield::from_words(pf.usage.clone());
                let folder = StorageFolder::open(pf.index, pf.path.clone(), usage.clone(), sector_size)
                    .map_err(|e| ContractManagerError::io("reopen storage folder", e))?;
                for slot in usage.iter_set() {
                    let (id, refcount) = folder
                        .read_metadata_record(slot)
                        .map_err(|e| ContractManagerError::io("read sector metadata", e))?;
                    if refcount > 0 {
                        index.insert(id, SectorLocation { folder_index: pf.index, slot, refcount });
                    }
                }
                folders.insert(pf.index, FolderHandle::new(folder));
            }
            (salt, folders, index)
        }
        None => (SectorSalt::generate(), HashMap::new(), SectorIndex::new()),
    };

    // The live WAL is the last fully-promoted generation; the temp WAL is
    // whatever the sync loop had fsynced but not yet renamed into place
    // when the process last stopped. In the ordinary case (a clean close,
    // or simply "nothing has synced yet") the temp file is absent or
    // carries an empty, just-rotated header and contributes nothing; but
    // a crash between the WAL fsync and its rename leaves real records
    // stranded there, durable but never promoted. Replaying both, live
    // generation first, recovers that case without needing to distinguish
    // it from the steady state — reapplying an already-applied change is
    // a no-op by construction.
    let wal_path = dir.join(WAL_FILE_NAME);
    let wal_temp_path = dir.join(crate::consts::WAL_TEMP_FILE_NAME);
    let live = wal::recovery::read_wal_file(&wal_path).map_err(|e| ContractManagerError::io("read WAL file", e))?;
    let temp = wal::recovery::read_wal_file(&wal_temp_path).map_err(|e| ContractManagerError::io("read WAL temp file", e))?;

    for contents in [&live, &temp].into_iter().flatten() {
        if !contents.metadata.is_current() {
            return Err(crate::wal::WalError::VersionMismatch(contents.metadata.clone()).into());
        }
    }

    let mut revision = 0u64;
    let mut recovery_record = StateChange::default();

    if live.is_some() || temp.is_some() {
        let mut all_changes = Vec::new();
        if let Some(contents) = &live {
            all_changes.extend(contents.changes.iter().cloned());
        }
        if let Some(contents) = &temp {
            all_changes.extend(contents.changes.iter().cloned());
        }

        for change in &all_changes {
            wal::apply_state_change(&mut storage_folders, &mut sector_index, sector_size, change);
        }

        let last_known_revision = temp
            .as_ref()
            .map(|c| c.header.revision)
            .or_else(|| live.as_ref().map(|c| c.header.revision))
            .unwrap_or(0);
        revision = last_known_revision + 1;
        recovery_record = StateChange::with_revision(revision);
        resolve_unfinished(&all_changes, &mut storage_folders, sector_size, &mut recovery_record);
    }

    Ok(Recovered { salt, storage_folders, sector_index, revision, recovery_record })
}

/// Scans the replayed records for `unfinished_*` entries whose
/// completion or error record never showed up, and aborts (add,
/// extend) or completes (reduce) each one, pushing the corresponding
/// `errored_*` entry into `out` so the resolution itself becomes
/// durable as soon as the new WAL is written.
fn resolve_unfinished(
    changes: &[StateChange],
    storage_folders: &mut HashMap<u16, Arc<FolderHandle>>,
    sector_size: u64,
    out: &mut StateChange,
) {
    use crate::wal::{FolderAddition, FolderResize};

    let mut pending_adds: HashMap<u16, FolderAddition> = HashMap::new();
    let mut pending_exts: HashMap<u16, FolderResize> = HashMap::new();
    let mut pending_reds: HashMap<u16, FolderResize> = HashMap::new();

    for change in changes {
        for a in &change.unfinished_storage_folder_additions {
            pending_adds.insert(a.index, a.clone());
        }
        for idx in &change.errored_storage_folder_additions {
            pending_adds.remove(idx);
        }
        for a in &change.storage_folder_additions {
            pending_adds.remove(&a.index);
        }

        for e in &change.unfinished_storage_folder_extensions {
            pending_exts.insert(e.index, e.clone());
        }
        for idx in &change.errored_storage_folder_extensions {
            pending_exts.remove(idx);
        }
        for e in &change.storage_folder_extensions {
            pending_exts.remove(&e.index);
        }

        for r in &change.unfinished_storage_folder_reductions {
            pending_reds.insert(r.index, r.clone());
        }
        for idx in &change.errored_storage_folder_reductions {
            pending_reds.remove(idx);
        }
        for r in &change.storage_folder_reductions {
            pending_reds.remove(&r.index);
        }
    }

    for (index, add) in pending_adds {
        tracing::warn!(index, path = ?add.path, "aborting unfinished storage folder addition found at recovery");
        let initial_slots = add.usage.len() as u64 * crate::consts::FOLDER_GRANULARITY;
        if let Ok(folder) = StorageFolder::open(index, add.path.clone(), Bitfield::with_capacity_slots(initial_slots), sector_size) {
            let _ = folder.abort_unfinished_add();
        }
        out.errored_storage_folder_additions.push(index);
    }

    for (index, ext) in pending_exts {
        tracing::warn!(index, "aborting unfinished storage folder extension found at recovery");
        let old_slots = ext.usage.len() as u64 * crate::consts::FOLDER_GRANULARITY;
        if let Some(handle) = storage_folders.get(&index) {
            let mut folder = handle.folder.lock();
            let _ = folder.shrink_files(old_slots);
            handle.counters.free_slots.store(folder.usage().count_free(), Ordering::Relaxed);
            handle.counters.capacity_slots.store(folder.capacity_slots(), Ordering::Relaxed);
        }
        out.errored_storage_folder_extensions.push(index);
    }

    for (index, red) in pending_reds {
        tracing::warn!(index, "completing unfinished storage folder reduction found at recovery");
        // The sectors occupying the slots being dropped were already
        // evacuated (and that evacuation made durable) before this
        // reduction was even announced, so finishing the truncation is
        // always safe; there is nothing left to roll back.
        if let Some(handle) = storage_folders.get(&index) {
            let mut folder = handle.folder.lock();
            if folder.shrink_files(red.new_slots).is_ok() {
                handle.counters.free_slots.store(folder.usage().count_free(), Ordering::Relaxed);
                handle.counters.capacity_slots.store(folder.capacity_slots(), Ordering::Relaxed);
            }
        }
        out.storage_folder_reductions.push(red);
    }
}
