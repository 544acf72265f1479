//! The write-ahead log: the single linearization point for every
//! state-changing operation, and the owner of the in-memory sector index
//! and folder table (the "WAL lock" protects exactly this data;
//! collapsing it into one `Mutex<WalInner>` makes that guarantee
//! structural instead of a convention callers must remember).

pub mod header;
pub mod recovery;
pub mod record;
pub mod sync;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bitfield::Bitfield;
use crate::consts::{WAL_FILE_NAME, WAL_TEMP_FILE_NAME};
use crate::folder::{FolderHandle, StorageFolder};
use crate::hooks::TestHooks;
use crate::index::SectorIndex;
use crate::salt::SectorSalt;
use crate::settings;

pub use header::{WalHeader, WalMetadata};
pub use record::{FolderAddition, FolderRemoval, FolderResize, SectorUpdate, StateChange};
pub use sync::SyncPoint;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] record::FrameError),
    #[error(transparent)]
    Settings(#[from] settings::SettingsError),
    #[error("WAL metadata version mismatch: {0:?}")]
    VersionMismatch(WalMetadata),
}

/// Applies a closure at least once; in debug/test builds it may run it
/// up to three times, to catch accidental non-idempotency in whatever it
/// mutates. Mirrors the upstream `at_least_one()` test harness.
pub fn at_least_one<F: FnMut()>(mut f: F) {
    #[cfg(debug_assertions)]
    let n = 1 + (rand::random::<u8>() % 3) as usize;
    #[cfg(not(debug_assertions))]
    let n = 1usize;
    for _ in 0..n {
        f();
    }
}

/// Everything guarded by the WAL lock: the uncommitted-changes queue,
/// the live sync point, the temp-file writer, and — per §5 — the
/// sector index and folder table themselves.
pub struct WalInner {
    pub revision: u64,
    pub uncommitted: Vec<StateChange>,
    pub sync_point: Arc<SyncPoint>,
    pub temp_file: BufWriter<File>,
    pub temp_offset: u64,
    /// Unfinished long-running-op fragments that must survive WAL
    /// rotation until their operation finalizes or errors, keyed by the
    /// folder index they concern.
    pub carry: HashMap<u16, StateChange>,
    pub sector_index: SectorIndex,
    pub storage_folders: HashMap<u16, Arc<FolderHandle>>,
}

pub struct Wal {
    pub persist_dir: PathBuf,
    pub hooks: Arc<dyn TestHooks>,
    pub sector_size: u64,
    pub salt: SectorSalt,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Constructs a `Wal` from already-recovered state (see
    /// `crate::manager::recover`), having already written a fresh WAL
    /// temp file with header + metadata at `revision`.
    pub fn from_recovered(
        persist_dir: PathBuf,
        hooks: Arc<dyn TestHooks>,
        sector_size: u64,
        salt: SectorSalt,
        revision: u64,
        temp_file: File,
        temp_offset: u64,
        sector_index: SectorIndex,
        storage_folders: HashMap<u16, Arc<FolderHandle>>,
    ) -> Self {
        Wal {
            persist_dir,
            hooks,
            sector_size,
            salt,
            inner: Mutex::new(WalInner {
                revision,
                uncommitted: Vec::new(),
                sync_point: SyncPoint::new(),
                temp_file: BufWriter::new(temp_file),
                temp_offset,
                carry: HashMap::new(),
                sector_index,
                storage_folders,
            }),
        }
    }

    /// Creates a brand-new WAL temp file at `revision`, already seeded
    /// with the given in-memory state. Used by `crate::manager`'s
    /// recovery path once replay and unfinished-operation cleanup have
    /// produced the state the running process should start from; the
    /// live WAL and settings files are left untouched until the first
    /// `sync_once`.
    pub fn create_fresh(
        persist_dir: PathBuf,
        hooks: Arc<dyn TestHooks>,
        sector_size: u64,
        salt: SectorSalt,
        revision: u64,
        storage_folders: HashMap<u16, Arc<FolderHandle>>,
        sector_index: SectorIndex,
    ) -> io::Result<Arc<Self>> {
        let temp_path = persist_dir.join(WAL_TEMP_FILE_NAME);
        let mut temp_file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&temp_path)?;
        let offset = header::write_header_and_metadata(&mut temp_file, revision)?;
        Ok(Arc::new(Wal::from_recovered(
            persist_dir,
            hooks,
            sector_size,
            salt,
            revision,
            temp_file,
            offset,
            sector_index,
            storage_folders,
        )))
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, WalInner> {
        self.inner.lock()
    }

    /// Appends `change` to the current WAL temp file (no fsync) and
    /// returns the sync point the caller must wait on for durability.
    /// Must be called with `inner` already locked by the caller, so the
    /// append is part of the same critical section that mutated the
    /// in-memory state the change describes.
    pub fn append_locked(inner: &mut WalInner, change: StateChange) -> Arc<SyncPoint> {
        if !change.is_empty() {
            let written = record::write_frame(&mut inner.temp_file, &change)
                .unwrap_or_else(|e| crate::error::fatal("WAL append", &e));
            inner.temp_offset += written;
            inner.uncommitted.push(change);
        }
        inner.sync_point.clone()
    }

    /// Like [`Wal::append_locked`], but also tracks `change` as the
    /// current unfinished fragment for `folder_index`, so it survives
    /// rotation until [`Wal::untrack_unfinished`] is called.
    pub fn append_and_track_locked(inner: &mut WalInner, folder_index: u16, change: StateChange) -> Arc<SyncPoint> {
        inner.carry.insert(folder_index, change.clone());
        Self::append_locked(inner, change)
    }

    pub fn untrack_unfinished_locked(inner: &mut WalInner, folder_index: u16) {
        inner.carry.remove(&folder_index);
    }

    /// Runs one sync-loop iteration: persists settings, every open
    /// folder's files, and the WAL itself, in that order, then fires the
    /// current sync point and rotates to a fresh temp WAL file. Fatal
    /// errors abort the process (§7); there's no safe way to continue
    /// once a rename or fsync needed for durability has failed.
    pub fn sync_once(&self) {
        let mut inner = self.inner.lock();

        let snapshot = {
            let folders: Vec<(u16, PathBuf, Bitfield)> = inner
                .storage_folders
                .iter()
                .map(|(&index, handle)| {
                    let folder = handle.folder.lock();
                    (index, folder.path.clone(), folder.usage().clone())
                })
                .collect();
            settings::build_snapshot(&self.salt, &folders)
        };

        // 1. settings snapshot: fsync temp, rename over live.
        if let Err(e) = settings::save(&self.persist_dir, &snapshot, self.hooks.as_ref()) {
            crate::error::fatal("settings rename", &e);
        }

        // 2. every open folder's files, fsynced concurrently.
        {
            let handles: Vec<Arc<FolderHandle>> = inner.storage_folders.values().cloned().collect();
            std::thread::scope(|scope| {
                let mut joins = Vec::new();
                for handle in &handles {
                    joins.push(scope.spawn(move || {
                        let folder = handle.folder.lock();
                        folder.sync()
                    }));
                }
                for join in joins {
                    if let Ok(Err(e)) = join.join() {
                        crate::error::fatal("storage folder fsync", &e);
                    }
                }
            });
        }

        // 3 & 4. fsync the WAL temp file, close it, rename over the live WAL.
        self.hooks.before_wal_rename();
        if let Err(e) = inner.temp_file.flush() {
            crate::error::fatal("WAL flush", &e);
        }
        if let Err(e) = inner.temp_file.get_ref().sync_all() {
            crate::error::fatal("WAL fsync", &e);
        }
        let temp_path = self.persist_dir.join(WAL_TEMP_FILE_NAME);
        let live_path = self.persist_dir.join(WAL_FILE_NAME);
        if let Err(e) = self.hooks.rename_wal(&temp_path, &live_path) {
            crate::error::fatal("WAL rename", &e);
        }

        // 5. fire the old sync point, install a fresh one.
        let old_point = std::mem::replace(&mut inner.sync_point, SyncPoint::new());
        old_point.fire();

        // 6-7. start a fresh WAL temp file at the next revision, seeded
        // with any still-unfinished long-running-op records.
        inner.revision += 1;
        let new_revision = inner.revision;
        let new_temp = match OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&temp_path) {
            Ok(f) => f,
            Err(e) => crate::error::fatal("WAL temp file creation", &e),
        };
        let mut writer = BufWriter::new(new_temp);
        let mut offset = match header::write_header_and_metadata(&mut writer, new_revision) {
            Ok(o) => o,
            Err(e) => crate::error::fatal("WAL header write", &e),
        };
        for change in inner.carry.values() {
            let mut change = change.clone();
            change.revision = new_revision;
            match record::write_frame(&mut writer, &change) {
                Ok(written) => offset += written,
                Err(e) => crate::error::fatal("WAL carry-forward write", &e),
            }
        }
        inner.temp_file = writer;
        inner.temp_offset = offset;

        // 8. clear the uncommitted list; it's all durable now.
        inner.uncommitted.clear();
    }

    /// Spawns the background sync-loop thread. Returns its `JoinHandle`;
    /// the thread exits once `shutdown` is observed true, after running
    /// one final `sync_once`.
    pub fn spawn_sync_loop(self: Arc<Self>, interval: std::time::Duration, shutdown: Arc<std::sync::atomic::AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            if shutdown.load(Ordering::Acquire) {
                self.sync_once();
                break;
            }
            self.sync_once();
        })
    }
}

/// Applies one `StateChange` to in-memory state, in the batch order
/// fixed by §5: additions, extensions, reductions, removals, sector
/// updates. Used both when an operation stages its own change (applied
/// synchronously, in the same lock scope that appends it) and when
/// replaying a historical WAL during recovery. Idempotent: applying the
/// same change twice leaves the same state as applying it once.
pub fn apply_state_change(
    storage_folders: &mut HashMap<u16, Arc<FolderHandle>>,
    sector_index: &mut SectorIndex,
    sector_size: u64,
    change: &StateChange,
) {
    for add in &change.storage_folder_additions {
        let index = add.index;
        // Opening the folder's files is not itself repeated by
        // `at_least_one`: file handles aren't idempotent to acquire
        // twice. What must be idempotent is the *effect* — the folder
        // ends up present in the table exactly once, however many times
        // this change is replayed.
        if !storage_folders.contains_key(&index) {
            if let Ok(folder) = StorageFolder::open(index, add.path.clone(), Bitfield::from_words(add.usage.clone()), sector_size) {
                storage_folders.entry(index).or_insert_with(|| FolderHandle::new(folder));
            }
        }
    }

    for ext in &change.storage_folder_extensions {
        reconcile_resize(storage_folders, ext);
    }
    for red in &change.storage_folder_reductions {
        reconcile_resize(storage_folders, red);
    }

    for rem in &change.storage_folder_removals {
        storage_folders.remove(&rem.index);
    }

    for su in &change.sector_updates {
        // Both the index update and the on-disk commit are plain
        // overwrites keyed by `(folder, slot)`, so replaying the same
        // `SectorUpdate` two or three times in a row leaves identical
        // state to replaying it once; `at_least_one` exercises that.
        at_least_one(|| {
            if su.refcount == 0 {
                sector_index.remove(&su.id);
            } else {
                sector_index.insert(su.id, crate::index::SectorLocation {
                    folder_index: su.folder,
                    slot: su.slot,
                    refcount: su.refcount,
                });
            }
            if let Some(handle) = storage_folders.get(&su.folder) {
                let mut folder = handle.folder.lock();
                let result = if su.refcount == 0 {
                    folder.release_slot(su.slot)
                } else {
                    folder.commit_slot(su.slot, &su.id, su.refcount)
                };
                if result.is_ok() {
                    handle.counters.free_slots.store(folder.usage().count_free(), Ordering::Relaxed);
                }
            }
        });
    }
}

fn reconcile_resize(storage_folders: &mut HashMap<u16, Arc<FolderHandle>>, resize: &FolderResize) {
    if let Some(handle) = storage_folders.get(&resize.index) {
        at_least_one(|| {
            let mut folder = handle.folder.lock();
            *folder.usage_mut() = Bitfield::from_words(resize.usage.clone());
            handle.counters.free_slots.store(folder.usage().count_free(), Ordering::Relaxed);
            handle.counters.capacity_slots.store(folder.capacity_slots(), Ordering::Relaxed);
        });
    }
}
