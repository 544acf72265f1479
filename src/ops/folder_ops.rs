//! `add_storage_folder` / `resize_storage_folder` / `remove_storage_folder`.
//!
//! Add and grow follow the three-phase protocol from §5: announce (an
//! `unfinished_*` WAL record, durable before any file is touched), do
//! the actual file I/O with no lock held, then finalize (a plain WAL
//! record that both clears the `unfinished_*` entry and publishes the
//! result). A crash between announce and finalize leaves an
//! `unfinished_*` record behind for recovery to clean up.
//!
//! Removal does not use this protocol: the WAL record set has no
//! `unfinished_storage_folder_removals`/`errored_storage_folder_removals`
//! kind, so eviction is ordinary `sector_update` traffic followed by one
//! durable `storage_folder_removal` record, and only then a best-effort
//! unlink of the folder's files. That ordering means a crash can leave
//! an orphaned file on disk, never a dangling index entry.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::consts::{Profile, FOLDER_GRANULARITY};
use crate::error::ContractManagerError;
use crate::folder::{validate_folder_path, FolderHandle, StorageFolder};
use crate::hooks::TestHooks;
use crate::wal::{apply_state_change, FolderAddition, FolderRemoval, FolderResize, StateChange, Wal};

use super::sector_ops::{delete_sector, move_sector};

/// Evacuates `to_evacuate` out of `source_index`, moving each sector to
/// any other folder with room. With `force = false` the first sector
/// that can't be re-homed fails the whole operation (§4.5: "the
/// operation fails with insufficient_capacity and leaves state
/// unchanged"). With `force = true` a sector that can't be re-homed is
/// dropped instead — `delete_sector`d and counted — so the caller's
/// resize/remove can still proceed (§9's resolution of the
/// `remove_storage_folder(force=true)` open question, applied uniformly
/// to shrink as well since both evacuate through this same path).
fn evacuate(
    wal: &Wal,
    hooks: &dyn TestHooks,
    source_index: u16,
    to_evacuate: Vec<(crate::salt::SectorId, u64, u16)>,
    force: bool,
) -> Result<u64, ContractManagerError> {
    let mut lost = 0u64;
    for (id, slot, refcount) in to_evacuate {
        match move_sector(wal, hooks, id, source_index, slot, refcount) {
            Ok(()) => {}
            Err(_) if force => {
                tracing::warn!(folder = source_index, slot, id = ?id, "no destination capacity, dropping sector");
                delete_sector(wal, &id)?;
                lost += 1;
            }
            Err(_) => return Err(ContractManagerError::InsufficientCapacity(source_index)),
        }
    }
    Ok(lost)
}

fn validate_slot_count(profile: &Profile, slots: u64) -> Result<(), ContractManagerError> {
    if slots % FOLDER_GRANULARITY != 0 {
        return Err(ContractManagerError::BadGranularity { slots, granularity: FOLDER_GRANULARITY });
    }
    if slots > profile.max_slots_per_folder {
        return Err(ContractManagerError::TooLarge { slots, max: profile.max_slots_per_folder });
    }
    if slots < profile.min_slots_per_folder {
        return Err(ContractManagerError::TooSmall { slots, min: profile.min_slots_per_folder });
    }
    Ok(())
}

fn next_free_index(existing: &std::collections::HashMap<u16, Arc<FolderHandle>>, max_folders: u32) -> Result<u16, ContractManagerError> {
    if existing.len() as u32 >= max_folders {
        return Err(ContractManagerError::MaxFolders(max_folders));
    }
    (0u16..=u16::MAX)
        .find(|i| !existing.contains_key(i))
        .ok_or(ContractManagerError::MaxFolders(max_folders))
}

pub fn add_storage_folder(
    wal: &Wal,
    profile: &Profile,
    path: PathBuf,
    initial_slots: u64,
) -> Result<u16, ContractManagerError> {
    validate_folder_path(&path).map_err(|_| {
        if !path.is_absolute() {
            ContractManagerError::NotAbsolutePath(path.clone())
        } else {
            ContractManagerError::NotADirectory(path.clone())
        }
    })?;
    validate_slot_count(profile, initial_slots)?;

    let (index, sync_point) = {
        let mut inner = wal.lock();
        if inner.storage_folders.values().any(|h| h.path == path) {
            return Err(ContractManagerError::DuplicatePath(path));
        }
        let index = next_free_index(&inner.storage_folders, profile.max_folders)?;
        let usage = vec![0u64; (initial_slots / FOLDER_GRANULARITY) as usize];
        let mut change = StateChange::with_revision(inner.revision);
        change.unfinished_storage_folder_additions.push(FolderAddition { index, path: path.clone(), usage });
        let sync_point = Wal::append_and_track_locked(&mut inner, index, change);
        (index, sync_point)
    };
    sync_point.wait();

    match StorageFolder::create(index, path.clone(), initial_slots, wal.sector_size) {
        Ok(folder) => {
            let mut inner = wal.lock();
            Wal::untrack_unfinished_locked(&mut inner, index);
            inner.storage_folders.insert(index, FolderHandle::new(folder));
            let usage = vec![0u64; (initial_slots / FOLDER_GRANULARITY) as usize];
            let mut change = StateChange::with_revision(inner.revision);
            change.storage_folder_additions.push(FolderAddition { index, path, usage });
            let sync_point = Wal::append_locked(&mut inner, change);
            drop(inner);
            sync_point.wait();
            Ok(index)
        }
        Err(e) => {
            let mut inner = wal.lock();
            Wal::untrack_unfinished_locked(&mut inner, index);
            let mut change = StateChange::with_revision(inner.revision);
            change.errored_storage_folder_additions.push(index);
            let sync_point = Wal::append_locked(&mut inner, change);
            drop(inner);
            sync_point.wait();
            Err(ContractManagerError::io("storage folder creation", e))
        }
    }
}

/// Grows or shrinks storage folder `index` to exactly `new_slots`
/// slots. Shrinking evacuates every occupied slot at or beyond
/// `new_slots` into other folders before truncating the backing files.
/// With `force = false`, a slot that can't be re-homed fails the whole
/// operation and leaves the folder untouched; with `force = true` that
/// slot's sector is dropped instead, and the returned count says how
/// many were lost. Growing never evacuates anything, so it always
/// returns zero.
pub fn resize_storage_folder(
    wal: &Wal,
    hooks: &dyn TestHooks,
    profile: &Profile,
    index: u16,
    new_slots: u64,
    force: bool,
) -> Result<u64, ContractManagerError> {
    validate_slot_count(profile, new_slots)?;

    let handle = {
        let inner = wal.lock();
        inner.storage_folders.get(&index).cloned().ok_or(ContractManagerError::FolderNotFound(index))?
    };
    let current_slots = handle.folder.lock().capacity_slots();

    if new_slots > current_slots {
        grow_storage_folder(wal, &handle, index, current_slots, new_slots).map(|()| 0)
    } else if new_slots < current_slots {
        shrink_storage_folder(wal, hooks, &handle, index, new_slots, force)
    } else {
        Ok(0)
    }
}

fn grow_storage_folder(wal: &Wal, handle: &Arc<FolderHandle>, index: u16, current_slots: u64, new_slots: u64) -> Result<(), ContractManagerError> {
    let extra = new_slots - current_slots;

    let sync_point = {
        let mut inner = wal.lock();
        let usage = handle.folder.lock().usage().words().to_vec();
        let mut change = StateChange::with_revision(inner.revision);
        change.unfinished_storage_folder_extensions.push(FolderResize { index, new_slots, usage });
        Wal::append_and_track_locked(&mut inner, index, change)
    };
    sync_point.wait();

    let grow_result = {
        let mut folder = handle.folder.lock();
        folder.grow_files(extra, &handle.counters.progress_numerator, &handle.counters.progress_denominator)
    };

    let mut inner = wal.lock();
    Wal::untrack_unfinished_locked(&mut inner, index);
    let sync_point = if grow_result.is_ok() {
        let usage = handle.folder.lock().usage().words().to_vec();
        handle.counters.free_slots.store(handle.folder.lock().usage().count_free(), Ordering::Relaxed);
        handle.counters.capacity_slots.store(new_slots, Ordering::Relaxed);
        let mut change = StateChange::with_revision(inner.revision);
        change.storage_folder_extensions.push(FolderResize { index, new_slots, usage });
        Wal::append_locked(&mut inner, change)
    } else {
        let mut change = StateChange::with_revision(inner.revision);
        change.errored_storage_folder_extensions.push(index);
        Wal::append_locked(&mut inner, change)
    };
    drop(inner);
    sync_point.wait();
    grow_result.map_err(|e| ContractManagerError::io("storage folder grow", e))
}

fn shrink_storage_folder(
    wal: &Wal,
    hooks: &dyn TestHooks,
    handle: &Arc<FolderHandle>,
    index: u16,
    new_slots: u64,
    force: bool,
) -> Result<u64, ContractManagerError> {
    let to_evacuate: Vec<(crate::salt::SectorId, u64, u16)> = {
        let inner = wal.lock();
        inner
            .sector_index
            .entries_in_folder(index)
            .into_iter()
            .filter(|(_, loc)| loc.slot >= new_slots)
            .map(|(id, loc)| (id, loc.slot, loc.refcount))
            .collect()
    };

    let lost = evacuate(wal, hooks, index, to_evacuate, force)?;

    let sync_point = {
        let mut inner = wal.lock();
        let usage = handle.folder.lock().usage().words().to_vec();
        let mut change = StateChange::with_revision(inner.revision);
        change.unfinished_storage_folder_reductions.push(FolderResize { index, new_slots, usage });
        Wal::append_and_track_locked(&mut inner, index, change)
    };
    sync_point.wait();

    let shrink_result = {
        let mut folder = handle.folder.lock();
        folder.shrink_files(new_slots)
    };

    let mut inner = wal.lock();
    Wal::untrack_unfinished_locked(&mut inner, index);
    let sync_point = if let Ok(()) = &shrink_result {
        let usage = handle.folder.lock().usage().words().to_vec();
        handle.counters.free_slots.store(handle.folder.lock().usage().count_free(), Ordering::Relaxed);
        handle.counters.capacity_slots.store(new_slots, Ordering::Relaxed);
        let mut change = StateChange::with_revision(inner.revision);
        change.storage_folder_reductions.push(FolderResize { index, new_slots, usage });
        Wal::append_locked(&mut inner, change)
    } else {
        let mut change = StateChange::with_revision(inner.revision);
        change.errored_storage_folder_reductions.push(index);
        Wal::append_locked(&mut inner, change)
    };
    drop(inner);
    sync_point.wait();
    shrink_result.map(|()| lost).map_err(|e| ContractManagerError::io("storage folder shrink", e))
}

/// Evacuates every sector still stored in `index`, then durably removes
/// the folder from the index before attempting to delete its files.
/// Returns the number of sectors dropped under `force = true`.
pub fn remove_storage_folder(wal: &Wal, hooks: &dyn TestHooks, index: u16, force: bool) -> Result<u64, ContractManagerError> {
    let handle = {
        let inner = wal.lock();
        inner.storage_folders.get(&index).cloned().ok_or(ContractManagerError::FolderNotFound(index))?
    };

    let to_evacuate: Vec<(crate::salt::SectorId, u64, u16)> = {
        let inner = wal.lock();
        inner
            .sector_index
            .entries_in_folder(index)
            .into_iter()
            .map(|(id, loc)| (id, loc.slot, loc.refcount))
            .collect()
    };
    let lost = evacuate(wal, hooks, index, to_evacuate, force)?;

    let path = handle.folder.lock().path.clone();
    let sync_point = {
        let mut inner = wal.lock();
        let mut change = StateChange::with_revision(inner.revision);
        change.storage_folder_removals.push(FolderRemoval { index, path: path.clone() });
        apply_state_change(&mut inner.storage_folders, &mut inner.sector_index, wal.sector_size, &change);
        Wal::append_locked(&mut inner, change)
    };
    sync_point.wait();

    // Best effort only: if some other reference to this handle is still
    // alive (an operation that started before removal committed), the
    // files are left behind rather than removed out from under it. An
    // orphaned pair of files is not a correctness hazard; a dangling
    // index entry would be, which is why removal is ordered this way.
    match Arc::try_unwrap(handle) {
        Ok(folder_handle) => {
            let folder = folder_handle.folder.into_inner();
            let _ = folder.close_and_remove();
        }
        Err(_) => {}
    }

    Ok(lost)
}
