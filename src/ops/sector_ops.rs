//! `add_sector` / `remove_sector` / `delete_sector` / `read_sector`.
//!
//! The expensive part of every one of these — the sector-data I/O — runs
//! with only a folder's own mutex held. The WAL lock is taken twice,
//! briefly: once to pick a candidate folder (or resolve a virtual add)
//! and once to commit the outcome into the sector index and append the
//! WAL record. This is the two-level locking scheme from §5: the WAL
//! lock is never held across a sector read or write.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::ContractManagerError;
use crate::folder::FolderHandle;
use crate::hooks::TestHooks;
use crate::index::{candidate_folders, candidate_folders_excluding};
use crate::salt::SectorId;
use crate::wal::{apply_state_change, SectorUpdate, StateChange, Wal};

/// Adds a sector under `merkle_root`, writing `data` (which must be
/// exactly one sector long). If a sector with the same id is already
/// indexed, this is a virtual add: no data is written, and only the
/// refcount is bumped (invariant: two callers adding identical data
/// never duplicate it on disk).
pub fn add_sector(wal: &Wal, hooks: &dyn TestHooks, merkle_root: &[u8; 32], data: &[u8]) -> Result<SectorId, ContractManagerError> {
    let id = wal.salt.sector_id(merkle_root);

    // Virtual add: entirely resolved under one WAL-lock critical
    // section, since it touches no sector-file bytes.
    {
        let mut inner = wal.lock();
        if let Some(location) = inner.sector_index.get(&id) {
            let new_refcount = location.refcount.saturating_add(1);
            let mut change = StateChange::with_revision(inner.revision);
            change.sector_updates.push(SectorUpdate {
                id,
                folder: location.folder_index,
                slot: location.slot,
                refcount: new_refcount,
            });
            apply_state_change(&mut inner.storage_folders, &mut inner.sector_index, wal.sector_size, &change);
            let sync_point = Wal::append_locked(&mut inner, change);
            drop(inner);
            sync_point.wait();
            return Ok(id);
        }
    }

    // Fresh add: snapshot candidates, then release the WAL lock before
    // doing any sector-file I/O.
    let candidates: Vec<(u16, Arc<FolderHandle>)> = {
        let inner = wal.lock();
        candidate_folders(&inner.storage_folders)
            .into_iter()
            .filter_map(|index| inner.storage_folders.get(&index).map(|h| (index, h.clone())))
            .collect()
    };

    if candidates.is_empty() {
        return Err(ContractManagerError::CapacityExhausted);
    }

    let mut last_error: Option<String> = None;
    for (folder_index, handle) in candidates {
        let hint = wal.salt.slot_hint(&id, folder_index, handle.folder.lock().capacity_slots());
        let slot = {
            let mut folder = handle.folder.lock();
            match folder.reserve_slot(hint) {
                Some(slot) => slot,
                None => continue,
            }
        };

        let write_result = {
            let folder = handle.folder.lock();
            folder.write_slot(hooks, slot, data)
        };

        if let Err(e) = write_result {
            handle.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
            handle.folder.lock().abandon_reservation(slot);
            last_error = Some(format!("folder {folder_index}: {e}"));
            continue;
        }

        let mut inner = wal.lock();
        let mut change = StateChange::with_revision(inner.revision);
        change.sector_updates.push(SectorUpdate { id, folder: folder_index, slot, refcount: 1 });
        apply_state_change(&mut inner.storage_folders, &mut inner.sector_index, wal.sector_size, &change);
        let sync_point = Wal::append_locked(&mut inner, change);
        drop(inner);
        handle.counters.successful_writes.fetch_add(1, Ordering::Relaxed);
        sync_point.wait();
        return Ok(id);
    }

    Err(ContractManagerError::AllFoldersFailed(last_error.unwrap_or_else(|| "no folder had a free slot".to_string())))
}

/// Decrements a sector's refcount, releasing its slot once it reaches
/// zero. Removing a sector that was never added is a `SectorNotFound`.
pub fn remove_sector(wal: &Wal, id: &SectorId) -> Result<(), ContractManagerError> {
    let mut inner = wal.lock();
    let location = inner.sector_index.get(id).ok_or(ContractManagerError::SectorNotFound)?;
    let new_refcount = location.refcount.saturating_sub(1);
    let mut change = StateChange::with_revision(inner.revision);
    change.sector_updates.push(SectorUpdate { id: *id, folder: location.folder_index, slot: location.slot, refcount: new_refcount });
    apply_state_change(&mut inner.storage_folders, &mut inner.sector_index, wal.sector_size, &change);
    let sync_point = Wal::append_locked(&mut inner, change);
    drop(inner);
    sync_point.wait();
    Ok(())
}

/// Forcibly removes a sector regardless of its current refcount. Unlike
/// [`remove_sector`], this ignores virtual-add sharing entirely: every
/// caller that added the same data loses access to it at once.
pub fn delete_sector(wal: &Wal, id: &SectorId) -> Result<(), ContractManagerError> {
    let mut inner = wal.lock();
    let location = inner.sector_index.get(id).ok_or(ContractManagerError::SectorNotFound)?;
    let mut change = StateChange::with_revision(inner.revision);
    change.sector_updates.push(SectorUpdate { id: *id, folder: location.folder_index, slot: location.slot, refcount: 0 });
    apply_state_change(&mut inner.storage_folders, &mut inner.sector_index, wal.sector_size, &change);
    let sync_point = Wal::append_locked(&mut inner, change);
    drop(inner);
    sync_point.wait();
    Ok(())
}

pub fn read_sector(wal: &Wal, hooks: &dyn TestHooks, id: &SectorId) -> Result<Vec<u8>, ContractManagerError> {
    let (handle, slot) = {
        let inner = wal.lock();
        let location = inner.sector_index.get(id).ok_or(ContractManagerError::SectorNotFound)?;
        let handle = inner
            .storage_folders
            .get(&location.folder_index)
            .cloned()
            .ok_or(ContractManagerError::FolderNotFound(location.folder_index))?;
        (handle, location.slot)
    };

    let folder = handle.folder.lock();
    match folder.read_slot(hooks, slot) {
        Ok(data) => {
            handle.counters.successful_reads.fetch_add(1, Ordering::Relaxed);
            Ok(data)
        }
        Err(e) => {
            handle.counters.failed_reads.fetch_add(1, Ordering::Relaxed);
            Err(ContractManagerError::io("sector read", e))
        }
    }
}

/// Moves one sector from its current folder into any other folder with
/// free space, used by shrink/remove to evacuate slots ahead of a
/// capacity reduction. Reads happen under the source folder's lock,
/// writes under the destination's; the WAL lock is taken only to commit
/// the new location.
pub(crate) fn move_sector(
    wal: &Wal,
    hooks: &dyn TestHooks,
    id: SectorId,
    from_folder: u16,
    from_slot: u64,
    refcount: u16,
) -> Result<(), ContractManagerError> {
    let source_handle = {
        let inner = wal.lock();
        inner.storage_folders.get(&from_folder).cloned().ok_or(ContractManagerError::FolderNotFound(from_folder))?
    };
    let data = {
        let folder = source_handle.folder.lock();
        folder.read_slot(hooks, from_slot).map_err(|e| ContractManagerError::io("evacuation read", e))?
    };

    let candidates: Vec<(u16, Arc<FolderHandle>)> = {
        let inner = wal.lock();
        candidate_folders_excluding(&inner.storage_folders, from_folder)
            .into_iter()
            .filter_map(|index| inner.storage_folders.get(&index).map(|h| (index, h.clone())))
            .collect()
    };

    for (dest_index, dest_handle) in candidates {
        let hint = wal.salt.slot_hint(&id, dest_index, dest_handle.folder.lock().capacity_slots());
        let dest_slot = {
            let mut folder = dest_handle.folder.lock();
            match folder.reserve_slot(hint) {
                Some(s) => s,
                None => continue,
            }
        };
        let write_result = {
            let folder = dest_handle.folder.lock();
            folder.write_slot(hooks, dest_slot, &data)
        };
        if let Err(e) = write_result {
            dest_handle.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
            dest_handle.folder.lock().abandon_reservation(dest_slot);
            let _ = e;
            continue;
        }

        let mut inner = wal.lock();
        let mut change = StateChange::with_revision(inner.revision);
        change.sector_updates.push(SectorUpdate { id, folder: from_folder, slot: from_slot, refcount: 0 });
        change.sector_updates.push(SectorUpdate { id, folder: dest_index, slot: dest_slot, refcount });
        apply_state_change(&mut inner.storage_folders, &mut inner.sector_index, wal.sector_size, &change);
        let sync_point = Wal::append_locked(&mut inner, change);
        drop(inner);
        sync_point.wait();
        return Ok(());
    }

    Err(ContractManagerError::InsufficientCapacity(from_folder))
}
