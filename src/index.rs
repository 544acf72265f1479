//! In-memory sector index: `id -> (folder, slot, refcount)`, and the
//! placement policy used by `add_sector` to pick a destination folder.

use std::collections::HashMap;
use std::sync::Arc;

use crate::folder::FolderHandle;
use crate::salt::SectorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorLocation {
    pub folder_index: u16,
    pub slot: u64,
    pub refcount: u16,
}

#[derive(Debug, Default)]
pub struct SectorIndex {
    locations: HashMap<SectorId, SectorLocation>,
}

impl SectorIndex {
    pub fn new() -> Self {
        SectorIndex { locations: HashMap::new() }
    }

    pub fn get(&self, id: &SectorId) -> Option<SectorLocation> {
        self.locations.get(id).copied()
    }

    pub fn contains(&self, id: &SectorId) -> bool {
        self.locations.contains_key(id)
    }

    pub fn insert(&mut self, id: SectorId, location: SectorLocation) {
        self.locations.insert(id, location);
    }

    pub fn remove(&mut self, id: &SectorId) -> Option<SectorLocation> {
        self.locations.remove(id)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SectorId, &SectorLocation)> {
        self.locations.iter()
    }

    pub fn count_in_folder(&self, folder_index: u16) -> usize {
        self.locations.values().filter(|l| l.folder_index == folder_index).count()
    }

    /// Every `(id, location)` pointing into `folder_index`, for
    /// evacuation during shrink/remove.
    pub fn entries_in_folder(&self, folder_index: u16) -> Vec<(SectorId, SectorLocation)> {
        self.locations
            .iter()
            .filter(|(_, l)| l.folder_index == folder_index)
            .map(|(id, l)| (*id, *l))
            .collect()
    }
}

/// Orders candidate folders for a fresh `add_sector` placement:
/// descending free capacity, ties broken by ascending recent-failure
/// count, further ties broken by folder index for determinism. Folders
/// with zero free slots are excluded outright.
pub fn candidate_folders(folders: &HashMap<u16, Arc<FolderHandle>>) -> Vec<u16> {
    let mut candidates: Vec<(u16, u64, u64)> = folders
        .iter()
        .filter_map(|(&index, handle)| {
            let free = handle.counters.snapshot_free();
            if free == 0 {
                None
            } else {
                Some((index, free, handle.counters.snapshot_failed_writes()))
            }
        })
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)).then(a.0.cmp(&b.0)));
    candidates.into_iter().map(|(index, _, _)| index).collect()
}

/// Like [`candidate_folders`] but excludes `exclude`, used when
/// evacuating a folder that's being shrunk or removed (a slot can never
/// move to itself).
pub fn candidate_folders_excluding(folders: &HashMap<u16, Arc<FolderHandle>>, exclude: u16) -> Vec<u16> {
    candidate_folders(folders).into_iter().filter(|&i| i != exclude).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::{FolderCounters, StorageFolder};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;

    fn handle_with_free(index: u16, free: u64, failed_writes: u64, dir: &std::path::Path) -> Arc<FolderHandle> {
        let folder = StorageFolder::create(index, dir.to_path_buf(), 64, 4096).unwrap();
        let counters = FolderCounters::default();
        counters.free_slots.store(free, Ordering::Relaxed);
        counters.failed_writes.store(failed_writes, Ordering::Relaxed);
        Arc::new(FolderHandle { path: dir.to_path_buf(), folder: Mutex::new(folder), counters })
    }

    #[test]
    fn orders_by_free_capacity_then_failures() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let dir_c = tempfile::tempdir().unwrap();
        let mut folders = HashMap::new();
        folders.insert(0, handle_with_free(0, 10, 0, dir_a.path()));
        folders.insert(1, handle_with_free(1, 20, 5, dir_b.path()));
        folders.insert(2, handle_with_free(2, 20, 1, dir_c.path()));
        let order = candidate_folders(&folders);
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn full_folders_excluded() {
        let dir_a = tempfile::tempdir().unwrap();
        let mut folders = HashMap::new();
        folders.insert(0, handle_with_free(0, 0, 0, dir_a.path()));
        assert!(candidate_folders(&folders).is_empty());
    }
}
