//! Black-box integration tests against the public `ContractManager` API:
//! the end-to-end scenarios, boundary conditions, and idempotence
//! properties covering a crash-safe storage engine over fixed-size
//! sectors and storage folders.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use contractmanager::consts::SECTOR_DATA_FILE_NAME;
use contractmanager::hooks::TestHooks;
use contractmanager::{ContractManager, ContractManagerError, Profile};

const SECTOR_SIZE: u64 = 4096;

fn root(n: u32) -> [u8; 32] {
    let mut r = [0u8; 32];
    r[0..4].copy_from_slice(&n.to_le_bytes());
    r
}

fn data(n: u8) -> Vec<u8> {
    vec![n; SECTOR_SIZE as usize]
}

fn make_folder(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::create_dir_all(&path).unwrap();
    path
}

#[test]
fn scenario_add_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let persist = dir.path().to_path_buf();
    let folder = make_folder(dir.path(), "folder0");

    let manager = ContractManager::new(persist.clone(), SECTOR_SIZE, Profile::testing()).unwrap();
    manager.add_storage_folder(folder, 64 * SECTOR_SIZE).unwrap();

    let h = root(0);
    manager.add_sector(&h, &data(0)).unwrap();
    assert_eq!(manager.storage_folders()[0].capacity_remaining, 63 * SECTOR_SIZE);

    manager.close();
    drop(manager);

    let reopened = ContractManager::new(persist, SECTOR_SIZE, Profile::testing()).unwrap();
    assert_eq!(reopened.read_sector(&h).unwrap(), data(0));
    assert_eq!(reopened.storage_folders()[0].capacity_remaining, 63 * SECTOR_SIZE);
    reopened.close();
}

#[test]
fn scenario_fill_to_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let folder = make_folder(dir.path(), "folder0");

    let manager = Arc::new(ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, Profile::testing()).unwrap());
    manager.add_storage_folder(folder, 64 * SECTOR_SIZE).unwrap();

    let handles: Vec<_> = (0..64u32)
        .map(|i| {
            let m = manager.clone();
            std::thread::spawn(move || m.add_sector(&root(i), &data(i as u8)).unwrap())
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(manager.storage_folders()[0].capacity_remaining, 0);

    let err = manager.add_sector(&root(9999), &data(0)).unwrap_err();
    assert!(matches!(err, ContractManagerError::CapacityExhausted));

    for i in 0..64u32 {
        assert_eq!(manager.read_sector(&root(i)).unwrap(), data(i as u8));
    }
}

#[test]
fn scenario_virtual_add() {
    let dir = tempfile::tempdir().unwrap();
    let folder = make_folder(dir.path(), "folder0");

    let manager = ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, Profile::testing()).unwrap();
    manager.add_storage_folder(folder, 64 * SECTOR_SIZE).unwrap();

    let h = root(0);
    let d = data(0);
    manager.add_sector(&h, &d).unwrap();
    manager.add_sector(&h, &d).unwrap();
    assert_eq!(manager.storage_folders()[0].capacity_remaining, 63 * SECTOR_SIZE);

    manager.remove_sector(&h).unwrap();
    assert_eq!(manager.storage_folders()[0].capacity_remaining, 63 * SECTOR_SIZE);
    assert_eq!(manager.read_sector(&h).unwrap(), d);

    manager.remove_sector(&h).unwrap();
    assert_eq!(manager.storage_folders()[0].capacity_remaining, 64 * SECTOR_SIZE);
    assert!(matches!(manager.read_sector(&h).unwrap_err(), ContractManagerError::SectorNotFound));
}

#[test]
fn scenario_shrink_with_evacuation() {
    let dir = tempfile::tempdir().unwrap();
    let persist = dir.path().to_path_buf();
    let folder_a = make_folder(dir.path(), "a");
    let folder_b = make_folder(dir.path(), "b");

    let manager = ContractManager::new(persist.clone(), SECTOR_SIZE, Profile::testing()).unwrap();
    let idx_a = manager.add_storage_folder(folder_a, 256 * SECTOR_SIZE).unwrap();

    let roots: Vec<[u8; 32]> = (0..192u32).map(root).collect();
    for (i, r) in roots.iter().enumerate() {
        manager.add_sector(r, &data(i as u8)).unwrap();
    }

    let idx_b = manager.add_storage_folder(folder_b, 128 * SECTOR_SIZE).unwrap();
    assert_ne!(idx_a, idx_b);

    // Every slot at or beyond 128 in a 256-slot folder is at most 128
    // slots, which is exactly what B has free, so this must always
    // succeed regardless of how the salted hash actually distributed
    // the 192 sectors across A.
    let lost = manager.resize_storage_folder(idx_a, 128 * SECTOR_SIZE, false).unwrap();
    assert_eq!(lost, 0);

    for (i, r) in roots.iter().enumerate() {
        assert_eq!(manager.read_sector(r).unwrap(), data(i as u8));
    }

    let a_meta = manager.storage_folders().into_iter().find(|f| f.index == idx_a).unwrap();
    assert_eq!(a_meta.capacity, 128 * SECTOR_SIZE);

    manager.close();
    drop(manager);

    let reopened = ContractManager::new(persist, SECTOR_SIZE, Profile::testing()).unwrap();
    for (i, r) in roots.iter().enumerate() {
        assert_eq!(reopened.read_sector(r).unwrap(), data(i as u8));
    }
    reopened.close();
}

/// Reports every rename as successful without performing it, simulating a
/// crash landing between a sync's fsync and its rename.
struct SuppressRenames;

impl TestHooks for SuppressRenames {
    fn rename_settings(&self, _from: &Path, _to: &Path) -> io::Result<()> {
        Ok(())
    }

    fn rename_wal(&self, _from: &Path, _to: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn scenario_crash_between_wal_append_and_sync() {
    let dir = tempfile::tempdir().unwrap();
    let persist = dir.path().to_path_buf();
    let folder = make_folder(dir.path(), "folder0");

    // Phase 1: reach a clean, fully-promoted state (settings and WAL both
    // containing a valid salt and the folder) before any suppression.
    let setup = ContractManager::new(persist.clone(), SECTOR_SIZE, Profile::testing()).unwrap();
    setup.add_storage_folder(folder, 64 * SECTOR_SIZE).unwrap();
    setup.close();
    drop(setup);

    // Phase 2: reopen with renames suppressed and add one sector. Its
    // data and metadata are fsynced for real; only the promotion of the
    // WAL (and settings) temp files is faked as having succeeded.
    let crash_profile = Profile { sync_interval: Duration::from_millis(200), ..Profile::testing() };
    let hooks: Arc<dyn TestHooks> = Arc::new(SuppressRenames);
    let manager = ContractManager::with_hooks(persist.clone(), SECTOR_SIZE, crash_profile, hooks).unwrap();

    let h = root(0);
    manager.add_sector(&h, &data(0)).unwrap();

    // No close(): a real crash never runs destructors, and close() would
    // itself attempt (and, under these hooks, fake) one more sync.
    std::mem::forget(manager);

    // Phase 3: reopen with ordinary hooks. Recovery must find the record
    // in the orphaned temp WAL generation that never got promoted.
    let reopened = ContractManager::new(persist, SECTOR_SIZE, Profile::testing()).unwrap();
    assert_eq!(reopened.read_sector(&h).unwrap(), data(0));
    reopened.close();
}

/// Fails every sector-file write aimed at `target` once `enabled`.
struct FailFolder {
    target: u16,
    enabled: AtomicBool,
}

impl TestHooks for FailFolder {
    fn instead_of_sector_write(&self, folder: u16, _slot: u64) -> Option<io::Result<()>> {
        if self.enabled.load(Ordering::Relaxed) && folder == self.target {
            Some(Err(io::Error::new(io::ErrorKind::Other, "injected write failure")))
        } else {
            None
        }
    }
}

#[test]
fn scenario_failing_folder_redistributes_to_healthy_one() {
    let dir = tempfile::tempdir().unwrap();
    let persist = dir.path().to_path_buf();
    let folder_a = make_folder(dir.path(), "a");
    let folder_b = make_folder(dir.path(), "b");

    let hooks = Arc::new(FailFolder { target: 0, enabled: AtomicBool::new(false) });
    let manager = ContractManager::with_hooks(persist.clone(), SECTOR_SIZE, Profile::testing(), hooks.clone()).unwrap();
    let idx_a = manager.add_storage_folder(folder_a, 128 * SECTOR_SIZE).unwrap();
    manager.add_storage_folder(folder_b, 128 * SECTOR_SIZE).unwrap();
    assert_eq!(idx_a, hooks.target);

    let first: Vec<[u8; 32]> = (0..50u32).map(root).collect();
    for (i, r) in first.iter().enumerate() {
        manager.add_sector(r, &data(i as u8)).unwrap();
    }

    hooks.enabled.store(true, Ordering::Relaxed);

    let second: Vec<[u8; 32]> = (50..100u32).map(root).collect();
    for (i, r) in second.iter().enumerate() {
        manager.add_sector(r, &data((50 + i) as u8)).unwrap();
    }

    let a_meta = manager.storage_folders().into_iter().find(|f| f.index == idx_a).unwrap();
    assert!(a_meta.failed_writes > 0);

    for (i, r) in first.iter().enumerate() {
        assert_eq!(manager.read_sector(r).unwrap(), data(i as u8));
    }
    for (i, r) in second.iter().enumerate() {
        assert_eq!(manager.read_sector(r).unwrap(), data((50 + i) as u8));
    }

    manager.close();
    drop(manager);

    let reopened = ContractManager::new(persist, SECTOR_SIZE, Profile::testing()).unwrap();
    for (i, r) in first.iter().enumerate() {
        assert_eq!(reopened.read_sector(r).unwrap(), data(i as u8));
    }
    for (i, r) in second.iter().enumerate() {
        assert_eq!(reopened.read_sector(r).unwrap(), data((50 + i) as u8));
    }
    reopened.close();
}

#[test]
fn remove_storage_folder_evacuates_and_deletes_files() {
    let dir = tempfile::tempdir().unwrap();
    let folder_a = make_folder(dir.path(), "a");
    let folder_b = make_folder(dir.path(), "b");

    let manager = ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, Profile::testing()).unwrap();
    let idx_a = manager.add_storage_folder(folder_a.clone(), 64 * SECTOR_SIZE).unwrap();
    manager.add_storage_folder(folder_b, 64 * SECTOR_SIZE).unwrap();

    let roots: Vec<[u8; 32]> = (0..10u32).map(root).collect();
    for (i, r) in roots.iter().enumerate() {
        manager.add_sector(r, &data(i as u8)).unwrap();
    }

    let lost = manager.remove_storage_folder(idx_a, false).unwrap();
    assert_eq!(lost, 0);
    assert!(!folder_a.join(SECTOR_DATA_FILE_NAME).exists());

    for (i, r) in roots.iter().enumerate() {
        assert_eq!(manager.read_sector(r).unwrap(), data(i as u8));
    }
    assert!(manager.storage_folders().into_iter().all(|f| f.index != idx_a));
}

#[test]
fn remove_storage_folder_with_force_drops_unhoused_sectors() {
    let dir = tempfile::tempdir().unwrap();
    let folder_a = make_folder(dir.path(), "a");

    // Only one folder exists, so evacuation has nowhere to re-home a
    // sector and the plain removal must fail first.
    let manager = ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, Profile::testing()).unwrap();
    let idx_a = manager.add_storage_folder(folder_a, 64 * SECTOR_SIZE).unwrap();

    let h = root(0);
    manager.add_sector(&h, &data(0)).unwrap();

    let err = manager.remove_storage_folder(idx_a, false).unwrap_err();
    assert!(matches!(err, ContractManagerError::InsufficientCapacity(_)));

    let lost = manager.remove_storage_folder(idx_a, true).unwrap();
    assert_eq!(lost, 1);
    assert!(matches!(manager.read_sector(&h).unwrap_err(), ContractManagerError::SectorNotFound));
}

#[test]
fn add_then_remove_same_count_restores_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let folder = make_folder(dir.path(), "f");

    let manager = ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, Profile::testing()).unwrap();
    manager.add_storage_folder(folder, 64 * SECTOR_SIZE).unwrap();

    let before = manager.storage_folders()[0].capacity_remaining;
    let h = root(0);
    let d = data(0);
    for _ in 0..5 {
        manager.add_sector(&h, &d).unwrap();
    }
    for _ in 0..5 {
        manager.remove_sector(&h).unwrap();
    }

    assert_eq!(manager.storage_folders()[0].capacity_remaining, before);
    assert!(matches!(manager.read_sector(&h).unwrap_err(), ContractManagerError::SectorNotFound));
}

#[test]
fn delete_removes_regardless_of_refcount() {
    let dir = tempfile::tempdir().unwrap();
    let folder = make_folder(dir.path(), "f");

    let manager = ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, Profile::testing()).unwrap();
    manager.add_storage_folder(folder, 64 * SECTOR_SIZE).unwrap();

    let h = root(0);
    let d = data(0);
    manager.add_sector(&h, &d).unwrap();
    manager.add_sector(&h, &d).unwrap();
    manager.add_sector(&h, &d).unwrap();

    manager.delete_sector(&h).unwrap();
    assert!(matches!(manager.read_sector(&h).unwrap_err(), ContractManagerError::SectorNotFound));
    assert_eq!(manager.storage_folders()[0].capacity_remaining, 64 * SECTOR_SIZE);
}

#[test]
fn rejects_size_not_a_multiple_of_sector_size() {
    let dir = tempfile::tempdir().unwrap();
    let folder = make_folder(dir.path(), "f");
    let manager = ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, Profile::testing()).unwrap();
    let err = manager.add_storage_folder(folder, 64 * SECTOR_SIZE + 1).unwrap_err();
    assert!(matches!(err, ContractManagerError::BadSectorAlignment { .. }));
}

#[test]
fn rejects_slot_count_not_a_multiple_of_granularity() {
    let dir = tempfile::tempdir().unwrap();
    let folder = make_folder(dir.path(), "f");
    let manager = ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, Profile::testing()).unwrap();
    let err = manager.add_storage_folder(folder, 100 * SECTOR_SIZE).unwrap_err();
    assert!(matches!(err, ContractManagerError::BadGranularity { slots: 100, granularity: 64 }));
}

#[test]
fn rejects_below_configured_minimum() {
    let dir = tempfile::tempdir().unwrap();
    let folder = make_folder(dir.path(), "f");
    let profile = Profile { min_slots_per_folder: 128, ..Profile::testing() };
    let manager = ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, profile).unwrap();
    let err = manager.add_storage_folder(folder, 64 * SECTOR_SIZE).unwrap_err();
    assert!(matches!(err, ContractManagerError::TooSmall { slots: 64, min: 128 }));
}

#[test]
fn accepts_exactly_configured_maximum_rejects_one_granularity_step_beyond() {
    let dir = tempfile::tempdir().unwrap();
    let folder_ok = make_folder(dir.path(), "ok");
    let folder_bad = make_folder(dir.path(), "bad");
    let profile = Profile { max_slots_per_folder: 128, ..Profile::testing() };
    let manager = ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, profile).unwrap();
    manager.add_storage_folder(folder_ok, 128 * SECTOR_SIZE).unwrap();
    let err = manager.add_storage_folder(folder_bad, 192 * SECTOR_SIZE).unwrap_err();
    assert!(matches!(err, ContractManagerError::TooLarge { slots: 192, max: 128 }));
}

proptest! {
    /// I5: adding a sector `n` times then removing it `n` times leaves
    /// capacity unchanged from before the first add.
    #[test]
    fn add_remove_cycles_restore_capacity(n in 1u32..5) {
        let dir = tempfile::tempdir().unwrap();
        let folder = make_folder(dir.path(), "f");
        let manager = ContractManager::new(dir.path().to_path_buf(), SECTOR_SIZE, Profile::testing()).unwrap();
        manager.add_storage_folder(folder, 64 * SECTOR_SIZE).unwrap();

        let before = manager.storage_folders()[0].capacity_remaining;
        let h = root(0);
        let d = data(0);
        for _ in 0..n {
            manager.add_sector(&h, &d).unwrap();
        }
        for _ in 0..n {
            manager.remove_sector(&h).unwrap();
        }
        prop_assert_eq!(manager.storage_folders()[0].capacity_remaining, before);
    }
}
