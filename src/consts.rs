//! Release-dependent constants and the [`Profile`] value that replaces them.
//!
//! The upstream source picks `max_folders`/`max_slots_per_folder`/
//! `min_slots_per_folder` with build-time `cfg!` switches over three
//! release profiles (production, dev, testing). Here they are values on a
//! `Profile` passed to [`crate::manager::ContractManager::new`], so a
//! single binary can be pointed at any of the three without rebuilding.

use std::time::Duration;

/// Number of slots packed into one `u64` word of a folder's usage bitfield.
///
/// offset: n/a, size: 64 bits per word. Storage-folder sizes must be
/// multiples of this.
pub const FOLDER_GRANULARITY: u64 = 64;

/// Length, in bytes, of a sector id (the salted-hash prefix).
pub const SECTOR_ID_LEN: usize = 12;

/// Length, in bytes, of the process-wide sector salt.
pub const SECTOR_SALT_LEN: usize = 32;

/// On-disk size of one metadata record: a 12-byte id followed by a
/// little-endian `u16` refcount.
///
/// offset: n/a, size: 14 bytes (= [`SECTOR_ID_LEN`] + 2).
pub const SECTOR_METADATA_DISK_SIZE: u64 = SECTOR_ID_LEN as u64 + 2;

/// Growth/shrink step size used by the long-running folder operations, so
/// that progress can be reported and a single huge `set_len` call doesn't
/// block the folder lock for the entire resize.
pub const FOLDER_RESIZE_STEP_BYTES: u64 = 4 * 1024 * 1024;

pub const SETTINGS_FILE_NAME: &str = "contractmanager.json";
pub const SETTINGS_TEMP_FILE_NAME: &str = "contractmanager.json_temp";
pub const WAL_FILE_NAME: &str = "contractmanager.wal";
pub const WAL_TEMP_FILE_NAME: &str = "contractmanager.wal_temp";
pub const SECTOR_DATA_FILE_NAME: &str = "siahostdata.dat";
pub const SECTOR_METADATA_FILE_NAME: &str = "sectormetadata.dat";

pub const SETTINGS_HEADER_STRING: &str = "Sia Storage Manager Persist Header";
pub const SETTINGS_VERSION_STRING: &str = "1.0.0";
pub const WAL_HEADER_STRING: &str = "Sia Storage Manager WAL Header";
pub const WAL_VERSION_STRING: &str = "1.0.0";

/// Maximum number of bytes a single WAL record's serialized payload may
/// claim to be. A length field beyond this is treated as tail corruption
/// rather than as an allocation request.
pub const WAL_MAX_RECORD_LEN: u64 = 64 * 1024 * 1024;

/// Build-profile constants, gathered into one value instead of compiled-in
/// constants so a single binary can run any of the three release profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    /// Maximum number of storage folders the engine will track.
    pub max_folders: u32,
    /// Maximum number of slots a single storage folder may hold.
    pub max_slots_per_folder: u64,
    /// Minimum number of slots a single storage folder may hold.
    pub min_slots_per_folder: u64,
    /// Interval on which the background sync loop flushes state to disk.
    pub sync_interval: Duration,
}

impl Profile {
    /// Production profile: `max_folders = 2^16`, `max_slots_per_folder =
    /// 2^25`, `min_slots_per_folder = 2^12`.
    pub fn production() -> Self {
        Profile {
            max_folders: 1 << 16,
            max_slots_per_folder: 1 << 25,
            min_slots_per_folder: 1 << 12,
            sync_interval: Duration::from_millis(500),
        }
    }

    /// Dev profile: smaller folder counts/sizes for local iteration.
    pub fn dev() -> Self {
        Profile {
            max_folders: 1 << 5,
            max_slots_per_folder: 1 << 20,
            min_slots_per_folder: 1 << 3,
            sync_interval: Duration::from_millis(500),
        }
    }

    /// Testing profile: tiny bounds and a fast sync interval so tests
    /// don't spend real wall-clock time waiting on the background loop.
    pub fn testing() -> Self {
        Profile {
            max_folders: 1 << 3,
            max_slots_per_folder: 1 << 12,
            min_slots_per_folder: 1 << 3,
            sync_interval: Duration::from_millis(50),
        }
    }

    pub fn max_folder_bytes(&self, sector_size: u64) -> u64 {
        self.max_slots_per_folder * sector_size
    }

    pub fn min_folder_bytes(&self, sector_size: u64) -> u64 {
        self.min_slots_per_folder * sector_size
    }
}
