//! Test-injection seam.
//!
//! The upstream source carries an open-ended table of named "disrupt"
//! points that test code can hook into production code paths. Here that
//! table is a trait: every injection point is a named method with a
//! production-sensible default, and production builds wire in
//! [`NoopHooks`]. Tests implement the trait directly to simulate crashes
//! at precise points (see `tests/end_to_end.rs`, scenario 5).

use std::fs;
use std::io;
use std::path::Path;

/// Named injection points into the sync loop and the sector write path.
pub trait TestHooks: Send + Sync {
    /// Called immediately before the settings temp file is renamed over
    /// the live settings file.
    fn before_settings_rename(&self) {}

    /// Performs the settings rename. The default does the real rename;
    /// a test can override this to silently drop the rename while still
    /// returning `Ok(())`, simulating a crash that occurs after the sync
    /// loop believes the rename succeeded.
    fn rename_settings(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    /// Called immediately before the WAL temp file is renamed over the
    /// live WAL file.
    fn before_wal_rename(&self) {}

    /// Performs the WAL rename. See [`TestHooks::rename_settings`].
    fn rename_wal(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    /// If `Some`, replaces the sector-file write at `(folder, slot)`
    /// entirely; used to inject write failures into a specific folder
    /// without touching real disk I/O.
    fn instead_of_sector_write(&self, _folder: u16, _slot: u64) -> Option<io::Result<()>> {
        None
    }

    /// If `Some`, replaces the sector-file read at `(folder, slot)`.
    fn instead_of_sector_read(&self, _folder: u16, _slot: u64) -> Option<io::Result<()>> {
        None
    }
}

/// Production default: every hook is a no-op / passes through to the real
/// filesystem operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl TestHooks for NoopHooks {}
