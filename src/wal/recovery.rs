//! Low-level WAL replay: turns `contractmanager.wal` into the ordered
//! list of [`StateChange`]s it durably contains. Higher-level recovery
//! (rebuilding the sector index and folder table, resolving unfinished
//! operations) lives in [`crate::manager`], since it needs access to the
//! folders' actual files, not just the log bytes.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use super::header::{read_header_and_metadata, WalHeader, WalMetadata};
use super::record::{read_frame, StateChange};

pub struct WalContents {
    pub header: WalHeader,
    pub metadata: WalMetadata,
    pub changes: Vec<StateChange>,
}

/// Reads `path` if it exists. The absence of the WAL file at startup
/// implies a clean prior shutdown (the last sync loop iteration renamed
/// its temp file away and no further writes happened), so `Ok(None)` is
/// the common, unremarkable case on a clean boot.
pub fn read_wal_file(path: &Path) -> io::Result<Option<WalContents>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let (header, metadata, _offset) = read_header_and_metadata(&mut reader)?;

    let mut changes = Vec::new();
    loop {
        match read_frame(&mut reader, header.revision) {
            Ok(Some(change)) => changes.push(change),
            Ok(None) => break,
            Err(_) => break,
        }
    }
    Ok(Some(WalContents { header, metadata, changes }))
}
