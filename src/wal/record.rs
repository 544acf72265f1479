//! WAL record types and their on-disk framing.
//!
//! Frame layout: `{ length: i64-LE, checksum: u32-LE (crc32c) }` followed
//! by `length` bytes of a `bincode`-encoded [`StateChange`]. A frame
//! whose checksum doesn't match, whose `revision` doesn't match the WAL
//! file's header, or whose length exceeds [`WAL_MAX_RECORD_LEN`] is
//! treated as the first byte of tail corruption: recovery stops there
//! rather than trying to interpret it.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::consts::WAL_MAX_RECORD_LEN;
use crate::salt::SectorId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectorUpdate {
    pub id: SectorId,
    pub folder: u16,
    pub slot: u64,
    pub refcount: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderAddition {
    pub index: u16,
    pub path: PathBuf,
    pub usage: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderResize {
    pub index: u16,
    pub new_slots: u64,
    /// Usage snapshot *after* the resize, so replaying this record is a
    /// plain overwrite rather than a delta that depends on prior state.
    pub usage: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRemoval {
    pub index: u16,
    pub path: PathBuf,
}

/// One idempotent batch of state changes. Every list defaults to empty;
/// a `StateChange` produced by a single operation usually populates just
/// one of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateChange {
    pub revision: u64,

    pub sector_updates: Vec<SectorUpdate>,

    pub storage_folder_additions: Vec<FolderAddition>,
    pub unfinished_storage_folder_additions: Vec<FolderAddition>,
    pub errored_storage_folder_additions: Vec<u16>,

    pub storage_folder_extensions: Vec<FolderResize>,
    pub unfinished_storage_folder_extensions: Vec<FolderResize>,
    pub errored_storage_folder_extensions: Vec<u16>,

    pub storage_folder_reductions: Vec<FolderResize>,
    pub unfinished_storage_folder_reductions: Vec<FolderResize>,
    pub errored_storage_folder_reductions: Vec<u16>,

    pub storage_folder_removals: Vec<FolderRemoval>,
}

impl StateChange {
    pub fn is_empty(&self) -> bool {
        self.sector_updates.is_empty()
            && self.storage_folder_additions.is_empty()
            && self.unfinished_storage_folder_additions.is_empty()
            && self.errored_storage_folder_additions.is_empty()
            && self.storage_folder_extensions.is_empty()
            && self.unfinished_storage_folder_extensions.is_empty()
            && self.errored_storage_folder_extensions.is_empty()
            && self.storage_folder_reductions.is_empty()
            && self.unfinished_storage_folder_reductions.is_empty()
            && self.errored_storage_folder_reductions.is_empty()
            && self.storage_folder_removals.is_empty()
    }

    pub fn with_revision(revision: u64) -> Self {
        StateChange { revision, ..Default::default() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("encoding error")]
    Encode(#[from] bincode::Error),
}

pub fn write_frame<W: Write>(w: &mut W, change: &StateChange) -> Result<u64, FrameError> {
    let payload = bincode::serialize(change)?;
    let checksum = crc32c::crc32c(&payload);
    w.write_i64::<LittleEndian>(payload.len() as i64)?;
    w.write_u32::<LittleEndian>(checksum)?;
    w.write_all(&payload)?;
    Ok(12 + payload.len() as u64)
}

/// Reads one frame. `Ok(None)` means "treat this as end-of-log": clean
/// EOF, a truncated frame, a bad checksum, an out-of-range length, or a
/// revision mismatch all collapse to the same outcome, since all of them
/// mean the bytes from here on can't be trusted.
pub fn read_frame<R: Read>(r: &mut R, expected_revision: u64) -> Result<Option<StateChange>, FrameError> {
    let length = match r.read_i64::<LittleEndian>() {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if length < 0 || length as u64 > WAL_MAX_RECORD_LEN {
        return Ok(None);
    }
    let checksum = match r.read_u32::<LittleEndian>() {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let mut payload = vec![0u8; length as usize];
    if r.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    if crc32c::crc32c(&payload) != checksum {
        return Ok(None);
    }
    let change: StateChange = match bincode::deserialize(&payload) {
        Ok(c) => c,
        Err(_) => return Ok(None),
    };
    if change.revision != expected_revision {
        return Ok(None);
    }
    Ok(Some(change))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip() {
        let mut change = StateChange::with_revision(3);
        change.sector_updates.push(SectorUpdate { id: [1u8; 12], folder: 0, slot: 5, refcount: 1 });
        let mut buf = Vec::new();
        write_frame(&mut buf, &change).unwrap();
        let mut cursor = Cursor::new(buf);
        let read_back = read_frame(&mut cursor, 3).unwrap().unwrap();
        assert_eq!(read_back.sector_updates.len(), 1);
        assert_eq!(read_back.sector_updates[0].slot, 5);
    }

    #[test]
    fn checksum_mismatch_is_end_of_log() {
        let change = StateChange::with_revision(1);
        let mut buf = Vec::new();
        write_frame(&mut buf, &change).unwrap();
        // flip a payload byte
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor, 1).unwrap().is_none());
    }

    #[test]
    fn revision_mismatch_is_end_of_log() {
        let change = StateChange::with_revision(1);
        let mut buf = Vec::new();
        write_frame(&mut buf, &change).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor, 2).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_end_of_log() {
        let change = StateChange::with_revision(1);
        let mut buf = Vec::new();
        write_frame(&mut buf, &change).unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor, 1).unwrap().is_none());
    }

    #[test]
    fn oversized_length_is_end_of_log() {
        let mut buf = Vec::new();
        buf.write_i64::<LittleEndian>((WAL_MAX_RECORD_LEN + 1) as i64).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor, 0).unwrap().is_none());
    }
}
