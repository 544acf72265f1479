//! `contractmanager.json`: the atomically-renamed settings snapshot
//! holding the sector salt and the current folder list.
//!
//! File shape: two plain-text header lines (`header_string`,
//! `version_string`) followed by a `serde_json` blob. Always written via
//! rename-over from `contractmanager.json_temp` so a reader never
//! observes a partially-written file.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bitfield::Bitfield;
use crate::consts::{SETTINGS_FILE_NAME, SETTINGS_HEADER_STRING, SETTINGS_TEMP_FILE_NAME, SETTINGS_VERSION_STRING};
use crate::hooks::TestHooks;
use crate::salt::SectorSalt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedFolder {
    pub index: u16,
    pub path: std::path::PathBuf,
    pub usage: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub sector_salt: String,
    pub storage_folders: Vec<PersistedFolder>,
}

impl Settings {
    pub fn sector_salt(&self) -> io::Result<SectorSalt> {
        let bytes = hex::decode(&self.sector_salt)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if bytes.len() != 32 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "sector salt is not 32 bytes"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(SectorSalt::from_bytes(arr))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("settings decode error")]
    Decode(#[from] serde_json::Error),
    #[error("settings header mismatch")]
    HeaderMismatch,
    #[error("settings version mismatch: found {0:?}")]
    VersionMismatch(String),
}

pub fn build_snapshot(salt: &SectorSalt, folders: &[(u16, std::path::PathBuf, Bitfield)]) -> Settings {
    Settings {
        sector_salt: hex::encode(salt.as_bytes()),
        storage_folders: folders
            .iter()
            .map(|(index, path, usage)| PersistedFolder {
                index: *index,
                path: path.clone(),
                usage: usage.words().to_vec(),
            })
            .collect(),
    }
}

pub fn save(dir: &Path, settings: &Settings, hooks: &dyn TestHooks) -> io::Result<()> {
    let temp_path = dir.join(SETTINGS_TEMP_FILE_NAME);
    let live_path = dir.join(SETTINGS_FILE_NAME);
    {
        let mut f = File::create(&temp_path)?;
        writeln!(f, "{}", SETTINGS_HEADER_STRING)?;
        writeln!(f, "{}", SETTINGS_VERSION_STRING)?;
        serde_json::to_writer(&mut f, settings)?;
        hooks.before_settings_rename();
        f.sync_all()?;
    }
    hooks.rename_settings(&temp_path, &live_path)
}

pub fn load(dir: &Path) -> Result<Option<Settings>, SettingsError> {
    let live_path = dir.join(SETTINGS_FILE_NAME);
    if !live_path.exists() {
        return Ok(None);
    }
    let f = File::open(&live_path)?;
    let mut reader = BufReader::new(f);
    let mut header_line = String::new();
    reader.read_line(&mut header_line)?;
    if header_line.trim_end() != SETTINGS_HEADER_STRING {
        return Err(SettingsError::HeaderMismatch);
    }
    let mut version_line = String::new();
    reader.read_line(&mut version_line)?;
    if version_line.trim_end() != SETTINGS_VERSION_STRING {
        return Err(SettingsError::VersionMismatch(version_line.trim_end().to_string()));
    }
    let settings: Settings = serde_json::from_reader(reader)?;
    Ok(Some(settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoopHooks;

    #[test]
    fn roundtrip_empty_folders() {
        let dir = tempfile::tempdir().unwrap();
        let salt = SectorSalt::generate();
        let settings = build_snapshot(&salt, &[]);
        save(dir.path(), &settings, &NoopHooks).unwrap();
        let loaded = load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.sector_salt, settings.sector_salt);
        assert!(loaded.storage_folders.is_empty());
        assert_eq!(loaded.sector_salt().unwrap().as_bytes(), salt.as_bytes());
    }

    #[test]
    fn roundtrip_with_folders_and_nontrivial_usage() {
        let dir = tempfile::tempdir().unwrap();
        let salt = SectorSalt::generate();
        let mut bf = Bitfield::with_capacity_slots(128);
        bf.set(3);
        bf.set(70);
        let settings = build_snapshot(&salt, &[(0, dir.path().join("a"), bf.clone())]);
        save(dir.path(), &settings, &NoopHooks).unwrap();
        let loaded = load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.storage_folders.len(), 1);
        assert_eq!(loaded.storage_folders[0].usage, bf.words());
    }

    #[test]
    fn missing_file_is_first_init() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }
}
