//! Sector ids and the process-wide sector salt.
//!
//! A sector id is the first 12 bytes of a keyed hash of the sector's
//! Merkle root, keyed by a salt generated once at first init and
//! persisted afterward. Salting means an adversary who can choose Merkle
//! roots still can't steer sectors into a specific folder or slot: both
//! the id and the in-folder slot hint are derived from a key they don't
//! have.

use rand::RngCore;

use crate::consts::SECTOR_ID_LEN;

pub type SectorId = [u8; SECTOR_ID_LEN];

#[derive(Clone)]
pub struct SectorSalt([u8; 32]);

impl SectorSalt {
    /// Generates a fresh salt. Called exactly once, at first init of a
    /// persist directory; every later open loads the persisted salt via
    /// [`SectorSalt::from_bytes`] instead.
    pub fn generate() -> Self {
        let mut buf = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut buf);
        SectorSalt(buf)
    }

    pub fn from_bytes(b: [u8; 32]) -> Self {
        SectorSalt(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `id = blake3::keyed_hash(salt, merkle_root)[0..12]`.
    pub fn sector_id(&self, merkle_root: &[u8; 32]) -> SectorId {
        let hash = blake3::keyed_hash(&self.0, merkle_root);
        let mut id = [0u8; SECTOR_ID_LEN];
        id.copy_from_slice(&hash.as_bytes()[..SECTOR_ID_LEN]);
        id
    }

    /// `slot_hint = hash(id, folder_index, salt) mod capacity`, aligned to
    /// a word boundary so [`crate::bitfield::Bitfield::find_free_near`]
    /// can start its scan at a word it actually owns.
    pub fn slot_hint(&self, id: &SectorId, folder_index: u16, capacity_slots: u64) -> u64 {
        if capacity_slots == 0 {
            return 0;
        }
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(id);
        hasher.update(&folder_index.to_le_bytes());
        let digest = hasher.finalize();
        let raw = u64::from_le_bytes(digest.as_bytes()[0..8].try_into().unwrap());
        let nwords = (capacity_slots / 64).max(1);
        (raw % nwords) * 64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_id_is_deterministic_per_salt() {
        let salt = SectorSalt::from_bytes([7u8; 32]);
        let root = [1u8; 32];
        assert_eq!(salt.sector_id(&root), salt.sector_id(&root));
    }

    #[test]
    fn different_salts_give_different_ids() {
        let a = SectorSalt::from_bytes([1u8; 32]);
        let b = SectorSalt::from_bytes([2u8; 32]);
        let root = [3u8; 32];
        assert_ne!(a.sector_id(&root), b.sector_id(&root));
    }

    #[test]
    fn slot_hint_is_word_aligned() {
        let salt = SectorSalt::generate();
        let id = [9u8; SECTOR_ID_LEN];
        let hint = salt.slot_hint(&id, 3, 1 << 20);
        assert_eq!(hint % 64, 0);
    }
}
