//! Per-folder usage bitfield: one bit per slot, packed 64 to a word.
//!
//! Bit `k` of word `w` means "slot `64*w + k` is occupied". A folder's
//! capacity is always `words.len() * 64`; growing or shrinking a folder
//! appends or truncates whole words, never partial ones.

use serde::{Deserialize, Serialize};

use crate::consts::FOLDER_GRANULARITY;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitfield {
    words: Vec<u64>,
}

impl Bitfield {
    pub fn new() -> Self {
        Bitfield { words: Vec::new() }
    }

    /// `slots` must be a multiple of [`FOLDER_GRANULARITY`]; callers
    /// validate this before constructing a folder (see `ops::folder_ops`).
    pub fn with_capacity_slots(slots: u64) -> Self {
        debug_assert_eq!(slots % FOLDER_GRANULARITY, 0);
        Bitfield {
            words: vec![0u64; (slots / FOLDER_GRANULARITY) as usize],
        }
    }

    pub fn from_words(words: Vec<u64>) -> Self {
        Bitfield { words }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn capacity_slots(&self) -> u64 {
        self.words.len() as u64 * FOLDER_GRANULARITY
    }

    pub fn is_set(&self, slot: u64) -> bool {
        let (w, b) = Self::split(slot);
        self.words[w] & (1 << b) != 0
    }

    pub fn set(&mut self, slot: u64) {
        let (w, b) = Self::split(slot);
        self.words[w] |= 1 << b;
    }

    pub fn clear(&mut self, slot: u64) {
        let (w, b) = Self::split(slot);
        self.words[w] &= !(1 << b);
    }

    pub fn count_set(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    pub fn count_free(&self) -> u64 {
        self.capacity_slots() - self.count_set()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            (0..64u64).filter(move |&b| word & (1 << b) != 0).map(move |b| w as u64 * FOLDER_GRANULARITY + b)
        })
    }

    /// Iterates only the set bits at or beyond `from_slot` (inclusive),
    /// used by shrink/remove to evacuate the tail of a folder.
    pub fn iter_set_from(&self, from_slot: u64) -> impl Iterator<Item = u64> + '_ {
        self.iter_set().filter(move |&s| s >= from_slot)
    }

    /// Scans from the word containing `hint` forward, wrapping around,
    /// returning the first free slot found. `hint` need not be word
    /// aligned; only the word it falls in matters for the starting point.
    pub fn find_free_near(&self, hint: u64) -> Option<u64> {
        let nwords = self.words.len() as u64;
        if nwords == 0 {
            return None;
        }
        let start = (hint / FOLDER_GRANULARITY) % nwords;
        for i in 0..nwords {
            let w = ((start + i) % nwords) as usize;
            let word = self.words[w];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as u64;
                return Some(w as u64 * FOLDER_GRANULARITY + bit);
            }
        }
        None
    }

    /// Appends `extra_slots` (a multiple of [`FOLDER_GRANULARITY`]) worth
    /// of zeroed words.
    pub fn grow(&mut self, extra_slots: u64) {
        debug_assert_eq!(extra_slots % FOLDER_GRANULARITY, 0);
        self.words.resize(self.words.len() + (extra_slots / FOLDER_GRANULARITY) as usize, 0);
    }

    /// Truncates to `new_slots` (a multiple of [`FOLDER_GRANULARITY`]).
    /// Callers must ensure every bit beyond `new_slots` is already clear.
    pub fn shrink(&mut self, new_slots: u64) {
        debug_assert_eq!(new_slots % FOLDER_GRANULARITY, 0);
        self.words.truncate((new_slots / FOLDER_GRANULARITY) as usize);
    }

    fn split(slot: u64) -> (usize, u32) {
        ((slot / FOLDER_GRANULARITY) as usize, (slot % FOLDER_GRANULARITY) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_roundtrip() {
        let mut b = Bitfield::with_capacity_slots(128);
        assert_eq!(b.count_free(), 128);
        b.set(5);
        b.set(70);
        assert!(b.is_set(5));
        assert!(b.is_set(70));
        assert_eq!(b.count_set(), 2);
        b.clear(5);
        assert!(!b.is_set(5));
        assert_eq!(b.count_set(), 1);
    }

    #[test]
    fn find_free_near_wraps() {
        let mut b = Bitfield::with_capacity_slots(128);
        for s in 0..128 {
            b.set(s);
        }
        assert_eq!(b.find_free_near(0), None);
        b.clear(70);
        assert_eq!(b.find_free_near(0), Some(70));
        assert_eq!(b.find_free_near(64), Some(70));
    }

    #[test]
    fn iter_set_from_filters_tail() {
        let mut b = Bitfield::with_capacity_slots(128);
        b.set(10);
        b.set(90);
        let tail: Vec<u64> = b.iter_set_from(64).collect();
        assert_eq!(tail, vec![90]);
    }

    #[test]
    fn grow_and_shrink() {
        let mut b = Bitfield::with_capacity_slots(64);
        b.grow(64);
        assert_eq!(b.capacity_slots(), 128);
        b.set(100);
        b.clear(100);
        b.shrink(64);
        assert_eq!(b.capacity_slots(), 64);
    }
}
