//! Contract Manager: a crash-safe, concurrent, local storage engine for
//! fixed-size sectors spread across one or more on-disk storage folders.
//!
//! The engine is the durability core behind a storage host: it does not
//! negotiate contracts, talk to the network, or compute storage proofs.
//! It knows only about sectors (fixed-size byte blocks, addressed by a
//! salted hash of their Merkle root) and storage folders (pre-allocated
//! files holding a fixed number of sector-sized slots).
//!
//! All state-changing operations are staged through a write-ahead log
//! (see [`wal`]) and are only reported to the caller as successful once
//! a sync barrier has made them durable.

extern crate io_at;

pub mod bitfield;
pub mod consts;
pub mod error;
pub mod folder;
pub mod hooks;
pub mod index;
pub mod manager;
pub mod ops;
pub mod salt;
pub mod settings;
pub mod threadgroup;
pub mod wal;

pub use consts::Profile;
pub use error::ContractManagerError;
pub use manager::{ContractManager, StorageFolderMetadata};
pub use salt::SectorId;

#[cfg(test)]
mod tests {
    #[test]
    fn it_works() {}
}
