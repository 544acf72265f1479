//! Operation implementations layered over [`crate::wal::Wal`].
//!
//! `crate::manager::ContractManager` is a thin, lock-free dispatch shell:
//! every operation that actually touches the WAL lock or a folder lock
//! lives here, one function per public operation, so the locking
//! discipline in each is visible in one place per operation instead of
//! smeared across a big `impl`.

pub mod folder_ops;
pub mod sector_ops;
