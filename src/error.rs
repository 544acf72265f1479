//! Error taxonomy: validation, capacity, transient I/O,
//! and fatal errors each get their own shape so callers can match on the
//! kind of failure instead of parsing messages. Fatal conditions are
//! logged and escalate to a process abort at the call site; they are not
//! represented as an `Ok`/`Err` the caller can recover from.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::wal::WalError;

/// Errors returned by the public Contract Manager API.
#[derive(Debug, Error)]
pub enum ContractManagerError {
    #[error("sector not found")]
    SectorNotFound,

    #[error("storage folder {0} not found")]
    FolderNotFound(u16),

    #[error("storage folder capacity exhausted")]
    CapacityExhausted,

    #[error("insufficient capacity elsewhere to evacuate storage folder {0}")]
    InsufficientCapacity(u16),

    #[error("storage folder size {slots} slots exceeds the maximum of {max} slots")]
    TooLarge { slots: u64, max: u64 },

    #[error("storage folder size {slots} slots is below the minimum of {min} slots")]
    TooSmall { slots: u64, min: u64 },

    #[error("storage folder size {slots} slots is not a multiple of the {granularity}-slot granularity")]
    BadGranularity { slots: u64, granularity: u64 },

    #[error("storage folder size {size_bytes} bytes is not a whole multiple of the {sector_size}-byte sector size")]
    BadSectorAlignment { size_bytes: u64, sector_size: u64 },

    #[error("storage folder path {0:?} is not absolute")]
    NotAbsolutePath(PathBuf),

    #[error("storage folder path {0:?} is not a directory")]
    NotADirectory(PathBuf),

    #[error("storage folder path {0:?} is already in use")]
    DuplicatePath(PathBuf),

    #[error("maximum number of storage folders ({0}) reached")]
    MaxFolders(u32),

    #[error("every candidate storage folder failed: {0}")]
    AllFoldersFailed(String),

    #[error("I/O error during {context}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error("contract manager is shutting down")]
    ShuttingDown,
}

impl ContractManagerError {
    pub fn io(context: &'static str, source: io::Error) -> Self {
        ContractManagerError::Io { context, source }
    }
}

/// Conditions under which ACID can no longer be guaranteed: the caller is
/// never given the chance to recover from these. The engine logs a
/// `tracing::error!` event describing the failure and then aborts the
/// process. See §7 "Fatal".
pub fn fatal(context: &'static str, err: &dyn std::error::Error) -> ! {
    tracing::error!(context, error = %err, "fatal durability failure, aborting process");
    std::process::abort();
}
