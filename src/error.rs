use thiserror::Error;

use crate::datatype::{MergeError, PatchError};
use crate::db::compact::CompactionError;
use crate::store::StoreError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-subsystem errors; database lifecycle kinds
/// live here because they have no single owning subsystem.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The database was closed; all subsequent calls are rejected until
    /// `open` is called again.
    #[error("database is closed")]
    Closed,

    /// The u32 transaction sequence space for this generation ran out.
    #[error("transaction sequence space exhausted at generation {generation}")]
    SequenceExhausted { generation: u32 },

    /// The user updater panicked; local state is unchanged and the
    /// operation queue keeps running.
    #[error("updater panicked; state unchanged")]
    UpdaterPanicked,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Compaction(#[from] CompactionError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Patch(#[from] PatchError),
}
