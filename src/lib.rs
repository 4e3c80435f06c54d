#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod datatype;
pub mod db;
pub mod error;
pub mod ids;
pub mod store;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Implementors of `Datatype` write against these encoder/decoder types.
pub use minicbor;

// Re-export the public surface at the crate root for convenience.
pub use crate::config::Config;
pub use crate::datatype::{Datatype, MergeError, Merger, PatchError, PostCompactionHook};
pub use crate::db::Database;
pub use crate::ids::{AppId, ShardId};
pub use crate::store::snapshot::Snapshot;
