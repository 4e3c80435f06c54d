//! On-disk store: filename grammar, directory scanning, snapshot/shard/lock
//! file I/O.

use std::io;
use std::path::PathBuf;
use std::time::SystemTime;

use thiserror::Error;
use uuid::Uuid;

pub mod lockfile;
pub mod payload;
pub mod scan;
pub mod shard;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod test_doc;

/// Hard cap on snapshot and shard file sizes.
pub const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;

/// Lockfiles older than this are reclaimed as stale.
pub const STALE_LOCK_AGE_SECS: u64 = 2 * 60 * 60;

/// Lockfiles smaller than this may still be mid-write and are kept
/// unverified.
pub const MIN_VERIFIABLE_LOCK_BYTES: u64 = 48;

/// The three store file kinds, by filename suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Snapshot,
    Shard,
    Lock,
}

impl FileKind {
    pub fn suffix(self) -> &'static str {
        match self {
            FileKind::Snapshot => "sdsn",
            FileKind::Shard => "sdsh",
            FileKind::Lock => "sdlk",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sdsn" => Some(FileKind::Snapshot),
            "sdsh" => Some(FileKind::Shard),
            "sdlk" => Some(FileKind::Lock),
            _ => None,
        }
    }
}

/// A parsed directory entry.
///
/// `uuid` is the owning shard id for shards and locks, the app id for
/// snapshots. `locked_by` is resolved by the scanner for snapshots only.
#[derive(Clone, Debug)]
pub struct FileDesc {
    pub name: String,
    pub size: u64,
    pub mtime: SystemTime,
    pub uuid: Uuid,
    pub generation: u32,
    pub kind: FileKind,
    pub locked_by: Option<Uuid>,
}

/// Parse `<uuid>.<gen-hex8>.sd(sn|sh|lk)`, case-insensitively.
/// Anything else yields `None`.
pub fn parse_file_name(name: &str) -> Option<(Uuid, u32, FileKind)> {
    let lower = name.to_ascii_lowercase();
    let mut parts = lower.split('.');
    let uuid_part = parts.next()?;
    let gen_part = parts.next()?;
    let kind_part = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if uuid_part.len() != 36 || gen_part.len() != 8 {
        return None;
    }
    let uuid = Uuid::parse_str(uuid_part).ok()?;
    if !gen_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let generation = u32::from_str_radix(gen_part, 16).ok()?;
    let kind = FileKind::parse(kind_part)?;
    Some((uuid, generation, kind))
}

/// Format a store file name (lowercase, zero-padded generation).
pub fn file_name(uuid: &Uuid, generation: u32, kind: FileKind) -> String {
    format!("{}.{:08x}.{}", uuid, generation, kind.suffix())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is empty or contains no decodable block.
    #[error("no data in {path:?}")]
    NoData { path: PathBuf },

    #[error("invalid data in {path:?}: {reason}")]
    InvalidData { path: PathBuf, reason: String },

    #[error("{path:?} is {size} bytes, over the {MAX_FILE_BYTES} byte cap")]
    FileTooLarge { path: PathBuf, size: u64 },

    #[error("encoding failed: {reason}")]
    Encode { reason: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::InvalidData {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Write a file atomically: temp file in the same directory, fsync, rename,
/// fsync the directory.
pub(crate) fn write_file_atomic(
    dir: &std::path::Path,
    name: &str,
    bytes: &[u8],
) -> Result<(), StoreError> {
    use std::io::Write;

    let tmp_path = dir.join(format!("{name}.tmp"));
    let final_path = dir.join(name);

    let mut file = std::fs::File::create(&tmp_path)
        .map_err(|source| StoreError::io(&tmp_path, source))?;
    file.write_all(bytes)
        .map_err(|source| StoreError::io(&tmp_path, source))?;
    file.sync_all()
        .map_err(|source| StoreError::io(&tmp_path, source))?;
    drop(file);

    std::fs::rename(&tmp_path, &final_path)
        .map_err(|source| StoreError::io(&final_path, source))?;
    fsync_dir(dir)
}

pub(crate) fn fsync_dir(dir: &std::path::Path) -> Result<(), StoreError> {
    let handle = std::fs::File::open(dir).map_err(|source| StoreError::io(dir, source))?;
    handle
        .sync_all()
        .map_err(|source| StoreError::io(dir, source))
}
