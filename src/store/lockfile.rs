//! Lockfiles: short single-block files asserting intent to compact a
//! generation. Arbitration is earliest-mtime-wins; deletion is always
//! best-effort.

use std::fs;
use std::io::Read;
use std::path::Path;

use uuid::Uuid;

use crate::codec::block;
use crate::ids::{AppId, ShardId};

use super::payload::{self, LockPayload};
use super::{FileKind, StoreError, file_name};

pub fn write_lockfile(
    dir: &Path,
    app_id: AppId,
    shard_id: ShardId,
    generation: u32,
) -> Result<(), StoreError> {
    let bytes = payload::encode_lock(&LockPayload {
        app_id,
        shard_id,
        generation,
    })?;
    let block = block::write_block(&bytes).map_err(|err| StoreError::Encode {
        reason: err.to_string(),
    })?;
    let path = dir.join(file_name(shard_id.as_uuid(), generation, FileKind::Lock));
    fs::write(&path, &block).map_err(|source| StoreError::io(&path, source))
}

/// Best-effort removal; failures are logged and swallowed.
pub fn delete_lockfile(dir: &Path, shard_id: ShardId, generation: u32) {
    let path = dir.join(file_name(shard_id.as_uuid(), generation, FileKind::Lock));
    if let Err(err) = fs::remove_file(&path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %err, "could not delete lockfile");
    }
}

/// Check a lockfile's contents against its filename: the first block must
/// decode to a `lck` payload whose fields agree with `uuid`/`generation`.
/// At most the first KiB is read.
pub fn verify_lockfile(
    dir: &Path,
    name: &str,
    app_id: AppId,
    uuid: &Uuid,
    generation: u32,
) -> bool {
    let path = dir.join(name);
    let mut buf = Vec::with_capacity(1024);
    let readable = fs::File::open(&path)
        .and_then(|file| file.take(1024).read_to_end(&mut buf))
        .is_ok();
    if !readable {
        return false;
    }

    let scanned = block::scan_block(&buf, 0);
    let Some(bytes) = scanned.payload else {
        return false;
    };
    let Ok(lock) = payload::decode_lock_envelope(&bytes) else {
        return false;
    };
    lock.app_id == app_id && lock.shard_id.as_uuid() == uuid && lock.generation == generation
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn app() -> AppId {
        AppId::new(Uuid::from_bytes([1u8; 16]))
    }

    fn shard() -> ShardId {
        ShardId::new(Uuid::from_bytes([2u8; 16]))
    }

    #[test]
    fn lockfile_roundtrip_verifies() {
        let temp = TempDir::new().unwrap();
        write_lockfile(temp.path(), app(), shard(), 4).unwrap();

        let name = file_name(shard().as_uuid(), 4, FileKind::Lock);
        assert!(verify_lockfile(temp.path(), &name, app(), shard().as_uuid(), 4));
        // Filename disagreement fails verification.
        assert!(!verify_lockfile(temp.path(), &name, app(), shard().as_uuid(), 5));
        let other = Uuid::from_bytes([9u8; 16]);
        assert!(!verify_lockfile(temp.path(), &name, app(), &other, 4));
    }

    #[test]
    fn garbage_lockfile_fails_verification() {
        let temp = TempDir::new().unwrap();
        let name = file_name(shard().as_uuid(), 1, FileKind::Lock);
        fs::write(temp.path().join(&name), vec![0xabu8; 200]).unwrap();
        assert!(!verify_lockfile(temp.path(), &name, app(), shard().as_uuid(), 1));
    }

    #[test]
    fn delete_is_silent_when_missing() {
        let temp = TempDir::new().unwrap();
        delete_lockfile(temp.path(), shard(), 7);
    }
}
