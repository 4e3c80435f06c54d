//! Directory scanning: classify store files, arbitrate locks, reclaim
//! stale ones, and resolve the next generation.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::ids::{AppId, ShardId};

use super::lockfile::verify_lockfile;
use super::{
    FileDesc, FileKind, MIN_VERIFIABLE_LOCK_BYTES, STALE_LOCK_AGE_SECS, StoreError,
    parse_file_name,
};

#[derive(Clone, Debug)]
pub struct DirectoryScan {
    /// Snapshots of this database, generation ascending.
    pub snapshots: Vec<FileDesc>,
    /// Non-empty shards, generation ascending.
    pub shards: Vec<FileDesc>,
    /// Valid lockfiles, mtime ascending (directory order on ties).
    pub locks: Vec<FileDesc>,
    /// One past the newest snapshot generation (1 when none exist).
    pub next_generation: u32,
    /// Earliest lock at `next_generation`, if any.
    pub next_generation_locked_by: Option<Uuid>,
}

impl DirectoryScan {
    pub fn snapshot_at(&self, generation: u32) -> Option<&FileDesc> {
        self.snapshots
            .iter()
            .find(|desc| desc.generation == generation)
    }

    /// Newest snapshot no compaction currently claims.
    pub fn latest_unlocked_snapshot(&self) -> Option<&FileDesc> {
        self.snapshots
            .iter()
            .rev()
            .find(|desc| desc.locked_by.is_none())
    }
}

/// Scan the store directory.
///
/// With `own_shards_only`, peer shards are dropped from the result and
/// leftover locks of this process are reclaimed (they can only be debris
/// from an earlier run). Stale locks are reclaimed either way. Concurrent
/// mutation is tolerated: entries that vanish mid-scan are skipped.
pub fn scan_directory(
    dir: &Path,
    app_id: AppId,
    shard_id: ShardId,
    own_shards_only: bool,
) -> Result<DirectoryScan, StoreError> {
    let now = SystemTime::now();
    let stale_age = Duration::from_secs(STALE_LOCK_AGE_SECS);

    let mut snapshots = Vec::new();
    let mut shards = Vec::new();
    let mut locks = Vec::new();
    let mut ignored = 0usize;
    let mut reclaimed = 0usize;

    let entries = fs::read_dir(dir).map_err(|source| StoreError::io(dir, source))?;
    for entry in entries {
        let Ok(entry) = entry else {
            ignored += 1;
            continue;
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            ignored += 1;
            continue;
        };
        let Some((uuid, generation, kind)) = parse_file_name(name) else {
            ignored += 1;
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let mtime = meta.modified().unwrap_or(now);
        let desc = FileDesc {
            name: name.to_string(),
            size: meta.len(),
            mtime,
            uuid,
            generation,
            kind,
            locked_by: None,
        };

        match kind {
            FileKind::Lock => {
                let own_leftover = own_shards_only && uuid == *shard_id.as_uuid();
                let stale = now
                    .duration_since(mtime)
                    .map(|age| age > stale_age)
                    .unwrap_or(false);
                if own_leftover || stale {
                    remove_quietly(dir, name);
                    reclaimed += 1;
                    continue;
                }
                if desc.size < MIN_VERIFIABLE_LOCK_BYTES {
                    // Possibly mid-write; give it the benefit of the doubt.
                    locks.push(desc);
                    continue;
                }
                if verify_lockfile(dir, name, app_id, &uuid, generation) {
                    locks.push(desc);
                } else {
                    remove_quietly(dir, name);
                    reclaimed += 1;
                }
            }
            FileKind::Snapshot => {
                if uuid == *app_id.as_uuid() {
                    snapshots.push(desc);
                }
            }
            FileKind::Shard => {
                if desc.size == 0 {
                    if uuid == *shard_id.as_uuid() {
                        remove_quietly(dir, name);
                    }
                    continue;
                }
                if !own_shards_only || uuid == *shard_id.as_uuid() {
                    shards.push(desc);
                }
            }
        }
    }

    locks.sort_by_key(|desc| desc.mtime);
    snapshots.sort_by_key(|desc| desc.generation);
    shards.sort_by_key(|desc| desc.generation);

    for snapshot in &mut snapshots {
        snapshot.locked_by = locks
            .iter()
            .find(|lock| lock.generation == snapshot.generation)
            .map(|lock| lock.uuid);
    }

    let next_generation = snapshots
        .last()
        .map(|desc| desc.generation.saturating_add(1))
        .unwrap_or(1);
    let next_generation_locked_by = locks
        .iter()
        .find(|lock| lock.generation == next_generation)
        .map(|lock| lock.uuid);

    tracing::debug!(
        snapshots = snapshots.len(),
        shards = shards.len(),
        locks = locks.len(),
        ignored,
        reclaimed,
        next_generation,
        "scanned store directory"
    );

    Ok(DirectoryScan {
        snapshots,
        shards,
        locks,
        next_generation,
        next_generation_locked_by,
    })
}

fn remove_quietly(dir: &Path, name: &str) {
    let path = dir.join(name);
    if let Err(err) = fs::remove_file(&path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %err, "could not remove store file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Datatype;
    use crate::store::lockfile::write_lockfile;
    use crate::store::shard::append_txn;
    use crate::store::snapshot::{Snapshot, write_snapshot};
    use crate::store::test_doc::{TestDoc, doc};
    use crate::store::{FileKind, file_name};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn app() -> AppId {
        AppId::new(Uuid::from_bytes([1u8; 16]))
    }

    fn own_shard() -> ShardId {
        ShardId::new(Uuid::from_bytes([2u8; 16]))
    }

    fn peer_shard() -> ShardId {
        ShardId::new(Uuid::from_bytes([3u8; 16]))
    }

    fn write_test_snapshot(dir: &Path, generation: u32) {
        write_snapshot(
            dir,
            app(),
            &Snapshot {
                generation,
                data: doc(0, &[]),
                ancestors: BTreeMap::new(),
            },
        )
        .unwrap();
    }

    fn append_test_txn(dir: &Path, shard: ShardId, generation: u32) {
        let patch = TestDoc::diff(&doc(0, &[]), &doc(1, &[])).unwrap();
        append_txn::<TestDoc>(dir, app(), shard, generation, 1, &patch).unwrap();
    }

    #[test]
    fn classifies_and_sorts_files() {
        let temp = TempDir::new().unwrap();
        write_test_snapshot(temp.path(), 2);
        write_test_snapshot(temp.path(), 1);
        append_test_txn(temp.path(), own_shard(), 2);
        append_test_txn(temp.path(), peer_shard(), 2);
        fs::write(temp.path().join("unrelated.txt"), b"ignore me").unwrap();

        let scan = scan_directory(temp.path(), app(), own_shard(), false).unwrap();
        assert_eq!(
            scan.snapshots.iter().map(|d| d.generation).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(scan.shards.len(), 2);
        assert_eq!(scan.next_generation, 3);
        assert!(scan.next_generation_locked_by.is_none());
    }

    #[test]
    fn own_shards_only_drops_peers() {
        let temp = TempDir::new().unwrap();
        append_test_txn(temp.path(), own_shard(), 0);
        append_test_txn(temp.path(), peer_shard(), 0);

        let scan = scan_directory(temp.path(), app(), own_shard(), true).unwrap();
        assert_eq!(scan.shards.len(), 1);
        assert_eq!(scan.shards[0].uuid, *own_shard().as_uuid());
    }

    #[test]
    fn empty_own_shard_is_deleted() {
        let temp = TempDir::new().unwrap();
        let own_name = file_name(own_shard().as_uuid(), 0, FileKind::Shard);
        let peer_name = file_name(peer_shard().as_uuid(), 0, FileKind::Shard);
        fs::write(temp.path().join(&own_name), b"").unwrap();
        fs::write(temp.path().join(&peer_name), b"").unwrap();

        let scan = scan_directory(temp.path(), app(), own_shard(), true).unwrap();
        assert!(scan.shards.is_empty());
        assert!(!temp.path().join(&own_name).exists());
        // Peers clean up their own files.
        assert!(temp.path().join(&peer_name).exists());
    }

    #[test]
    fn lock_arbitration_prefers_earliest_mtime() {
        let temp = TempDir::new().unwrap();
        write_test_snapshot(temp.path(), 1);
        write_lockfile(temp.path(), app(), peer_shard(), 2).unwrap();
        write_lockfile(temp.path(), app(), own_shard(), 2).unwrap();

        // Make the peer's lock clearly older.
        let peer_lock = temp
            .path()
            .join(file_name(peer_shard().as_uuid(), 2, FileKind::Lock));
        let file = fs::File::options().write(true).open(&peer_lock).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        drop(file);

        let scan = scan_directory(temp.path(), app(), own_shard(), false).unwrap();
        assert_eq!(scan.next_generation, 2);
        assert_eq!(scan.next_generation_locked_by, Some(*peer_shard().as_uuid()));
    }

    #[test]
    fn snapshot_locked_by_same_generation_lock() {
        let temp = TempDir::new().unwrap();
        write_test_snapshot(temp.path(), 1);
        write_test_snapshot(temp.path(), 2);
        write_lockfile(temp.path(), app(), peer_shard(), 2).unwrap();

        let scan = scan_directory(temp.path(), app(), own_shard(), false).unwrap();
        assert!(scan.snapshot_at(1).unwrap().locked_by.is_none());
        assert_eq!(
            scan.snapshot_at(2).unwrap().locked_by,
            Some(*peer_shard().as_uuid())
        );
        assert_eq!(
            scan.latest_unlocked_snapshot().unwrap().generation,
            1
        );
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        write_lockfile(temp.path(), app(), peer_shard(), 1).unwrap();
        let path = temp
            .path()
            .join(file_name(peer_shard().as_uuid(), 1, FileKind::Lock));
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(STALE_LOCK_AGE_SECS + 60))
            .unwrap();
        drop(file);

        let scan = scan_directory(temp.path(), app(), own_shard(), false).unwrap();
        assert!(scan.locks.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn own_leftover_lock_reclaimed_on_own_scan() {
        let temp = TempDir::new().unwrap();
        write_lockfile(temp.path(), app(), own_shard(), 1).unwrap();

        let scan = scan_directory(temp.path(), app(), own_shard(), false).unwrap();
        assert_eq!(scan.locks.len(), 1);

        let scan = scan_directory(temp.path(), app(), own_shard(), true).unwrap();
        assert!(scan.locks.is_empty());
    }

    #[test]
    fn garbage_lock_is_reclaimed_but_short_lock_kept() {
        let temp = TempDir::new().unwrap();
        let garbage = file_name(peer_shard().as_uuid(), 1, FileKind::Lock);
        fs::write(temp.path().join(&garbage), vec![0x5au8; 100]).unwrap();
        let short = file_name(own_shard().as_uuid(), 1, FileKind::Lock);
        fs::write(temp.path().join(&short), b"fish").unwrap();

        let scan = scan_directory(temp.path(), app(), peer_shard(), false).unwrap();
        assert_eq!(scan.locks.len(), 1);
        assert_eq!(scan.locks[0].uuid, *own_shard().as_uuid());
        assert!(!temp.path().join(&garbage).exists());
    }

    #[test]
    fn foreign_snapshots_ignored() {
        let temp = TempDir::new().unwrap();
        write_test_snapshot(temp.path(), 1);
        let foreign = file_name(&Uuid::from_bytes([9u8; 16]), 1, FileKind::Snapshot);
        fs::write(temp.path().join(&foreign), b"other database").unwrap();

        let scan = scan_directory(temp.path(), app(), own_shard(), false).unwrap();
        assert_eq!(scan.snapshots.len(), 1);
        assert_eq!(scan.snapshots[0].uuid, *app().as_uuid());
    }
}
