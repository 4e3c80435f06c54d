//! Compaction: merge every shard at the previous generation into a new
//! snapshot, guarded by an earliest-mtime-wins lockfile.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use thiserror::Error;

use crate::datatype::{Datatype, MergeError};
use crate::ids::ShardId;
use crate::store::lockfile::{delete_lockfile, write_lockfile};
use crate::store::scan::scan_directory;
use crate::store::shard::read_shard;
use crate::store::snapshot::{Snapshot, read_snapshot, write_snapshot};
use crate::store::{FileDesc, StoreError};

use super::DbContext;
use super::rebase;
use super::state::EngineState;

#[derive(Debug, Error)]
pub enum CompactionError {
    /// Another process already holds the next generation.
    #[error("next generation is already locked")]
    AlreadyLocked,

    /// We wrote a lockfile but lost the mtime race.
    #[error("lost the lock race for the next generation")]
    CouldNotLock,

    /// Nothing to merge at the previous generation.
    #[error("no shards target the base generation")]
    NoShards,

    #[error("could not write lockfile: {source}")]
    CouldNotWriteLockfile {
        #[source]
        source: StoreError,
    },

    /// The base snapshot vanished or became locked between scans.
    #[error("base snapshot lost or locked")]
    LastSnapshotLostOrLocked,

    /// The base snapshot exists but does not decode.
    #[error("base snapshot damaged")]
    LastSnapshotDamaged,

    #[error("could not write merged snapshot: {source}")]
    FailedToWriteSnapshot {
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    MergerFailed(#[from] MergeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CompactionError {
    /// Contention outcomes are expected in normal operation and logged at
    /// info level; everything else is a warning.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            CompactionError::AlreadyLocked
                | CompactionError::CouldNotLock
                | CompactionError::NoShards
        )
    }
}

/// Run one compaction attempt. On success the merged snapshot is
/// published, the lockfile removed, and the post-compaction hook fired;
/// when this process still sits on the base generation, local state is
/// rebased onto the new snapshot immediately.
pub(crate) fn compact<T: Datatype>(
    ctx: &Arc<DbContext<T>>,
    state: &mut EngineState<T>,
) -> Result<(), CompactionError> {
    let app_id = ctx.config.app_id;
    let shard_id = ctx.config.shard_id;

    // Precheck before touching the directory.
    let scan = scan_directory(&ctx.dir, app_id, shard_id, false)?;
    if scan.next_generation_locked_by.is_some() {
        return Err(CompactionError::AlreadyLocked);
    }
    let next_generation = scan.next_generation;
    if next_generation > 1 {
        match scan.snapshot_at(next_generation - 1) {
            Some(base) if base.locked_by.is_none() => {}
            _ => return Err(CompactionError::AlreadyLocked),
        }
    }

    write_lockfile(&ctx.dir, app_id, shard_id, next_generation)
        .map_err(|source| CompactionError::CouldNotWriteLockfile { source })?;

    // Rescan: the earliest lock at the generation wins.
    let scan = match scan_directory(&ctx.dir, app_id, shard_id, false) {
        Ok(scan) => scan,
        Err(err) => return Err(abort(ctx, next_generation, err.into())),
    };
    if scan.next_generation_locked_by != Some(*shard_id.as_uuid())
        || scan.next_generation != next_generation
    {
        return Err(abort(ctx, next_generation, CompactionError::CouldNotLock));
    }

    let base = match load_base(ctx, &scan, next_generation) {
        Ok(base) => base,
        Err(err) => return Err(abort(ctx, next_generation, err)),
    };

    let shards: Vec<&FileDesc> = scan
        .shards
        .iter()
        .filter(|desc| desc.size > 0 && desc.generation == next_generation - 1)
        .collect();
    if shards.is_empty() {
        return Err(abort(ctx, next_generation, CompactionError::NoShards));
    }

    let mut merged = base.data.clone();
    let mut ancestors: BTreeMap<ShardId, u32> = BTreeMap::new();
    let mut first = true;
    for desc in shards {
        let own = desc.uuid == *shard_id.as_uuid();
        let shard_view = match replay_shard(ctx, desc, &base, own) {
            Ok(Some(view)) => view,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(shard = %desc.name, error = %err, "skipping unreadable shard");
                continue;
            }
        };

        if first {
            merged = shard_view.data;
            first = false;
        } else {
            merged = match (ctx.merger)(&merged, &shard_view.data, &base.data) {
                Ok(merged) => merged,
                Err(err) => return Err(abort(ctx, next_generation, err.into())),
            };
        }
        ancestors.insert(ShardId::new(desc.uuid), shard_view.final_sequence);
    }
    if first {
        return Err(abort(ctx, next_generation, CompactionError::NoShards));
    }

    let snapshot = Snapshot {
        generation: next_generation,
        data: merged,
        ancestors,
    };
    if let Err(source) = write_snapshot(&ctx.dir, app_id, &snapshot) {
        return Err(abort(
            ctx,
            next_generation,
            CompactionError::FailedToWriteSnapshot { source },
        ));
    }

    delete_lockfile(&ctx.dir, shard_id, next_generation);
    tracing::info!(
        generation = next_generation,
        ancestors = snapshot.ancestors.len(),
        "published compacted snapshot"
    );

    fire_hook(ctx, &snapshot.data, &base.data);

    if state.generation == base.generation
        && let Err(err) = rebase::rebase_onto(ctx, state, &snapshot, Some(&base))
    {
        tracing::warn!(error = %err, "self-rebase after compaction failed");
    }

    Ok(())
}

struct ShardView<T: Datatype> {
    data: T,
    final_sequence: u32,
}

/// Replay one shard on top of the base value; `None` when the shard holds
/// no usable transactions.
fn replay_shard<T: Datatype>(
    ctx: &DbContext<T>,
    desc: &FileDesc,
    base: &Snapshot<T>,
    own: bool,
) -> Result<Option<ShardView<T>>, crate::Error> {
    let read = read_shard::<T>(&ctx.dir, desc, ctx.config.app_id, own)?;
    let Some(&(final_sequence, _)) = read.txns.last() else {
        return Ok(None);
    };
    let mut data = base.data.clone();
    for (_, patch) in &read.txns {
        data = T::apply(&data, patch)?;
    }
    Ok(Some(ShardView {
        data,
        final_sequence,
    }))
}

fn load_base<T: Datatype>(
    ctx: &DbContext<T>,
    scan: &crate::store::scan::DirectoryScan,
    next_generation: u32,
) -> Result<Snapshot<T>, CompactionError> {
    if next_generation == 1 {
        return Ok(Snapshot::initial(ctx.initial.clone()));
    }
    let Some(desc) = scan.snapshot_at(next_generation - 1) else {
        return Err(CompactionError::LastSnapshotLostOrLocked);
    };
    if desc.locked_by.is_some() {
        return Err(CompactionError::LastSnapshotLostOrLocked);
    }
    match read_snapshot::<T>(&ctx.dir, desc, ctx.config.app_id) {
        Ok(snapshot) => Ok(snapshot),
        Err(err) => {
            tracing::warn!(snapshot = %desc.name, error = %err, "unlinking damaged base snapshot");
            let path = ctx.dir.join(&desc.name);
            if let Err(err) = std::fs::remove_file(&path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                tracing::debug!(path = %path.display(), error = %err, "could not unlink snapshot");
            }
            Err(CompactionError::LastSnapshotDamaged)
        }
    }
}

fn abort<T: Datatype>(
    ctx: &DbContext<T>,
    generation: u32,
    err: CompactionError,
) -> CompactionError {
    delete_lockfile(&ctx.dir, ctx.config.shard_id, generation);
    err
}

fn fire_hook<T: Datatype>(ctx: &Arc<DbContext<T>>, merged: &T, base: &T) {
    if ctx.hook.is_none() {
        return;
    }
    let ctx = Arc::clone(ctx);
    let merged = merged.clone();
    let base = base.clone();
    // Fire and forget; a panicking hook only takes its own thread down.
    let spawned = thread::Builder::new()
        .name("fishtrap-hook".into())
        .spawn(move || {
            if let Some(hook) = ctx.hook.as_ref() {
                hook(&merged, &base);
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "could not spawn post-compaction hook thread");
    }
}
