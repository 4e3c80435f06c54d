//! Rebase: migrating local state onto a newer snapshot, and the open
//! procedure that bootstraps state from disk.

use std::sync::Arc;

use crate::datatype::Datatype;
use crate::error::Error;
use crate::store::scan::{DirectoryScan, scan_directory};
use crate::store::shard::{self, read_shard};
use crate::store::FileDesc;
use crate::store::snapshot::{Snapshot, read_snapshot};

use super::DbContext;
use super::state::EngineState;

/// Bootstrap engine state from the store directory.
///
/// Loads the newest unlocked, undamaged snapshot (falling back to the
/// implicit initial snapshot), replays this process's shard on top of it,
/// and rebases immediately when the shard targets an older generation.
/// Shards whose base snapshot is gone are quarantined.
pub(crate) fn open_state<T: Datatype>(ctx: &Arc<DbContext<T>>) -> Result<EngineState<T>, Error> {
    let app_id = ctx.config.app_id;
    let shard_id = ctx.config.shard_id;
    let scan = scan_directory(&ctx.dir, app_id, shard_id, true)?;

    let mut last: Option<Snapshot<T>> = None;
    for desc in scan.snapshots.iter().rev() {
        if desc.locked_by.is_some() {
            continue;
        }
        match read_snapshot::<T>(&ctx.dir, desc, app_id) {
            Ok(snapshot) => {
                last = Some(snapshot);
                break;
            }
            Err(err) => {
                tracing::warn!(snapshot = %desc.name, error = %err, "skipping damaged snapshot");
            }
        }
    }
    let last = last.unwrap_or_else(|| Snapshot::initial(ctx.initial.clone()));

    // Older own shards are debris from interrupted rebases; anything they
    // held is already merged into a newer snapshot or a newer shard.
    if scan.shards.len() > 1 {
        for desc in &scan.shards[..scan.shards.len() - 1] {
            tracing::debug!(shard = %desc.name, "removing superseded own shard");
            shard::delete_shard(&ctx.dir, shard_id, desc.generation);
        }
    }

    let Some(own) = scan.shards.last() else {
        return Ok(adopted_state(&last, ctx));
    };

    if own.generation == last.generation {
        return match replay_own_shard(ctx, own, &last) {
            Ok(state) => Ok(state),
            Err(err) => {
                tracing::warn!(shard = %own.name, error = %err, "could not replay own shard");
                quarantine(ctx, own);
                Ok(adopted_state(&last, ctx))
            }
        };
    }

    if own.generation > last.generation {
        // The snapshot this shard targets is gone.
        quarantine(ctx, own);
        return Ok(adopted_state(&last, ctx));
    }

    // The shard targets an older generation: replay it against its own
    // base snapshot, then rebase onto the newest one.
    let base = load_base_snapshot(ctx, &scan, own.generation);
    let Some(base) = base else {
        quarantine(ctx, own);
        return Ok(adopted_state(&last, ctx));
    };
    let mut state = match replay_own_shard(ctx, own, &base) {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!(shard = %own.name, error = %err, "could not replay own shard");
            quarantine(ctx, own);
            return Ok(adopted_state(&last, ctx));
        }
    };
    rebase_onto(ctx, &mut state, &last, Some(&base))?;
    Ok(state)
}

/// Look for a newer unlocked snapshot and rebase onto it. Returns whether
/// a rebase happened; broken snapshots are logged and skipped until the
/// next check.
pub(crate) fn check_rebase<T: Datatype>(
    ctx: &Arc<DbContext<T>>,
    state: &mut EngineState<T>,
) -> Result<bool, Error> {
    let scan = scan_directory(&ctx.dir, ctx.config.app_id, ctx.config.shard_id, false)?;
    let Some(desc) = scan.latest_unlocked_snapshot() else {
        return Ok(false);
    };
    if desc.generation <= state.generation {
        return Ok(false);
    }
    let new_snapshot = match read_snapshot::<T>(&ctx.dir, desc, ctx.config.app_id) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!(snapshot = %desc.name, error = %err, "newer snapshot is unreadable; staying put");
            return Ok(false);
        }
    };
    rebase_onto(ctx, state, &new_snapshot, None)
}

/// Migrate `state` onto `new_snapshot`.
///
/// Fast path: the snapshot's ancestor entry proves all local transactions
/// are subsumed (or there are none), so its value is adopted verbatim.
/// Slow path: three-way merge against the common-ancestor snapshot at the
/// old generation; a nonempty merge delta becomes the first transaction of
/// the new generation. Without a usable common ancestor the rebase is
/// abandoned.
pub(crate) fn rebase_onto<T: Datatype>(
    ctx: &Arc<DbContext<T>>,
    state: &mut EngineState<T>,
    new_snapshot: &Snapshot<T>,
    base: Option<&Snapshot<T>>,
) -> Result<bool, Error> {
    let shard_id = ctx.config.shard_id;
    let old_generation = state.generation;
    let ancestor_sequence = new_snapshot.ancestors.get(&shard_id).copied();

    let subsumed = new_snapshot.generation == old_generation + 1
        && ancestor_sequence == Some(state.sequence);
    let nothing_local = state.shard_size == 0;

    if subsumed || nothing_local {
        state.data = new_snapshot.data.clone();
        state.sequence = ancestor_sequence.unwrap_or(0);
        state.shard_size = 0;
    } else {
        let owned_base;
        let base = match base {
            Some(base) => base,
            None => match load_base_via_scan(ctx, old_generation) {
                Some(found) => {
                    owned_base = found;
                    &owned_base
                }
                None => {
                    tracing::warn!(
                        generation = old_generation,
                        "no usable common ancestor; rebase abandoned"
                    );
                    return Ok(false);
                }
            },
        };

        let merged = (ctx.merger)(&state.data, &new_snapshot.data, &base.data)?;
        let resume_sequence = ancestor_sequence.unwrap_or(0);
        match T::diff(&new_snapshot.data, &merged) {
            Some(patch) => {
                let sequence =
                    resume_sequence
                        .checked_add(1)
                        .ok_or(Error::SequenceExhausted {
                            generation: new_snapshot.generation,
                        })?;
                let written = shard::append_txn::<T>(
                    &ctx.dir,
                    ctx.config.app_id,
                    shard_id,
                    new_snapshot.generation,
                    sequence,
                    &patch,
                )?;
                state.sequence = sequence;
                state.shard_size = written;
            }
            None => {
                state.sequence = resume_sequence;
                state.shard_size = 0;
            }
        }
        state.data = merged;
    }

    state.generation = new_snapshot.generation;
    tracing::info!(
        from = old_generation,
        to = state.generation,
        fast = subsumed || nothing_local,
        "rebased onto newer snapshot"
    );

    shard::delete_shard(&ctx.dir, shard_id, old_generation);
    collect_garbage(ctx, state);
    Ok(true)
}

/// Unlink snapshots nothing references any more: older than this process's
/// generation, unlocked, and without a shard still targeting them.
pub(crate) fn collect_garbage<T: Datatype>(ctx: &Arc<DbContext<T>>, state: &EngineState<T>) {
    let scan = match scan_directory(&ctx.dir, ctx.config.app_id, ctx.config.shard_id, false) {
        Ok(scan) => scan,
        Err(err) => {
            tracing::debug!(error = %err, "skipping snapshot garbage collection");
            return;
        }
    };
    for snapshot in &scan.snapshots {
        let referenced = scan
            .shards
            .iter()
            .any(|shard| shard.generation == snapshot.generation);
        if snapshot.generation < state.generation
            && snapshot.locked_by.is_none()
            && !referenced
        {
            tracing::info!(snapshot = %snapshot.name, "deleting unreferenced snapshot");
            let path = ctx.dir.join(&snapshot.name);
            if let Err(err) = std::fs::remove_file(&path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                tracing::debug!(path = %path.display(), error = %err, "could not delete snapshot");
            }
        }
    }
}

fn adopted_state<T: Datatype>(snapshot: &Snapshot<T>, ctx: &DbContext<T>) -> EngineState<T> {
    EngineState {
        generation: snapshot.generation,
        sequence: snapshot
            .ancestors
            .get(&ctx.config.shard_id)
            .copied()
            .unwrap_or(0),
        data: snapshot.data.clone(),
        shard_size: 0,
    }
}

fn replay_own_shard<T: Datatype>(
    ctx: &DbContext<T>,
    desc: &FileDesc,
    base: &Snapshot<T>,
) -> Result<EngineState<T>, Error> {
    let read = read_shard::<T>(&ctx.dir, desc, ctx.config.app_id, true)?;
    let mut data = base.data.clone();
    for (_, patch) in &read.txns {
        data = T::apply(&data, patch)?;
    }
    let sequence = read
        .txns
        .last()
        .map(|(sequence, _)| *sequence)
        .or_else(|| base.ancestors.get(&ctx.config.shard_id).copied())
        .unwrap_or(0);
    Ok(EngineState {
        generation: desc.generation,
        sequence,
        data,
        shard_size: read.size,
    })
}

fn load_base_snapshot<T: Datatype>(
    ctx: &DbContext<T>,
    scan: &DirectoryScan,
    generation: u32,
) -> Option<Snapshot<T>> {
    if generation == 0 {
        return Some(Snapshot::initial(ctx.initial.clone()));
    }
    let desc = scan.snapshot_at(generation)?;
    if desc.locked_by.is_some() {
        return None;
    }
    match read_snapshot::<T>(&ctx.dir, desc, ctx.config.app_id) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            tracing::warn!(snapshot = %desc.name, error = %err, "common ancestor snapshot is unreadable");
            None
        }
    }
}

fn load_base_via_scan<T: Datatype>(ctx: &DbContext<T>, generation: u32) -> Option<Snapshot<T>> {
    if generation == 0 {
        return Some(Snapshot::initial(ctx.initial.clone()));
    }
    let scan =
        scan_directory(&ctx.dir, ctx.config.app_id, ctx.config.shard_id, false).ok()?;
    load_base_snapshot(ctx, &scan, generation)
}

fn quarantine<T: Datatype>(ctx: &DbContext<T>, desc: &FileDesc) {
    if let Err(err) = shard::quarantine_shard(&ctx.dir, &desc.name) {
        tracing::warn!(shard = %desc.name, error = %err, "could not quarantine shard");
    }
}
