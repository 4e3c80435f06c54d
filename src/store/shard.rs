//! Shard files: per-process append-only transaction logs.
//!
//! A shard is a run of blocks, each carrying one `txn` envelope. Reads
//! scan sequentially and stop at the first damage; the owning process
//! additionally repairs its own shard by truncating the tail at the last
//! good block boundary (temp file + rename).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::codec::block;
use crate::datatype::Datatype;
use crate::ids::{AppId, ShardId};

use super::payload::{self, Payload, TxnPayload};
use super::{FileDesc, FileKind, MAX_FILE_BYTES, StoreError, file_name};

pub struct ShardRead<T: Datatype> {
    /// Transactions in sequence order.
    pub txns: Vec<(u32, T::Patch)>,
    /// File size after the read (smaller than the descriptor's when the
    /// tail was repaired).
    pub size: u64,
    pub repaired: bool,
}

pub fn read_shard<T: Datatype>(
    dir: &Path,
    desc: &FileDesc,
    app_id: AppId,
    own: bool,
) -> Result<ShardRead<T>, StoreError> {
    let path = dir.join(&desc.name);
    if desc.size > MAX_FILE_BYTES {
        return Err(StoreError::FileTooLarge {
            path,
            size: desc.size,
        });
    }

    let buf = fs::read(&path).map_err(|source| StoreError::io(&path, source))?;
    let mut txns: Vec<(u32, T::Patch)> = Vec::new();
    let mut offset = 0usize;
    let mut cut_at: Option<usize> = None;

    loop {
        let scanned = payload::scan_payload_block::<T>(&buf, offset);
        match scanned.payload {
            Some(Payload::Txn(txn))
                if txn.app_id == app_id
                    && txn.shard_id.as_uuid() == &desc.uuid
                    && txn.generation == desc.generation =>
            {
                txns.push((txn.sequence, txn.patch));
                offset = scanned.offset + scanned.length;
            }
            Some(_) => {
                tracing::warn!(
                    shard = %desc.name,
                    offset = scanned.offset,
                    "block with mismatched tags in shard"
                );
                cut_at = Some(scanned.offset);
                break;
            }
            None if scanned.is_truncated() => {
                cut_at = Some(scanned.offset);
                break;
            }
            None => break,
        }
    }

    txns.sort_by_key(|(sequence, _)| *sequence);

    let mut size = buf.len() as u64;
    let mut repaired = false;
    if let Some(cut) = cut_at
        && own
    {
        match truncate_via_rename(dir, &desc.name, &buf, cut) {
            Ok(()) => {
                tracing::warn!(shard = %desc.name, at = cut, "repaired shard tail");
                size = cut as u64;
                repaired = true;
            }
            Err(err) => {
                tracing::warn!(shard = %desc.name, error = %err, "could not repair shard tail");
            }
        }
    }

    Ok(ShardRead {
        txns,
        size,
        repaired,
    })
}

/// Append one transaction block to the owning process's shard file and
/// return the number of bytes written.
pub fn append_txn<T: Datatype>(
    dir: &Path,
    app_id: AppId,
    shard_id: ShardId,
    generation: u32,
    sequence: u32,
    patch: &T::Patch,
) -> Result<u64, StoreError> {
    let bytes = payload::encode_txn::<T>(&TxnPayload {
        app_id,
        shard_id,
        generation,
        sequence,
        patch: patch.clone(),
    })?;
    let frame = block::write_block(&bytes).map_err(|err| StoreError::Encode {
        reason: err.to_string(),
    })?;

    let path = dir.join(file_name(shard_id.as_uuid(), generation, FileKind::Shard));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| StoreError::io(&path, source))?;
    file.write_all(&frame)
        .map_err(|source| StoreError::io(&path, source))?;
    file.sync_all()
        .map_err(|source| StoreError::io(&path, source))?;
    Ok(frame.len() as u64)
}

/// Best-effort removal of this process's shard at a generation.
pub fn delete_shard(dir: &Path, shard_id: ShardId, generation: u32) {
    let path = dir.join(file_name(shard_id.as_uuid(), generation, FileKind::Shard));
    if let Err(err) = fs::remove_file(&path)
        && err.kind() != io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %err, "could not delete shard");
    }
}

/// Move a shard whose base snapshot is gone out of the way, probing
/// `<name>.<hex8>.sdbf` suffixes for a free slot.
///
/// The move is link-then-unlink: the link fails when the candidate
/// already exists, so no stat precedes it and a concurrent probe cannot
/// clobber an occupied slot.
pub fn quarantine_shard(dir: &Path, name: &str) -> Result<PathBuf, StoreError> {
    let source = dir.join(name);
    for suffix in 0..=u32::MAX {
        let candidate = dir.join(format!("{name}.{suffix:08x}.sdbf"));
        match fs::hard_link(&source, &candidate) {
            Ok(()) => {
                if let Err(err) = fs::remove_file(&source) {
                    tracing::debug!(path = %source.display(), error = %err, "could not remove quarantined shard source");
                }
                tracing::warn!(from = name, to = %candidate.display(), "quarantined broken shard");
                return Ok(candidate);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(StoreError::io(&candidate, err)),
        }
    }
    Err(StoreError::invalid(
        source,
        "no free quarantine suffix left",
    ))
}

fn truncate_via_rename(
    dir: &Path,
    name: &str,
    buf: &[u8],
    keep: usize,
) -> Result<(), StoreError> {
    super::write_file_atomic(dir, name, &buf[..keep])
}
