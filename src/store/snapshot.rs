//! Snapshot files: one block holding a compacted value at a generation.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::codec::block;
use crate::datatype::Datatype;
use crate::ids::{AppId, ShardId};

use super::payload::{self, Payload, SnapshotPayload};
use super::{FileDesc, FileKind, MAX_FILE_BYTES, StoreError, file_name};

/// A compacted, self-contained value at a generation, together with the
/// highest transaction sequence incorporated from each shard.
#[derive(Clone, Debug)]
pub struct Snapshot<T: Datatype> {
    pub generation: u32,
    pub data: T,
    pub ancestors: BTreeMap<ShardId, u32>,
}

impl<T: Datatype> Snapshot<T> {
    /// The implicit generation-0 snapshot holding the user-supplied
    /// initial value. It never exists on disk.
    pub fn initial(data: T) -> Self {
        Self {
            generation: 0,
            data,
            ancestors: BTreeMap::new(),
        }
    }
}

pub fn read_snapshot<T: Datatype>(
    dir: &Path,
    desc: &FileDesc,
    app_id: AppId,
) -> Result<Snapshot<T>, StoreError> {
    let path = dir.join(&desc.name);
    if desc.size == 0 {
        return Err(StoreError::NoData { path });
    }
    if desc.size > MAX_FILE_BYTES {
        return Err(StoreError::FileTooLarge {
            path,
            size: desc.size,
        });
    }

    let buf = fs::read(&path).map_err(|source| StoreError::io(&path, source))?;
    let scanned = payload::scan_payload_block::<T>(&buf, 0);
    let Some(found) = scanned.payload else {
        return Err(StoreError::NoData { path });
    };
    let Payload::Snapshot(snapshot) = found else {
        return Err(StoreError::invalid(&path, "payload is not a snapshot"));
    };
    if snapshot.app_id != app_id {
        return Err(StoreError::invalid(&path, "snapshot app id mismatch"));
    }
    if snapshot.generation != desc.generation {
        return Err(StoreError::invalid(
            &path,
            format!(
                "snapshot generation {} does not match file name generation {}",
                snapshot.generation, desc.generation
            ),
        ));
    }

    Ok(Snapshot {
        generation: snapshot.generation,
        data: snapshot.data,
        ancestors: snapshot.ancestors,
    })
}

pub fn write_snapshot<T: Datatype>(
    dir: &Path,
    app_id: AppId,
    snapshot: &Snapshot<T>,
) -> Result<(), StoreError> {
    let bytes = payload::encode_snapshot(&SnapshotPayload {
        app_id,
        generation: snapshot.generation,
        data: snapshot.data.clone(),
        ancestors: snapshot.ancestors.clone(),
    })?;
    let block = block::write_block(&bytes).map_err(|err| StoreError::Encode {
        reason: err.to_string(),
    })?;
    let name = file_name(app_id.as_uuid(), snapshot.generation, FileKind::Snapshot);
    super::write_file_atomic(dir, &name, &block)
}
