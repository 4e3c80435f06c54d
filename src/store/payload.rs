//! Tagged CBOR envelopes carried inside blocks.
//!
//! Three payload kinds share the map shape `{typ, aid, ...}`: snapshots
//! (`snp`), transactions (`txn`) and lockfiles (`lck`). The `typ` tag is
//! always the first key so a reader can dispatch before touching the
//! user datatype.

use std::collections::BTreeMap;

use minicbor::decode;
use minicbor::{Decoder, Encoder};
use uuid::Uuid;

use crate::codec::block::{self, ScannedBlock};
use crate::datatype::Datatype;
use crate::ids::{AppId, ShardId};

use super::StoreError;

const TYP_SNAPSHOT: &str = "snp";
const TYP_TXN: &str = "txn";
const TYP_LOCK: &str = "lck";

#[derive(Clone, Debug)]
pub struct SnapshotPayload<T: Datatype> {
    pub app_id: AppId,
    pub generation: u32,
    pub data: T,
    pub ancestors: BTreeMap<ShardId, u32>,
}

#[derive(Clone)]
pub struct TxnPayload<T: Datatype> {
    pub app_id: AppId,
    pub shard_id: ShardId,
    pub generation: u32,
    pub sequence: u32,
    pub patch: T::Patch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockPayload {
    pub app_id: AppId,
    pub shard_id: ShardId,
    pub generation: u32,
}

#[derive(Clone)]
pub enum Payload<T: Datatype> {
    Snapshot(SnapshotPayload<T>),
    Txn(TxnPayload<T>),
    Lock(LockPayload),
}

fn encode_error<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Encode {
        reason: err.to_string(),
    }
}

pub fn encode_snapshot<T: Datatype>(payload: &SnapshotPayload<T>) -> Result<Vec<u8>, StoreError> {
    let mut encoder = Encoder::new(Vec::new());
    encoder
        .map(5)
        .and_then(|e| e.str("typ"))
        .and_then(|e| e.str(TYP_SNAPSHOT))
        .and_then(|e| e.str("aid"))
        .and_then(|e| e.bytes(payload.app_id.as_uuid().as_bytes()))
        .and_then(|e| e.str("gen"))
        .and_then(|e| e.u32(payload.generation))
        .map_err(encode_error)?;
    encoder.str("dat").map_err(encode_error)?;
    payload.data.encode_value(&mut encoder).map_err(encode_error)?;
    encoder
        .str("anc")
        .and_then(|e| e.map(payload.ancestors.len() as u64))
        .map_err(encode_error)?;
    for (shard_id, sequence) in &payload.ancestors {
        encoder
            .bytes(shard_id.as_uuid().as_bytes())
            .and_then(|e| e.u32(*sequence))
            .map_err(encode_error)?;
    }
    Ok(encoder.into_writer())
}

pub fn encode_txn<T: Datatype>(payload: &TxnPayload<T>) -> Result<Vec<u8>, StoreError> {
    let mut encoder = Encoder::new(Vec::new());
    encoder
        .map(6)
        .and_then(|e| e.str("typ"))
        .and_then(|e| e.str(TYP_TXN))
        .and_then(|e| e.str("aid"))
        .and_then(|e| e.bytes(payload.app_id.as_uuid().as_bytes()))
        .and_then(|e| e.str("sid"))
        .and_then(|e| e.bytes(payload.shard_id.as_uuid().as_bytes()))
        .and_then(|e| e.str("gen"))
        .and_then(|e| e.u32(payload.generation))
        .and_then(|e| e.str("seq"))
        .and_then(|e| e.u32(payload.sequence))
        .map_err(encode_error)?;
    encoder.str("dat").map_err(encode_error)?;
    T::encode_patch(&payload.patch, &mut encoder).map_err(encode_error)?;
    Ok(encoder.into_writer())
}

pub fn encode_lock(payload: &LockPayload) -> Result<Vec<u8>, StoreError> {
    let mut encoder = Encoder::new(Vec::new());
    encoder
        .map(4)
        .and_then(|e| e.str("typ"))
        .and_then(|e| e.str(TYP_LOCK))
        .and_then(|e| e.str("aid"))
        .and_then(|e| e.bytes(payload.app_id.as_uuid().as_bytes()))
        .and_then(|e| e.str("sid"))
        .and_then(|e| e.bytes(payload.shard_id.as_uuid().as_bytes()))
        .and_then(|e| e.str("gen"))
        .and_then(|e| e.u32(payload.generation))
        .map_err(encode_error)?;
    Ok(encoder.into_writer())
}

pub fn decode_payload<T: Datatype>(bytes: &[u8]) -> Result<Payload<T>, decode::Error> {
    let mut decoder = Decoder::new(bytes);
    let Some(entries) = decoder.map()? else {
        return Err(decode::Error::message("indefinite-length payload map"));
    };
    if entries == 0 {
        return Err(decode::Error::message("empty payload map"));
    }
    if decoder.str()? != "typ" {
        return Err(decode::Error::message("payload map does not start with typ"));
    }
    let typ = decoder.str()?;
    let remaining = entries - 1;
    match typ {
        TYP_SNAPSHOT => decode_snapshot::<T>(&mut decoder, remaining).map(Payload::Snapshot),
        TYP_TXN => decode_txn::<T>(&mut decoder, remaining).map(Payload::Txn),
        TYP_LOCK => decode_lock(&mut decoder, remaining).map(Payload::Lock),
        other => Err(decode::Error::message(format!(
            "unknown payload type {other:?}"
        ))),
    }
}

fn decode_snapshot<T: Datatype>(
    decoder: &mut Decoder<'_>,
    entries: u64,
) -> Result<SnapshotPayload<T>, decode::Error> {
    let mut app_id = None;
    let mut generation = None;
    let mut data = None;
    let mut ancestors = None;

    for _ in 0..entries {
        match decoder.str()? {
            "aid" => app_id = Some(AppId::new(decode_uuid(decoder)?)),
            "gen" => generation = Some(decoder.u32()?),
            "dat" => data = Some(T::decode_value(decoder)?),
            "anc" => ancestors = Some(decode_ancestors(decoder)?),
            _ => decoder.skip()?,
        }
    }

    Ok(SnapshotPayload {
        app_id: app_id.ok_or_else(|| decode::Error::message("snapshot missing aid"))?,
        generation: generation.ok_or_else(|| decode::Error::message("snapshot missing gen"))?,
        data: data.ok_or_else(|| decode::Error::message("snapshot missing dat"))?,
        ancestors: ancestors.ok_or_else(|| decode::Error::message("snapshot missing anc"))?,
    })
}

fn decode_txn<T: Datatype>(
    decoder: &mut Decoder<'_>,
    entries: u64,
) -> Result<TxnPayload<T>, decode::Error> {
    let mut app_id = None;
    let mut shard_id = None;
    let mut generation = None;
    let mut sequence = None;
    let mut patch = None;

    for _ in 0..entries {
        match decoder.str()? {
            "aid" => app_id = Some(AppId::new(decode_uuid(decoder)?)),
            "sid" => shard_id = Some(ShardId::new(decode_uuid(decoder)?)),
            "gen" => generation = Some(decoder.u32()?),
            "seq" => sequence = Some(decoder.u32()?),
            "dat" => patch = Some(T::decode_patch(decoder)?),
            _ => decoder.skip()?,
        }
    }

    Ok(TxnPayload {
        app_id: app_id.ok_or_else(|| decode::Error::message("txn missing aid"))?,
        shard_id: shard_id.ok_or_else(|| decode::Error::message("txn missing sid"))?,
        generation: generation.ok_or_else(|| decode::Error::message("txn missing gen"))?,
        sequence: sequence.ok_or_else(|| decode::Error::message("txn missing seq"))?,
        patch: patch.ok_or_else(|| decode::Error::message("txn missing dat"))?,
    })
}

fn decode_lock(decoder: &mut Decoder<'_>, entries: u64) -> Result<LockPayload, decode::Error> {
    let mut app_id = None;
    let mut shard_id = None;
    let mut generation = None;

    for _ in 0..entries {
        match decoder.str()? {
            "aid" => app_id = Some(AppId::new(decode_uuid(decoder)?)),
            "sid" => shard_id = Some(ShardId::new(decode_uuid(decoder)?)),
            "gen" => generation = Some(decoder.u32()?),
            _ => decoder.skip()?,
        }
    }

    Ok(LockPayload {
        app_id: app_id.ok_or_else(|| decode::Error::message("lock missing aid"))?,
        shard_id: shard_id.ok_or_else(|| decode::Error::message("lock missing sid"))?,
        generation: generation.ok_or_else(|| decode::Error::message("lock missing gen"))?,
    })
}

/// Decode a payload that must be a lock envelope. Unlike
/// [`decode_payload`], this needs no user datatype.
pub fn decode_lock_envelope(bytes: &[u8]) -> Result<LockPayload, decode::Error> {
    let mut decoder = Decoder::new(bytes);
    let Some(entries) = decoder.map()? else {
        return Err(decode::Error::message("indefinite-length payload map"));
    };
    if entries == 0 {
        return Err(decode::Error::message("empty payload map"));
    }
    if decoder.str()? != "typ" {
        return Err(decode::Error::message("payload map does not start with typ"));
    }
    if decoder.str()? != TYP_LOCK {
        return Err(decode::Error::message("payload is not a lockfile"));
    }
    decode_lock(&mut decoder, entries - 1)
}

fn decode_uuid(decoder: &mut Decoder<'_>) -> Result<Uuid, decode::Error> {
    let bytes = decoder.bytes()?;
    Uuid::from_slice(bytes).map_err(|_| decode::Error::message("uuid must be 16 bytes"))
}

fn decode_ancestors(decoder: &mut Decoder<'_>) -> Result<BTreeMap<ShardId, u32>, decode::Error> {
    let Some(entries) = decoder.map()? else {
        return Err(decode::Error::message("indefinite-length ancestors map"));
    };
    let mut ancestors = BTreeMap::new();
    for _ in 0..entries {
        let shard_id = ShardId::new(decode_uuid(decoder)?);
        let sequence = decoder.u32()?;
        ancestors.insert(shard_id, sequence);
    }
    Ok(ancestors)
}

/// The payload-aware scan: like [`block::scan_block`], but additionally
/// skips blocks whose payload fails to decode as an envelope.
#[derive(Clone)]
pub struct ScannedPayload<T: Datatype> {
    pub offset: usize,
    pub length: usize,
    pub payload: Option<Payload<T>>,
}

impl<T: Datatype> ScannedPayload<T> {
    pub fn is_truncated(&self) -> bool {
        self.payload.is_none() && self.length > 0
    }
}

pub fn scan_payload_block<T: Datatype>(buf: &[u8], start: usize) -> ScannedPayload<T> {
    let mut cursor = start;
    loop {
        let block: ScannedBlock = block::scan_block(buf, cursor);
        let Some(bytes) = block.payload else {
            return ScannedPayload {
                offset: block.offset,
                length: block.length,
                payload: None,
            };
        };
        match decode_payload::<T>(&bytes) {
            Ok(payload) => {
                return ScannedPayload {
                    offset: block.offset,
                    length: block.length,
                    payload: Some(payload),
                };
            }
            Err(err) => {
                tracing::debug!(offset = block.offset, error = %err, "skipping undecodable block payload");
                // Same resync distance as the hash checks: one byte short
                // of the skipped block's end.
                cursor = block.offset + block.length - 1;
            }
        }
    }
}
