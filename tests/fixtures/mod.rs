//! Shared fixtures: a small document datatype with field-granular patches
//! and a field-wise three-way merger.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use fishtrap::minicbor::decode;
use fishtrap::minicbor::encode::{self, Write};
use fishtrap::minicbor::{Decoder, Encoder};
use fishtrap::{AppId, Config, Database, Datatype, MergeError, Merger, PatchError, ShardId};
use uuid::Uuid;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Doc {
    pub something: i64,
    pub other: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DocPatch {
    pub something: Option<i64>,
    pub other: Option<Vec<String>>,
}

pub fn doc(something: i64, other: &[&str]) -> Doc {
    Doc {
        something,
        other: other.iter().map(|s| s.to_string()).collect(),
    }
}

/// Take `other`'s field where it changed relative to `base`, keep
/// `target`'s otherwise. Identity on disjoint changes.
pub fn merge_docs(target: &Doc, other: &Doc, base: &Doc) -> Result<Doc, MergeError> {
    Ok(Doc {
        something: if other.something != base.something {
            other.something
        } else {
            target.something
        },
        other: if other.other != base.other {
            other.other.clone()
        } else {
            target.other.clone()
        },
    })
}

impl Datatype for Doc {
    type Patch = DocPatch;

    fn diff(base: &Self, next: &Self) -> Option<Self::Patch> {
        let patch = DocPatch {
            something: (base.something != next.something).then_some(next.something),
            other: (base.other != next.other).then(|| next.other.clone()),
        };
        (patch != DocPatch::default()).then_some(patch)
    }

    fn apply(base: &Self, patch: &Self::Patch) -> Result<Self, PatchError> {
        Ok(Doc {
            something: patch.something.unwrap_or(base.something),
            other: patch.other.clone().unwrap_or_else(|| base.other.clone()),
        })
    }

    fn encode_value<W: Write>(
        &self,
        encoder: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        encoder
            .map(2)?
            .str("something")?
            .i64(self.something)?
            .str("other")?
            .array(self.other.len() as u64)?;
        for entry in &self.other {
            encoder.str(entry)?;
        }
        Ok(())
    }

    fn decode_value(decoder: &mut Decoder<'_>) -> Result<Self, decode::Error> {
        let Some(entries) = decoder.map()? else {
            return Err(decode::Error::message("indefinite map"));
        };
        let mut value = Doc::default();
        for _ in 0..entries {
            match decoder.str()? {
                "something" => value.something = decoder.i64()?,
                "other" => value.other = decode_strings(decoder)?,
                _ => decoder.skip()?,
            }
        }
        Ok(value)
    }

    fn encode_patch<W: Write>(
        patch: &Self::Patch,
        encoder: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        let entries = patch.something.is_some() as u64 + patch.other.is_some() as u64;
        encoder.map(entries)?;
        if let Some(something) = patch.something {
            encoder.str("something")?.i64(something)?;
        }
        if let Some(other) = &patch.other {
            encoder.str("other")?.array(other.len() as u64)?;
            for entry in other {
                encoder.str(entry)?;
            }
        }
        Ok(())
    }

    fn decode_patch(decoder: &mut Decoder<'_>) -> Result<Self::Patch, decode::Error> {
        let Some(entries) = decoder.map()? else {
            return Err(decode::Error::message("indefinite map"));
        };
        let mut patch = DocPatch::default();
        for _ in 0..entries {
            match decoder.str()? {
                "something" => patch.something = Some(decoder.i64()?),
                "other" => patch.other = Some(decode_strings(decoder)?),
                _ => decoder.skip()?,
            }
        }
        Ok(patch)
    }
}

fn decode_strings(decoder: &mut Decoder<'_>) -> Result<Vec<String>, decode::Error> {
    let Some(entries) = decoder.array()? else {
        return Err(decode::Error::message("indefinite array"));
    };
    let mut out = Vec::with_capacity(entries as usize);
    for _ in 0..entries {
        out.push(decoder.str()?.to_string());
    }
    Ok(out)
}

pub fn app_id() -> AppId {
    AppId::new(Uuid::from_bytes([0xAA; 16]))
}

pub fn shard_id(tag: u8) -> ShardId {
    ShardId::new(Uuid::from_bytes([tag; 16]))
}

static INIT_TRACING: Once = Once::new();

/// Route library tracing through the test harness; `RUST_LOG` narrows it.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Config with background timers disabled; the tests drive compaction and
/// rebase explicitly.
pub fn test_config(dir: &Path, shard: ShardId) -> Config {
    init_tracing();
    let mut config = Config::new(app_id(), shard);
    config.base_directory = dir.to_path_buf();
    config.compaction_interval_minutes = 0;
    config.check_interval_minutes = 0;
    config
}

pub fn open_db(dir: &Path, shard: ShardId, initial: Doc) -> Database<Doc> {
    Database::new(
        test_config(dir, shard),
        initial,
        Box::new(merge_docs) as Merger<Doc>,
        None,
    )
    .expect("open database")
}

/// Store file names in `dir` with the given suffix, sorted.
pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read store dir")
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(suffix))
        .collect();
    names.sort();
    names
}
