//! The user datatype seam: structural diff/apply plus CBOR encoding.

use minicbor::decode;
use minicbor::encode::{self, Write};
use minicbor::{Decoder, Encoder};
use thiserror::Error;

/// The application value stored in the database.
///
/// The database holds a single value of this type per process and records
/// every mutation as a structural patch. Implementations must guarantee
/// that applying the patches produced by [`Datatype::diff`] in sequence
/// reproduces the post-image exactly; the engine replays them from shard
/// files on open, compaction and rebase.
///
/// Values are handed out by clone, so cheap-to-clone representations
/// (persistent/structurally shared collections) are a good fit.
pub trait Datatype: Clone + Send + Sync + 'static {
    /// Structural delta between two values of this type.
    type Patch: Clone + Send + 'static;

    /// Compute the delta from `base` to `next`, or `None` when the values
    /// are identical (the mutation is then dropped entirely).
    fn diff(base: &Self, next: &Self) -> Option<Self::Patch>;

    /// Apply a patch recorded by [`Datatype::diff`].
    fn apply(base: &Self, patch: &Self::Patch) -> Result<Self, PatchError>;

    fn encode_value<W: Write>(
        &self,
        encoder: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>>;

    fn decode_value(decoder: &mut Decoder<'_>) -> Result<Self, decode::Error>;

    fn encode_patch<W: Write>(
        patch: &Self::Patch,
        encoder: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>>;

    fn decode_patch(decoder: &mut Decoder<'_>) -> Result<Self::Patch, decode::Error>;
}

/// Three-way merge over the user datatype, called as
/// `merge(target, other, base)`: compute what `other` changed relative to
/// `base` and apply those changes to `target`.
pub type Merger<T> = Box<dyn Fn(&T, &T, &T) -> Result<T, MergeError> + Send + Sync>;

/// Fired after a successful compaction with `(merged, base)`. Runs on a
/// detached thread; a panicking hook does not affect the database.
pub type PostCompactionHook<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("patch does not apply: {reason}")]
pub struct PatchError {
    pub reason: String,
}

impl PatchError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("merge failed: {reason}")]
pub struct MergeError {
    pub reason: String,
}

impl MergeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
