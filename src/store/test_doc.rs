//! Sample datatype used by unit tests across the crate.

use minicbor::decode;
use minicbor::encode::{self, Write};
use minicbor::{Decoder, Encoder};

use crate::datatype::{Datatype, MergeError, PatchError};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestDoc {
    pub something: i64,
    pub other: Vec<String>,
}

/// Field-granular delta: a field is present when it changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestDocPatch {
    pub something: Option<i64>,
    pub other: Option<Vec<String>>,
}

pub fn doc(something: i64, other: &[&str]) -> TestDoc {
    TestDoc {
        something,
        other: other.iter().map(|s| s.to_string()).collect(),
    }
}

/// Field-wise three-way merge: take `other`'s field where it changed
/// relative to `base`, keep `target`'s otherwise.
pub fn merge_docs(target: &TestDoc, other: &TestDoc, base: &TestDoc) -> Result<TestDoc, MergeError> {
    Ok(TestDoc {
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

impl Datatype for TestDoc {
    type Patch = TestDocPatch;

    fn diff(base: &Self, next: &Self) -> Option<Self::Patch> {
        let patch = TestDocPatch {
            something: (base.something != next.something).then_some(next.something),
            other: (base.other != next.other).then(|| next.other.clone()),
        };
        (patch != TestDocPatch::default()).then_some(patch)
    }

    fn apply(base: &Self, patch: &Self::Patch) -> Result<Self, PatchError> {
        Ok(TestDoc {
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
        let mut value = TestDoc::default();
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
        let mut patch = TestDocPatch::default();
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
