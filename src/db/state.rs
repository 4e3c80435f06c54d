//! In-memory engine state and the local mutation pipeline.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::datatype::Datatype;
use crate::error::Error;
use crate::store::shard;

use super::DbContext;

/// The state a process holds between reconciliations: its generation, the
/// last transaction sequence it wrote, the current value, and the size of
/// its shard file at this generation.
pub(crate) struct EngineState<T: Datatype> {
    pub generation: u32,
    pub sequence: u32,
    pub data: T,
    pub shard_size: u64,
}

impl<T: Datatype> EngineState<T> {
    /// Run a user mutation: produce the next value, record the structural
    /// delta as a transaction in the shard, then adopt the value. State is
    /// untouched unless the append succeeded.
    pub fn update(
        &mut self,
        ctx: &DbContext<T>,
        updater: Box<dyn FnOnce(&mut T) + Send>,
    ) -> Result<T, Error> {
        let mut next = self.data.clone();
        if catch_unwind(AssertUnwindSafe(|| updater(&mut next))).is_err() {
            tracing::warn!("updater panicked; state unchanged");
            return Err(Error::UpdaterPanicked);
        }

        let Some(patch) = T::diff(&self.data, &next) else {
            return Ok(self.data.clone());
        };

        let sequence = self
            .sequence
            .checked_add(1)
            .ok_or(Error::SequenceExhausted {
                generation: self.generation,
            })?;
        let written = shard::append_txn::<T>(
            &ctx.dir,
            ctx.config.app_id,
            ctx.config.shard_id,
            self.generation,
            sequence,
            &patch,
        )?;

        self.sequence = sequence;
        self.data = next;
        self.shard_size += written;
        Ok(self.data.clone())
    }
}
