//! The database: a serialising worker per open instance plus the
//! compaction and rebase machinery behind it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::datatype::{Datatype, Merger, PostCompactionHook};
use crate::error::Error;

pub mod compact;
pub mod rebase;
pub(crate) mod state;
pub(crate) mod worker;

use worker::{Op, WorkerHandle};

/// Everything the worker needs besides its mutable state.
pub(crate) struct DbContext<T: Datatype> {
    pub config: Config,
    pub dir: PathBuf,
    pub initial: T,
    pub merger: Merger<T>,
    pub hook: Option<PostCompactionHook<T>>,
}

/// A file-backed, multi-process, eventually consistent store of a single
/// value of type `T`.
///
/// All operations are serialised through one worker per open instance;
/// peer processes are only observed at compaction and rebase boundaries.
pub struct Database<T: Datatype> {
    ctx: Arc<DbContext<T>>,
    worker: Mutex<Option<WorkerHandle<T>>>,
}

impl<T: Datatype> Database<T> {
    /// Open the database, replaying this process's shard on top of the
    /// newest usable snapshot (or `initial` when none exists).
    pub fn new(
        config: Config,
        initial: T,
        merger: Merger<T>,
        hook: Option<PostCompactionHook<T>>,
    ) -> crate::Result<Self> {
        let ctx = Arc::new(DbContext {
            dir: config.base_directory.clone(),
            config,
            initial,
            merger,
            hook,
        });
        let handle = worker::spawn(Arc::clone(&ctx))?;
        Ok(Self {
            ctx,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Current value, after all previously enqueued work.
    pub fn get(&self) -> crate::Result<T> {
        self.request(Op::Get)
    }

    /// Apply a mutation and resolve with the new value. A mutation that
    /// changes nothing writes nothing.
    pub fn update(&self, updater: impl FnOnce(&mut T) + Send + 'static) -> crate::Result<T> {
        self.request(|reply| Op::Update(Box::new(updater), reply))
    }

    /// Operator escape hatch: attempt a compaction now and surface the
    /// outcome instead of logging it.
    pub fn force_compaction(&self) -> crate::Result<()> {
        self.request(Op::Compact)
    }

    /// Operator escape hatch: look for a newer snapshot and rebase onto it.
    pub fn force_check_rebase(&self) -> crate::Result<()> {
        self.request(Op::CheckRebase)
    }

    /// Drain the queue and stop the worker. Subsequent calls fail with
    /// [`Error::Closed`] until [`Database::open`] is called.
    pub fn close(&self) -> crate::Result<()> {
        let handle = self.lock_worker().take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
        Ok(())
    }

    /// Re-open a closed database, re-running the open procedure. A no-op
    /// when already open.
    pub fn open(&self) -> crate::Result<()> {
        let mut guard = self.lock_worker();
        if guard.is_none() {
            *guard = Some(worker::spawn(Arc::clone(&self.ctx))?);
        }
        Ok(())
    }

    fn request<R>(
        &self,
        make: impl FnOnce(crossbeam::channel::Sender<crate::Result<R>>) -> Op<T>,
    ) -> crate::Result<R> {
        let sender = self
            .lock_worker()
            .as_ref()
            .ok_or(Error::Closed)?
            .sender
            .clone();
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        sender.send(make(reply_tx)).map_err(|_| Error::Closed)?;
        reply_rx.recv().map_err(|_| Error::Closed)?
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<WorkerHandle<T>>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Datatype> Drop for Database<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
