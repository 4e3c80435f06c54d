//! The per-instance worker: one thread owning all state, fed by a
//! serialising operation queue, driving the background compaction and
//! rebase-check cadence between operations.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};

use crate::datatype::Datatype;
use crate::error::Error;

use super::DbContext;
use super::compact;
use super::rebase;
use super::state::EngineState;

/// Delay for a threshold-triggered early compaction.
const EARLY_COMPACTION_DELAY: Duration = Duration::from_secs(1);

pub(crate) enum Op<T: Datatype> {
    Get(Sender<crate::Result<T>>),
    Update(Box<dyn FnOnce(&mut T) + Send>, Sender<crate::Result<T>>),
    Compact(Sender<crate::Result<()>>),
    CheckRebase(Sender<crate::Result<()>>),
}

pub(crate) struct WorkerHandle<T: Datatype> {
    pub sender: Sender<Op<T>>,
    join: JoinHandle<()>,
}

impl<T: Datatype> WorkerHandle<T> {
    /// Disconnect the queue (the worker drains what is already enqueued,
    /// then stops) and wait for it to finish.
    pub fn shutdown(self) {
        drop(self.sender);
        if self.join.join().is_err() {
            tracing::warn!("database worker panicked during shutdown");
        }
    }
}

/// Spawn a worker: runs the open procedure on its own thread and reports
/// the outcome before the handle is returned.
pub(crate) fn spawn<T: Datatype>(ctx: Arc<DbContext<T>>) -> crate::Result<WorkerHandle<T>> {
    let (sender, receiver) = unbounded();
    let (ready_tx, ready_rx) = bounded(1);

    let join = thread::Builder::new()
        .name("fishtrap-db".into())
        .spawn(move || {
            let state = match rebase::open_state(&ctx) {
                Ok(state) => {
                    let _ = ready_tx.send(Ok(()));
                    state
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            run(&ctx, state, receiver);
        })
        .map_err(|source| {
            Error::Store(crate::store::StoreError::io(
                std::path::PathBuf::new(),
                source,
            ))
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(WorkerHandle { sender, join }),
        Ok(Err(err)) => {
            let _ = join.join();
            Err(err)
        }
        Err(_) => {
            let _ = join.join();
            Err(Error::Closed)
        }
    }
}

fn run<T: Datatype>(ctx: &Arc<DbContext<T>>, mut state: EngineState<T>, receiver: Receiver<Op<T>>) {
    let threshold = ctx.config.effective_size_threshold();
    let compaction_interval = interval_of(ctx.config.compaction_interval_minutes);
    let check_interval = interval_of(ctx.config.check_interval_minutes);

    let mut next_compaction = compaction_interval.map(|d| Instant::now() + d);
    let mut next_check = check_interval.map(|d| Instant::now() + d);

    loop {
        let deadline = [next_compaction, next_check].into_iter().flatten().min();
        let op = match deadline {
            Some(at) => {
                match receiver.recv_timeout(at.saturating_duration_since(Instant::now())) {
                    Ok(op) => Some(op),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(op) => Some(op),
                Err(_) => break,
            },
        };

        match op {
            Some(Op::Get(reply)) => {
                let _ = reply.send(Ok(state.data.clone()));
            }
            Some(Op::Update(updater, reply)) => {
                let result = state.update(ctx, updater);
                if result.is_ok() && state.shard_size >= threshold {
                    next_compaction = Some(Instant::now() + EARLY_COMPACTION_DELAY);
                }
                let _ = reply.send(result);
            }
            Some(Op::Compact(reply)) => {
                let result = compact::compact(ctx, &mut state);
                next_compaction = compaction_interval.map(|d| Instant::now() + d);
                let _ = reply.send(result.map_err(Into::into));
            }
            Some(Op::CheckRebase(reply)) => {
                let result = rebase::check_rebase(ctx, &mut state).map(|_| ());
                next_check = check_interval.map(|d| Instant::now() + d);
                let _ = reply.send(result);
            }
            None => {
                let now = Instant::now();
                if is_due(next_compaction, now) {
                    match compact::compact(ctx, &mut state) {
                        Ok(()) => {}
                        Err(err) if err.is_contention() => {
                            tracing::info!(error = %err, "periodic compaction skipped");
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "periodic compaction failed");
                        }
                    }
                    next_compaction = compaction_interval.map(|d| Instant::now() + d);
                }
                if is_due(next_check, now) {
                    if let Err(err) = rebase::check_rebase(ctx, &mut state) {
                        tracing::warn!(error = %err, "periodic rebase check failed");
                    }
                    next_check = check_interval.map(|d| Instant::now() + d);
                }
            }
        }
    }

    tracing::debug!("database worker drained and stopped");
}

fn interval_of(minutes: u64) -> Option<Duration> {
    (minutes > 0).then(|| Duration::from_secs(minutes * 60))
}

fn is_due(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|at| at <= now)
}
