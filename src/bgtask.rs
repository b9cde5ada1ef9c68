//! Background task workers.
//!
//! Each task type gets a dedicated worker thread fed by an unbounded FIFO
//! channel. The only type today is lazy-free: the reactor hands over sole
//! ownership of a large value and the worker drops it off the hot path.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use crossbeam_channel::{unbounded, Sender};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use tracing::{debug, warn};

use crate::object::Value;

const WORKER_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Task types, one worker thread each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    LazyFree,
}

const TASK_KINDS: &[TaskKind] = &[TaskKind::LazyFree];

/// A unit of background work.
pub enum Task {
    /// Drop the payload; the reactor has already relinquished ownership.
    Free(Value),
    /// Drain out and exit the worker loop.
    Shutdown,
}

#[derive(Debug, Default)]
struct Stats {
    pending: AtomicU64,
    processed: AtomicU64,
}

/// Handle to the spawned worker threads.
pub struct BgWorkers {
    senders: Vec<Sender<Task>>,
    handles: Vec<thread::JoinHandle<()>>,
    stats: Arc<Stats>,
}

impl BgWorkers {
    /// Spawn one worker per task type. Failing to spawn is fatal for server
    /// startup.
    pub fn start() -> std::io::Result<Self> {
        let stats = Arc::new(Stats::default());
        let mut senders = Vec::with_capacity(TASK_KINDS.len());
        let mut handles = Vec::with_capacity(TASK_KINDS.len());

        for kind in TASK_KINDS {
            let (tx, rx) = unbounded::<Task>();
            let stats = Arc::clone(&stats);
            let name = match kind {
                TaskKind::LazyFree => "bg-lazyfree",
            };
            let handle = thread::Builder::new()
                .name(name.to_owned())
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || {
                    mask_watchdog_signal();
                    for task in rx.iter() {
                        match task {
                            Task::Free(value) => {
                                drop(value);
                                stats.pending.fetch_sub(1, Ordering::Relaxed);
                                stats.processed.fetch_add(1, Ordering::Relaxed);
                            }
                            Task::Shutdown => break,
                        }
                    }
                    debug!(worker = name, "background worker exiting");
                })?;
            senders.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            senders,
            handles,
            stats,
        })
    }

    /// Append a task to the FIFO of its worker and wake it.
    pub fn submit(&self, kind: TaskKind, task: Task) {
        if matches!(task, Task::Free(_)) {
            self.stats.pending.fetch_add(1, Ordering::Relaxed);
        }
        let idx = kind as usize;
        if self.senders[idx].send(task).is_err() {
            warn!(?kind, "background worker is gone, task dropped");
            self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn pending(&self) -> u64 {
        self.stats.pending.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.stats.processed.load(Ordering::Relaxed)
    }

    /// Ask every worker to exit and join them best-effort. Queued tasks are
    /// still drained; anything submitted afterwards is dropped.
    pub fn shutdown(self) {
        for tx in &self.senders {
            let _ = tx.send(Task::Shutdown);
        }
        for handle in self.handles {
            if let Err(err) = handle.join() {
                warn!("background worker panicked: {err:?}");
            }
        }
    }
}

/// Keep SIGALRM pointed at the reactor thread only, so a watchdog alarm is
/// never delivered to a worker.
fn mask_watchdog_signal() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGALRM);
    if let Err(err) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None) {
        warn!("can't mask SIGALRM in background worker: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{BgWorkers, Task, TaskKind};
    use crate::object::{StrObject, Value};

    #[test]
    fn frees_submitted_values() {
        let workers = BgWorkers::start().unwrap();
        for i in 0..10 {
            workers.submit(
                TaskKind::LazyFree,
                Task::Free(Value::Str(StrObject::from_int(i))),
            );
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while workers.processed() < 10 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(workers.processed(), 10);
        assert_eq!(workers.pending(), 0);
        workers.shutdown();
    }
}
