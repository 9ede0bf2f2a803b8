//! Batch Coordinator
//!
//! A batch is a scope in which signal writes apply immediately but effect
//! reruns and listener callbacks are deferred. Deferred tasks are
//! deduplicated by identity (`Arc` pointer), so an effect touched by many
//! writes inside one batch runs once. Only the outermost `batch()` flushes:
//! the whole pending list is wrapped in a *single* frame-lane task, making a
//! burst of writes one propagation wave.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use super::{Lane, Scheduler};
use crate::error::{ErrorSource, ReactiveError};

/// A task that can be queued in a batch. Its identity is the `Arc` pointer.
pub type BatchTask = Arc<dyn Fn() + Send + Sync>;

fn task_key(task: &BatchTask) -> usize {
    Arc::as_ptr(task) as *const () as usize
}

#[derive(Default)]
pub(crate) struct BatchState {
    depth: usize,
    /// FIFO of pending tasks, keyed by identity for O(1) dedup.
    pending: IndexMap<usize, BatchTask>,
}

impl BatchState {
    /// Returns `false` if the task was already pending.
    fn queue(&mut self, task: &BatchTask) -> bool {
        let key = task_key(task);
        if self.pending.contains_key(&key) {
            return false;
        }
        self.pending.insert(key, task.clone());
        true
    }

    /// Leave one level; returns the drained tasks when the outermost level
    /// exits.
    fn exit(&mut self) -> Vec<BatchTask> {
        self.depth = self.depth.saturating_sub(1);
        if self.depth > 0 {
            return Vec::new();
        }
        std::mem::take(&mut self.pending).into_values().collect()
    }
}

struct BatchExit<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for BatchExit<'_> {
    fn drop(&mut self) {
        self.scheduler.exit_batch();
    }
}

impl Scheduler {
    /// Run `f` as a batch.
    ///
    /// Writes inside `f` apply immediately; notifications queued through
    /// [`Scheduler::queue_in_batch`] run in one frame-lane task after the
    /// outermost batch exits (also when `f` panics).
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.batch.lock().depth += 1;
        let _exit = BatchExit { scheduler: self };
        f()
    }

    /// Whether a batch is active.
    pub fn is_batching(&self) -> bool {
        self.inner.batch.lock().depth > 0
    }

    /// Current batch nesting depth.
    pub fn batch_depth(&self) -> usize {
        self.inner.batch.lock().depth
    }

    /// Queue `task` for the end of the current batch.
    ///
    /// Returns `false` if the same task (by identity) is already pending.
    /// Outside a batch the task goes straight to the frame lane.
    pub fn queue_in_batch(&self, task: &BatchTask) -> bool {
        {
            let mut batch = self.inner.batch.lock();
            if batch.depth > 0 {
                let queued = batch.queue(task);
                trace!(queued, pending = batch.pending.len(), "task queued in batch");
                return queued;
            }
        }

        let task = task.clone();
        self.schedule(move || task(), None);
        true
    }

    fn exit_batch(&self) {
        let drained = self.inner.batch.lock().exit();
        if drained.is_empty() {
            return;
        }

        debug!(tasks = drained.len(), "flushing batch");
        let scheduler = self.clone();
        self.schedule(
            move || {
                for task in drained {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task())) {
                        scheduler.report(
                            ReactiveError::panicked(&*payload),
                            ErrorSource::Task(Lane::Frame),
                        );
                    }
                }
            },
            None,
        );
    }
}
