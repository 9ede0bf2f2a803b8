//! Cooperative Scheduler
//!
//! The scheduler decides when deferred reactive work runs. It has two lanes:
//!
//! - the **frame** lane, aligned with the host's paint/animation cycle,
//! - the **microtask** lane, drained as soon as the host yields.
//!
//! Each lane holds three priority buckets (`High`, `Medium`, `Low`) drained
//! round-robin with fairness quotas of 8, 4 and 2 tasks per round.
//!
//! # Algorithm
//!
//! A flush of one lane runs in passes:
//!
//! 1. Snapshot and clear all three buckets. Anything enqueued while the
//!    snapshot is running goes to the *next* pass.
//! 2. Round-robin over `[High, Medium, Low]`, running up to `quota` tasks
//!    from each snapshot per round, FIFO, until all three are exhausted.
//! 3. If new tasks arrived during the pass, start another pass.
//! 4. If the pass count reaches the configured cap, log an error, discard
//!    everything still queued on the lane, report the overflow once and stop.
//!
//! # Instances
//!
//! Every thread has a default scheduler. [`Scheduler::enter`] makes another
//! instance current for the lifetime of a guard, and a scheduler is always
//! current while it drains its own lanes, so work created by a task lands on
//! the scheduler that ran it.

mod batch;
mod config;
mod host;
mod slice;
mod timer;

pub use batch::BatchTask;
pub use config::{SchedulerConfig, SchedulerConfigUpdate};
pub use host::{Host, ManualHost, TokioHost, DEFAULT_FRAME_INTERVAL};
#[cfg(test)]
pub(crate) use host::manual_scheduler;
pub use slice::{time_slice, SliceOutcome, TimeSliceOptions, DEFAULT_SLICE_BUDGET_MS};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::error::{self, ErrorHandler, ErrorSource, ReactiveError};
use batch::BatchState;
use timer::TimerQueue;

/// A unit of work queued on a lane.
pub type Task = Box<dyn FnOnce() + Send>;

/// One of the two scheduler lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Aligned to the host's paint/animation cycle.
    Frame,
    /// Drained at the host's next short-delay yield point.
    Microtask,
}

impl Lane {
    /// Both lanes.
    pub const ALL: [Lane; 2] = [Lane::Frame, Lane::Microtask];

    fn index(self) -> usize {
        match self {
            Lane::Frame => 0,
            Lane::Microtask => 1,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Frame => f.write_str("frame"),
            Lane::Microtask => f.write_str("microtask"),
        }
    }
}

/// Task priority within a lane.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Round-robin order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// How many tasks of this priority run per round-robin round.
    pub const fn quota(self) -> usize {
        match self {
            Priority::High => 8,
            Priority::Medium => 4,
            Priority::Low => 2,
        }
    }

    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => f.write_str("high"),
            Priority::Medium => f.write_str("medium"),
            Priority::Low => f.write_str("low"),
        }
    }
}

/// Handle to a scheduled task. Cancelling it skips the task if it has not
/// started yet.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    fn new() -> Self {
        Self::default()
    }

    /// Cancel the task. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`TaskHandle::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct QueuedTask {
    task: Task,
    handle: TaskHandle,
}

type Buckets = [VecDeque<QueuedTask>; 3];

#[derive(Default)]
struct LaneQueue {
    buckets: Buckets,
    /// The host has been asked to flush this lane and has not done so yet.
    flush_requested: bool,
    draining: bool,
}

impl LaneQueue {
    fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }
}

struct SchedulerInner {
    id: u64,
    lanes: [Mutex<LaneQueue>; 2],
    config: RwLock<SchedulerConfig>,
    batch: Mutex<BatchState>,
    timers: Mutex<TimerQueue>,
    host: Arc<dyn Host>,
    error_handler: RwLock<Option<ErrorHandler>>,
    async_warning_emitted: AtomicBool,
}

/// A two-lane cooperative scheduler.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

thread_local! {
    static DEFAULT_SCHEDULER: Scheduler = Scheduler::new();
    static CURRENT: RefCell<Vec<Scheduler>> = const { RefCell::new(Vec::new()) };
    /// Ambient priorities set on this thread, tagged with the scheduler id.
    static AMBIENT: RefCell<Vec<(u64, Priority)>> = const { RefCell::new(Vec::new()) };
}

/// Guard returned by [`Scheduler::enter`].
#[must_use = "the scheduler stops being current as soon as the guard is dropped"]
pub struct SchedulerGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            current.borrow_mut().pop();
        });
    }
}

impl Scheduler {
    /// Create a scheduler driven by a fresh [`ManualHost`].
    pub fn new() -> Self {
        Self::with_host(Arc::new(ManualHost::new()))
    }

    /// Create a scheduler driven by `host`.
    pub fn with_host(host: Arc<dyn Host>) -> Self {
        Self::with_config(host, SchedulerConfig::default())
    }

    /// Create a scheduler with an explicit configuration.
    pub fn with_config(host: Arc<dyn Host>, config: SchedulerConfig) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        Self {
            inner: Arc::new(SchedulerInner {
                id: COUNTER.fetch_add(1, Ordering::Relaxed),
                lanes: Default::default(),
                config: RwLock::new(config),
                batch: Mutex::new(BatchState::default()),
                timers: Mutex::new(TimerQueue::default()),
                host,
                error_handler: RwLock::new(None),
                async_warning_emitted: AtomicBool::new(false),
            }),
        }
    }

    /// The scheduler that is current on this thread.
    pub fn current() -> Self {
        CURRENT
            .with(|current| current.borrow().last().cloned())
            .unwrap_or_else(|| DEFAULT_SCHEDULER.with(Clone::clone))
    }

    /// Make this scheduler current until the guard is dropped.
    pub fn enter(&self) -> SchedulerGuard {
        CURRENT.with(|current| current.borrow_mut().push(self.clone()));
        SchedulerGuard {
            _not_send: PhantomData,
        }
    }

    /// Whether two handles refer to the same scheduler.
    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The host driving this scheduler.
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.inner.host
    }

    /// The host's current time.
    pub fn now(&self) -> Instant {
        self.inner.host.now()
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// A copy of the current configuration.
    pub fn config(&self) -> SchedulerConfig {
        *self.inner.config.read()
    }

    /// Apply a partial configuration update.
    pub fn configure(
        &self,
        update: SchedulerConfigUpdate,
    ) -> Result<SchedulerConfig, ReactiveError> {
        let mut config = self.inner.config.write();
        let next = config.apply(update)?;
        *config = next;
        debug!(scheduler = self.inner.id, ?next, "scheduler reconfigured");
        Ok(next)
    }

    // ------------------------------------------------------------------
    // Error reporting
    // ------------------------------------------------------------------

    /// Install a handler for errors reported through this scheduler.
    ///
    /// Takes precedence over the process-wide handler.
    pub fn set_error_handler<F>(&self, handler: F) -> Option<ErrorHandler>
    where
        F: Fn(&ReactiveError, ErrorSource) + Send + Sync + 'static,
    {
        self.inner.error_handler.write().replace(Arc::new(handler))
    }

    /// Route an error to this scheduler's handler, the process-wide handler,
    /// or the log.
    pub fn report(&self, error: ReactiveError, source: ErrorSource) {
        match self.resolve_handler() {
            Some(handler) => handler(&error, source),
            None => error!(%source, %error, "unhandled reactive error"),
        }
    }

    fn resolve_handler(&self) -> Option<ErrorHandler> {
        self.inner
            .error_handler
            .read()
            .clone()
            .or_else(error::global_handler)
    }

    // ------------------------------------------------------------------
    // Priorities
    // ------------------------------------------------------------------

    /// The ambient priority set for this scheduler on the calling thread.
    pub fn ambient_priority(&self) -> Option<Priority> {
        AMBIENT.with(|ambient| {
            ambient
                .borrow()
                .iter()
                .rev()
                .find(|(id, _)| *id == self.inner.id)
                .map(|&(_, priority)| priority)
        })
    }

    /// Run `f` with `priority` as the ambient priority.
    ///
    /// `schedule`/`schedule_microtask` calls made synchronously inside `f`
    /// without an explicit priority use it. The previous ambient value is
    /// restored on every exit path. The priority is per thread: work
    /// scheduled concurrently from other threads does not see it.
    pub fn with_priority<R>(&self, priority: Priority, f: impl FnOnce() -> R) -> R {
        AMBIENT.with(|ambient| ambient.borrow_mut().push((self.inner.id, priority)));
        let _restore = AmbientRestore {
            _not_send: PhantomData,
        };
        f()
    }

    /// Like [`Scheduler::with_priority`] for a closure that produces a future.
    ///
    /// Only work scheduled while building the future sees the priority; the
    /// ambient value does not survive suspension points. A one-time warning
    /// is logged unless `warn_on_async` is false. Use
    /// [`Scheduler::prioritize`] to carry the priority across polls.
    pub fn with_priority_async<F, Fut>(&self, priority: Priority, warn_on_async: bool, f: F) -> Fut
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let future = self.with_priority(priority, f);
        if warn_on_async && !self.inner.async_warning_emitted.swap(true, Ordering::SeqCst) {
            warn!(
                %priority,
                "ambient scheduler priority does not survive await points; \
                 wrap the future with `prioritize` to carry it explicitly"
            );
        }
        future
    }

    /// Carry `priority` explicitly through every poll of `future`.
    pub fn prioritize<F: Future>(&self, priority: Priority, future: F) -> Prioritized<F> {
        Prioritized {
            scheduler: self.clone(),
            priority,
            future: Box::pin(future),
        }
    }

    // ------------------------------------------------------------------
    // Enqueueing
    // ------------------------------------------------------------------

    /// Queue a task on the frame lane.
    pub fn schedule<F>(&self, task: F, priority: Option<Priority>) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Lane::Frame, priority, Box::new(task))
    }

    /// Queue a task on the microtask lane.
    pub fn schedule_microtask<F>(&self, task: F, priority: Option<Priority>) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Lane::Microtask, priority, Box::new(task))
    }

    /// Run a task once `delay` has elapsed on the host clock.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = self.now() + delay;
        let handle = TaskHandle::new();
        self.inner
            .timers
            .lock()
            .push(deadline, Box::new(task), handle.clone());
        trace!(scheduler = self.inner.id, ?delay, "timer scheduled");
        self.inner.host.request_timer(self, deadline);
        handle
    }

    /// Queue a task on `lane`.
    pub fn enqueue(&self, lane: Lane, priority: Option<Priority>, task: Task) -> TaskHandle {
        let priority = priority
            .or_else(|| self.ambient_priority())
            .unwrap_or_default();
        let handle = TaskHandle::new();

        let request_flush = {
            let mut queue = self.inner.lanes[lane.index()].lock();
            queue.buckets[priority.index()].push_back(QueuedTask {
                task,
                handle: handle.clone(),
            });
            if queue.flush_requested || queue.draining {
                false
            } else {
                queue.flush_requested = true;
                true
            }
        };

        trace!(scheduler = self.inner.id, %lane, %priority, "task queued");
        if request_flush {
            self.inner.host.request_flush(self, lane);
        }
        handle
    }

    /// Spawn a future on the host.
    pub fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.inner.host.spawn(self, future);
    }

    // ------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------

    /// Number of tasks currently queued on `lane`.
    pub fn pending(&self, lane: Lane) -> usize {
        self.inner.lanes[lane.index()].lock().len()
    }

    /// Whether any lane or timer still has work.
    pub fn has_pending_work(&self) -> bool {
        Lane::ALL.iter().any(|&lane| self.pending(lane) > 0)
            || self.inner.timers.lock().has_due(self.now())
    }

    /// The earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.timers.lock().next_deadline()
    }

    /// Drain `lane`. Returns the number of tasks that ran.
    ///
    /// A flush that is already in progress on this lane is not re-entered.
    pub fn flush(&self, lane: Lane) -> usize {
        {
            let mut queue = self.inner.lanes[lane.index()].lock();
            if queue.draining {
                return 0;
            }
            queue.draining = true;
            queue.flush_requested = false;
        }

        let _current = self.enter();
        let _draining = DrainGuard {
            scheduler: self,
            lane,
        };

        let limit = self.config().max_iterations(lane);
        let mut passes = 0;
        let mut ran = 0;

        while let Some(snapshot) = self.take_snapshot(lane) {
            if passes >= limit {
                self.overflow(lane, limit, snapshot);
                break;
            }
            passes += 1;
            debug!(
                scheduler = self.inner.id,
                %lane,
                pass = passes,
                tasks = snapshot.iter().map(VecDeque::len).sum::<usize>(),
                "draining lane"
            );
            ran += self.run_pass(lane, snapshot);
        }

        ran
    }

    /// Fire every timer whose deadline has passed. Returns how many ran.
    ///
    /// Timers scheduled while firing wait for the next call.
    pub fn run_timers(&self) -> usize {
        let now = self.now();
        let _current = self.enter();
        let cutoff = self.inner.timers.lock().next_seq();
        let mut ran = 0;

        loop {
            let due = self.inner.timers.lock().pop_due(now, cutoff);
            let Some(timer) = due else { break };
            if timer.handle.is_cancelled() {
                continue;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(timer.task)) {
                self.report(ReactiveError::panicked(&*payload), ErrorSource::Timer);
            }
            ran += 1;
        }

        ran
    }

    /// Drive everything until no work is left: due timers, host futures, the
    /// microtask lane and then the frame lane.
    ///
    /// Bounded by the frame iteration cap. Returns the number of tasks and
    /// timers that ran.
    pub fn run_until_idle(&self) -> usize {
        let rounds = self.config().max_frame_iterations;
        let mut total = 0;

        for _ in 0..rounds {
            let timers = self.run_timers();
            let progressed = self.inner.host.poll_spawned(self);
            let microtasks = self.flush(Lane::Microtask);
            let frames = self.flush(Lane::Frame);
            let ran = timers + microtasks + frames;
            total += ran;

            if ran == 0 && !progressed && !self.has_pending_work() {
                return total;
            }
        }

        warn!(
            scheduler = self.inner.id,
            rounds, "run_until_idle stopped before the scheduler settled"
        );
        total
    }

    /// Take and clear all buckets of `lane`, or mark the lane idle and return
    /// `None` if they are empty.
    fn take_snapshot(&self, lane: Lane) -> Option<Buckets> {
        let mut queue = self.inner.lanes[lane.index()].lock();
        if queue.len() == 0 {
            queue.draining = false;
            return None;
        }
        Some(std::mem::take(&mut queue.buckets))
    }

    fn run_pass(&self, lane: Lane, mut snapshot: Buckets) -> usize {
        let mut ran = 0;

        while snapshot.iter().any(|bucket| !bucket.is_empty()) {
            for priority in Priority::ALL {
                let bucket = &mut snapshot[priority.index()];
                for _ in 0..priority.quota() {
                    let Some(queued) = bucket.pop_front() else {
                        break;
                    };
                    if self.run_task(lane, queued) {
                        ran += 1;
                    }
                }
            }
        }

        ran
    }

    fn run_task(&self, lane: Lane, queued: QueuedTask) -> bool {
        if queued.handle.is_cancelled() {
            return false;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(queued.task)) {
            self.report(ReactiveError::panicked(&*payload), ErrorSource::Task(lane));
        }
        true
    }

    fn overflow(&self, lane: Lane, limit: usize, snapshot: Buckets) {
        let leftover = {
            let mut queue = self.inner.lanes[lane.index()].lock();
            queue.draining = false;
            std::mem::take(&mut queue.buckets)
        };

        // Discarded handles read as cancelled so their owners can reschedule.
        let mut discarded = 0;
        for queued in snapshot.iter().chain(leftover.iter()).flatten() {
            queued.handle.cancel();
            discarded += 1;
        }

        error!(
            scheduler = self.inner.id,
            %lane,
            limit,
            discarded,
            "lane exceeded its iteration cap; discarding queued tasks"
        );

        // Already logged above, so only a custom handler is notified.
        if let Some(handler) = self.resolve_handler() {
            handler(
                &ReactiveError::SchedulerOverflow {
                    lane,
                    limit,
                    discarded,
                },
                ErrorSource::Scheduler(lane),
            );
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.inner.id)
            .field("frame_pending", &self.pending(Lane::Frame))
            .field("microtask_pending", &self.pending(Lane::Microtask))
            .field("batching", &self.is_batching())
            .field("config", &self.config())
            .finish()
    }
}

struct AmbientRestore {
    _not_send: PhantomData<*const ()>,
}

impl Drop for AmbientRestore {
    fn drop(&mut self) {
        AMBIENT.with(|ambient| {
            ambient.borrow_mut().pop();
        });
    }
}

struct DrainGuard<'a> {
    scheduler: &'a Scheduler,
    lane: Lane,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.inner.lanes[self.lane.index()].lock().draining = false;
    }
}

/// A future that re-applies an ambient priority around every poll.
///
/// Created by [`Scheduler::prioritize`].
pub struct Prioritized<F> {
    scheduler: Scheduler,
    priority: Priority,
    future: Pin<Box<F>>,
}

impl<F: Future> Future for Prioritized<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let future = this.future.as_mut();
        this.scheduler
            .with_priority(this.priority, move || future.poll(cx))
    }
}

// ----------------------------------------------------------------------------
// Free functions on the current scheduler
// ----------------------------------------------------------------------------

/// Queue a task on the current scheduler's frame lane.
pub fn schedule<F>(task: F, priority: Option<Priority>) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    Scheduler::current().schedule(task, priority)
}

/// Queue a task on the current scheduler's microtask lane.
pub fn schedule_microtask<F>(task: F, priority: Option<Priority>) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    Scheduler::current().schedule_microtask(task, priority)
}

/// Run a task on the current scheduler after `delay`.
pub fn schedule_after<F>(delay: Duration, task: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    Scheduler::current().schedule_after(delay, task)
}

/// Read-phase marker: queue `f` on the frame lane.
pub fn measure<F>(f: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    schedule(f, None)
}

/// Write-phase marker: sugar for [`schedule_microtask`].
pub fn mutate<F>(f: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    schedule_microtask(f, None)
}

/// Run `f` with an ambient priority on the current scheduler.
pub fn with_scheduler_priority<R>(priority: Priority, f: impl FnOnce() -> R) -> R {
    Scheduler::current().with_priority(priority, f)
}

/// Run a future-producing `f` with an ambient priority on the current
/// scheduler, warning once that the priority is lost across await points.
pub fn with_scheduler_priority_async<F, Fut>(priority: Priority, warn_on_async: bool, f: F) -> Fut
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    Scheduler::current().with_priority_async(priority, warn_on_async, f)
}

/// Carry `priority` through every poll of `future` on the current scheduler.
pub fn prioritize<F: Future>(priority: Priority, future: F) -> Prioritized<F> {
    Scheduler::current().prioritize(priority, future)
}

/// Update the current scheduler's configuration.
pub fn configure_scheduler(
    update: SchedulerConfigUpdate,
) -> Result<SchedulerConfig, ReactiveError> {
    Scheduler::current().configure(update)
}

/// The current scheduler's configuration.
pub fn scheduler_config() -> SchedulerConfig {
    Scheduler::current().config()
}

/// Run `f` as a batch on the current scheduler.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    Scheduler::current().batch(f)
}

/// Whether the current scheduler is inside a batch.
pub fn is_batching() -> bool {
    Scheduler::current().is_batching()
}

/// Queue `task` in the current scheduler's batch, deduplicated by identity.
pub fn queue_in_batch(task: &BatchTask) -> bool {
    Scheduler::current().queue_in_batch(task)
}
