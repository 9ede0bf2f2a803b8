//! Host integration.
//!
//! The scheduler never drains itself. When a lane goes from idle to
//! non-empty it asks its [`Host`] for a flush, and the host decides when
//! that happens: on the next executor turn, on the next frame tick, or
//! whenever an embedding loop calls [`Scheduler::run_until_idle`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::task::noop_waker_ref;
use parking_lot::Mutex;
use tracing::trace;

use super::{Lane, Scheduler};

/// The environment a [`Scheduler`] runs in.
pub trait Host: Send + Sync + 'static {
    /// `lane` has work and no flush is outstanding.
    fn request_flush(&self, scheduler: &Scheduler, lane: Lane);

    /// A timer was registered for `deadline`.
    fn request_timer(&self, scheduler: &Scheduler, deadline: Instant);

    /// Drive `future` to completion.
    fn spawn(&self, scheduler: &Scheduler, future: BoxFuture<'static, ()>);

    /// The host clock.
    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Poll futures the host holds itself. Returns `true` if any completed.
    fn poll_spawned(&self, _scheduler: &Scheduler) -> bool {
        false
    }
}

/// A host that does nothing on its own.
///
/// Lanes drain only when [`Scheduler::flush`] or
/// [`Scheduler::run_until_idle`] is called, time only moves on
/// [`ManualHost::advance`], and spawned futures are polled by
/// `run_until_idle`. Deterministic, so it backs the test suite.
pub struct ManualHost {
    origin: Instant,
    elapsed: Mutex<Duration>,
    spawned: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl ManualHost {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Move the virtual clock forward.
    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
    }

    /// Virtual time since the host was created.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }

    /// Number of spawned futures that have not completed.
    pub fn spawned_count(&self) -> usize {
        self.spawned.lock().len()
    }
}

impl Default for ManualHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for ManualHost {
    fn request_flush(&self, _scheduler: &Scheduler, lane: Lane) {
        trace!(%lane, "manual host: flush requested");
    }

    fn request_timer(&self, _scheduler: &Scheduler, _deadline: Instant) {}

    fn spawn(&self, _scheduler: &Scheduler, future: BoxFuture<'static, ()>) {
        self.spawned.lock().push(future);
    }

    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }

    fn poll_spawned(&self, scheduler: &Scheduler) -> bool {
        let futures = std::mem::take(&mut *self.spawned.lock());
        if futures.is_empty() {
            return false;
        }

        let _current = scheduler.enter();
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut pending = Vec::with_capacity(futures.len());
        let mut completed = false;

        for mut future in futures {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => completed = true,
                Poll::Pending => pending.push(future),
            }
        }

        // Futures spawned while polling were pushed behind our back.
        let mut spawned = self.spawned.lock();
        pending.append(&mut spawned);
        *spawned = pending;
        completed
    }
}

/// Default spacing of frame-lane flushes under [`TokioHost`].
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// A host backed by a tokio runtime.
///
/// The microtask lane drains after one `yield_now`, the frame lane after a
/// frame interval, timers fire from `sleep_until` and futures run as tokio
/// tasks.
pub struct TokioHost {
    handle: tokio::runtime::Handle,
    frame_interval: Duration,
}

impl TokioHost {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }

    /// Use the runtime this is called from.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }
}

impl Host for TokioHost {
    fn request_flush(&self, scheduler: &Scheduler, lane: Lane) {
        let scheduler = scheduler.clone();
        let frame_interval = self.frame_interval;
        self.handle.spawn(async move {
            match lane {
                Lane::Microtask => tokio::task::yield_now().await,
                Lane::Frame => tokio::time::sleep(frame_interval).await,
            }
            scheduler.flush(lane);
        });
    }

    fn request_timer(&self, scheduler: &Scheduler, deadline: Instant) {
        let scheduler = scheduler.clone();
        self.handle.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            scheduler.run_timers();
        });
    }

    fn spawn(&self, scheduler: &Scheduler, future: BoxFuture<'static, ()>) {
        let scheduler = scheduler.clone();
        self.handle.spawn(Entered { scheduler, future });
    }
}

/// Makes the scheduler current around every poll of a spawned future.
struct Entered {
    scheduler: Scheduler,
    future: BoxFuture<'static, ()>,
}

impl Future for Entered {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let _current = this.scheduler.enter();
        this.future.as_mut().poll(cx)
    }
}

/// A scheduler on a fresh [`ManualHost`], plus the host for driving its clock.
#[cfg(test)]
pub(crate) fn manual_scheduler() -> (std::sync::Arc<ManualHost>, Scheduler) {
    use std::sync::Arc;

    let host = Arc::new(ManualHost::new());
    let scheduler = Scheduler::with_host(host.clone());
    (host, scheduler)
}
