//! Time-derived signals.
//!
//! `debounce_signal` and `throttle_signal` mirror a readable source into a
//! new signal at a limited rate. Both run on the scheduler's timer queue
//! (`schedule_after`), so they follow the host clock: real time under the
//! tokio host, virtual time under [`ManualHost`](crate::scheduler::ManualHost).
//!
//! The returned [`ReadSignal`] owns the upstream subscription. Dropping the
//! last clone stops the derivation and cancels any pending timer.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::signal::{ReadSignal, Readable, Signal};
use crate::scheduler::{Scheduler, TaskHandle};

/// Edges on which a debounced signal emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceOptions {
    /// Emit the first value of a burst immediately.
    pub leading: bool,
    /// Emit the last value once the source has been quiet for `wait`.
    pub trailing: bool,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            leading: false,
            trailing: true,
        }
    }
}

/// Edges on which a throttled signal emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleOptions {
    /// Emit the first value of a window immediately.
    pub leading: bool,
    /// Emit the latest suppressed value when the window closes.
    pub trailing: bool,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            leading: true,
            trailing: true,
        }
    }
}

struct TimingState<T> {
    timer: Option<TaskHandle>,
    latest: Option<T>,
}

/// Shared state of one derived signal.
struct Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    output: Signal<T>,
    scheduler: Scheduler,
    period: Duration,
    leading: bool,
    trailing: bool,
    state: Mutex<TimingState<T>>,
}

impl<T> Drop for Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.cancel();
        }
    }
}

impl<T> Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(initial: T, period: Duration, leading: bool, trailing: bool) -> Arc<Self> {
        Arc::new(Self {
            output: Signal::new(initial),
            scheduler: Scheduler::current(),
            period,
            leading,
            trailing,
            state: Mutex::new(TimingState {
                timer: None,
                latest: None,
            }),
        })
    }

    fn start_timer(self: &Arc<Self>, on_fire: fn(&Arc<Self>)) -> TaskHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.scheduler.schedule_after(self.period, move || {
            if let Some(derived) = weak.upgrade() {
                on_fire(&derived);
            }
        })
    }

    fn debounce(self: &Arc<Self>, value: &T) {
        let emit_now = {
            let mut state = self.state.lock();
            let burst_start = state.timer.is_none();
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }

            let emit_now = burst_start && self.leading;
            state.latest = if emit_now { None } else { Some(value.clone()) };
            state.timer = Some(self.start_timer(Self::debounce_fired));
            emit_now
        };

        if emit_now {
            self.output.set(value.clone());
        }
    }

    fn debounce_fired(self: &Arc<Self>) {
        let latest = {
            let mut state = self.state.lock();
            state.timer = None;
            state.latest.take()
        };

        if let Some(value) = latest.filter(|_| self.trailing) {
            trace!("debounce trailing edge");
            self.output.set(value);
        }
    }

    fn throttle(self: &Arc<Self>, value: &T) {
        let emit_now = {
            let mut state = self.state.lock();
            if state.timer.is_some() {
                state.latest = Some(value.clone());
                false
            } else {
                state.latest = if self.leading { None } else { Some(value.clone()) };
                state.timer = Some(self.start_timer(Self::throttle_fired));
                self.leading
            }
        };

        if emit_now {
            self.output.set(value.clone());
        }
    }

    fn throttle_fired(self: &Arc<Self>) {
        let latest = {
            let mut state = self.state.lock();
            state.timer = None;
            let latest = state.latest.take().filter(|_| self.trailing);
            if latest.is_some() {
                // The trailing emit opens a fresh window.
                state.timer = Some(self.start_timer(Self::throttle_fired));
            }
            latest
        };

        if let Some(value) = latest {
            trace!("throttle trailing edge");
            self.output.set(value);
        }
    }
}

/// Debounce `source`: emit once it has been quiet for `wait`.
///
/// With `leading`, the first value of a burst is emitted immediately and the
/// trailing edge only fires if more values arrived during the burst.
pub fn debounce_signal<T, R>(source: &R, wait: Duration, options: DebounceOptions) -> ReadSignal<T>
where
    T: Clone + Send + Sync + 'static,
    R: Readable<T>,
{
    let derived = Derived::new(source.peek(), wait, options.leading, options.trailing);
    let weak = Arc::downgrade(&derived);
    let subscription = source.on(move |value: &T| {
        if let Some(derived) = weak.upgrade() {
            derived.debounce(value);
        }
    });

    let output = derived.output.clone();
    ReadSignal::with_owner(&output, Arc::new((derived, subscription)))
}

/// Throttle `source`: emit at most once per `interval`.
pub fn throttle_signal<T, R>(source: &R, interval: Duration, options: ThrottleOptions) -> ReadSignal<T>
where
    T: Clone + Send + Sync + 'static,
    R: Readable<T>,
{
    let derived = Derived::new(source.peek(), interval, options.leading, options.trailing);
    let weak = Arc::downgrade(&derived);
    let subscription = source.on(move |value: &T| {
        if let Some(derived) = weak.upgrade() {
            derived.throttle(value);
        }
    });

    let output = derived.output.clone();
    ReadSignal::with_owner(&output, Arc::new((derived, subscription)))
}
