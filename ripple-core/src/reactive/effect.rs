//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect is queued on the scheduler's microtask lane.
//!    It never runs synchronously inside `effect()`.
//!
//! 2. When any dependency is written, the effect is scheduled to re-run.
//!    Repeated writes coalesce: a pending rerun is never queued twice, and
//!    inside a batch the batch deduplicates it.
//!
//! 3. Before re-running, the effect disposes what its previous run owned,
//!    clears its old dependencies and tracks new ones during execution.
//!
//! # Async Effects
//!
//! An async effect's body gets a [`CancellationToken`] and returns a future.
//! Starting a new run cancels the previous run's token; disposal cancels the
//! current one. Dependencies are only tracked while the body builds the
//! future, not across its await points.
//!
//! # Cleanup
//!
//! Each run executes inside a scope owned by the effect. Cleanups registered
//! with [`on_cleanup`](super::on_cleanup) during a run are called before the
//! next run and when the effect is disposed.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::context::{ReactiveContext, SourceList};
use super::scope::{Scope, ScopeInner};
use super::subscriber::{Subscriber, SubscriberId};
use crate::error::{ErrorSource, ReactiveError};
use crate::scheduler::{BatchTask, Scheduler, TaskHandle};

type AsyncBody = Box<dyn FnMut(CancellationToken) -> BoxFuture<'static, ()> + Send>;

enum EffectBody {
    Sync(Box<dyn FnMut() + Send>),
    Async(AsyncBody),
}

struct EffectInner {
    id: SubscriberId,
    this: Weak<EffectInner>,
    /// Taken out while the body runs.
    body: Mutex<Option<EffectBody>>,
    sources: Mutex<SourceList>,
    disposed: AtomicBool,
    /// Set while a rerun is queued on a lane or in a batch.
    scheduled: AtomicBool,
    pending: Mutex<Option<TaskHandle>>,
    token: Mutex<Option<CancellationToken>>,
    run_count: AtomicUsize,
    scheduler: Scheduler,
    run_scope: Scope,
    owner: Weak<ScopeInner>,
    rerun: BatchTask,
}

impl Subscriber for EffectInner {
    fn subscriber_id(&self) -> SubscriberId {
        self.id
    }

    fn notify(&self) {
        self.schedule();
    }
}

impl EffectInner {
    fn schedule(&self) {
        self.enqueue(self.scheduler.is_batching());
    }

    /// Queue one rerun, in the active batch or on the microtask lane.
    fn enqueue(&self, in_batch: bool) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        // Held across the enqueue so a run on another thread cannot clear
        // the slot before the handle is stored.
        let mut pending = self.pending.lock();
        let discarded = pending.as_ref().is_some_and(TaskHandle::is_cancelled);
        if self.scheduled.swap(true, Ordering::SeqCst) && !discarded {
            return;
        }

        if in_batch {
            *pending = None;
            self.scheduler.queue_in_batch(&self.rerun);
            trace!(effect = %self.id, "effect queued in batch");
            return;
        }

        let weak = self.this.clone();
        *pending = Some(self.scheduler.schedule_microtask(
            move || {
                if let Some(effect) = weak.upgrade() {
                    effect.run();
                }
            },
            None,
        ));
        trace!(effect = %self.id, "effect scheduled");
    }

    fn teardown(&self) {
        let sources = std::mem::take(&mut *self.sources.lock());
        for source in sources.iter().filter_map(Weak::upgrade) {
            source.unsubscribe(self.id);
        }
    }

    fn run(self: &Arc<Self>) {
        {
            let mut pending = self.pending.lock();
            if let Some(handle) = pending.take() {
                handle.cancel();
            }
            self.scheduled.store(false, Ordering::SeqCst);
        }
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let Some(mut body) = self.body.lock().take() else {
            return;
        };

        self.run_scope.reset();
        self.teardown();

        let observer: Arc<dyn Subscriber> = self.clone();
        let ctx = match ReactiveContext::enter(observer) {
            Ok(ctx) => ctx,
            Err(err) => {
                *self.body.lock() = Some(body);
                self.scheduler.report(err, ErrorSource::Effect(self.id));
                return;
            }
        };

        trace!(effect = %self.id, "running effect");
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_scope.run(|| match &mut body {
                EffectBody::Sync(f) => {
                    f();
                    None
                }
                EffectBody::Async(f) => {
                    let token = CancellationToken::new();
                    if let Some(previous) = self.token.lock().replace(token.clone()) {
                        previous.cancel();
                    }
                    Some(f(token))
                }
            })
        }));

        let sources = ctx.take_sources();
        drop(ctx);
        *self.body.lock() = Some(body);
        self.run_count.fetch_add(1, Ordering::SeqCst);

        if self.disposed.load(Ordering::SeqCst) {
            // Disposed by its own body; drop what this run subscribed to.
            for source in sources.iter().filter_map(Weak::upgrade) {
                source.unsubscribe(self.id);
            }
        } else {
            *self.sources.lock() = sources;
        }

        match result {
            Ok(Some(future)) => self.spawn(future),
            Ok(None) => {}
            Err(payload) => {
                self.scheduler
                    .report(ReactiveError::panicked(&*payload), ErrorSource::Effect(self.id));
            }
        }
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        let id = self.id;
        let scheduler = self.scheduler.clone();
        self.scheduler.spawn(Box::pin(async move {
            if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
                scheduler.report(ReactiveError::panicked(&*payload), ErrorSource::Effect(id));
            }
        }));
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.pending.lock().take() {
            handle.cancel();
        }
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }

        self.teardown();
        self.run_scope.dispose();
        if let Some(owner) = self.owner.upgrade() {
            owner.release(self.id);
        }
        debug!(effect = %self.id, "effect disposed");
    }
}

/// A side-effecting computation that runs when dependencies change.
///
/// The handle is cheap to clone. Dropping it does not stop the effect; the
/// scope it was created in owns it until [`Effect::dispose`] or the scope's
/// disposal.
///
/// # Example
///
/// ```rust
/// use ripple_core::{effect, signal, Lane, Scheduler};
///
/// let scheduler = Scheduler::new();
/// let _current = scheduler.enter();
///
/// let count = signal(0);
/// let logger = {
///     let count = count.clone();
///     effect(move || println!("Count is: {}", count.get()))
/// };
///
/// scheduler.flush(Lane::Microtask);
/// count.set(5);
/// scheduler.flush(Lane::Microtask); // Prints: "Count is: 5"
/// assert_eq!(logger.run_count(), 2);
/// ```
#[derive(Clone)]
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The first run is queued on the current scheduler's microtask lane.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::create(EffectBody::Sync(Box::new(f)))
    }

    /// Create an async effect. See the module docs.
    pub fn new_async<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::create(EffectBody::Async(Box::new(move |token| f(token).boxed())))
    }

    fn create(body: EffectBody) -> Self {
        let scheduler = Scheduler::current();
        let owner = Scope::current();

        let inner = Arc::new_cyclic(|this: &Weak<EffectInner>| {
            let weak = this.clone();
            EffectInner {
                id: SubscriberId::new(),
                this: this.clone(),
                body: Mutex::new(Some(body)),
                sources: Mutex::new(SourceList::new()),
                disposed: AtomicBool::new(false),
                scheduled: AtomicBool::new(false),
                pending: Mutex::new(None),
                token: Mutex::new(None),
                run_count: AtomicUsize::new(0),
                scheduler,
                run_scope: Scope::detached(),
                owner: owner.downgrade(),
                rerun: Arc::new(move || {
                    if let Some(effect) = weak.upgrade() {
                        // Already run from another queue since it was batched.
                        if effect.scheduled.load(Ordering::SeqCst) {
                            effect.run();
                        }
                    }
                }),
            }
        });

        let effect = Self { inner };
        owner.adopt(effect.clone());
        // The first run always goes to the microtask lane, even inside a batch.
        effect.inner.enqueue(false);
        effect
    }

    /// Get the effect's subscriber ID.
    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    /// Stop the effect: unsubscribe everywhere, cancel any pending rerun and
    /// async work, and run its cleanups. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    /// Get the number of dependencies from the last run.
    pub fn dependency_count(&self) -> usize {
        self.inner.sources.lock().len()
    }

    /// Whether a rerun is queued on the microtask lane.
    pub fn is_scheduled(&self) -> bool {
        let pending = self.inner.pending.lock();
        self.inner.scheduled.load(Ordering::SeqCst)
            && !pending.as_ref().is_some_and(TaskHandle::is_cancelled)
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("disposed", &self.is_disposed())
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .finish()
    }
}

/// Create an effect in the current scope.
pub fn effect<F>(f: F) -> Effect
where
    F: FnMut() + Send + 'static,
{
    Effect::new(f)
}

/// Create an async effect in the current scope.
pub fn effect_async<F, Fut>(f: F) -> Effect
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Effect::new_async(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{on_cleanup, Signal};
    use crate::scheduler::{manual_scheduler, Lane};
    use std::sync::atomic::AtomicI32;

    fn counter() -> (Arc<AtomicI32>, Arc<AtomicI32>) {
        let count = Arc::new(AtomicI32::new(0));
        (count.clone(), count)
    }

    #[test]
    fn effect_does_not_run_on_creation() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let (runs, runs_clone) = counter();

        let effect = Effect::new(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(effect.is_scheduled());
        assert_eq!(scheduler.pending(Lane::Microtask), 1);

        scheduler.flush(Lane::Microtask);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(effect.run_count(), 1);
        assert!(!effect.is_scheduled());
    }

    #[test]
    fn effect_reruns_when_dependency_changes() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let source = Signal::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let effect = {
            let (source, seen) = (source.clone(), seen.clone());
            Effect::new(move || seen.lock().push(source.get()))
        };
        scheduler.flush(Lane::Microtask);
        assert_eq!(effect.dependency_count(), 1);

        source.set(2);
        source.set(3);
        // Coalesced into one pending rerun.
        assert_eq!(scheduler.pending(Lane::Microtask), 1);

        scheduler.flush(Lane::Microtask);
        assert_eq!(*seen.lock(), vec![1, 3]);
    }

    #[test]
    fn effect_does_not_run_after_disposal() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let source = Signal::new(0);
        let (runs, runs_clone) = counter();

        let effect = {
            let source = source.clone();
            Effect::new(move || {
                source.get();
                runs_clone.fetch_add(1, Ordering::SeqCst);
            })
        };
        scheduler.flush(Lane::Microtask);
        assert_eq!(source.subscriber_count(), 1);

        source.set(1);
        effect.dispose();
        effect.dispose();
        scheduler.flush(Lane::Microtask);

        assert!(effect.is_disposed());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn cleanups_run_before_rerun_and_on_dispose() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let source = Signal::new(0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let effect = {
            let (source, log) = (source.clone(), log.clone());
            Effect::new(move || {
                let value = source.get();
                log.lock().push(format!("run {value}"));
                let log = log.clone();
                on_cleanup(move || log.lock().push(format!("cleanup {value}")));
            })
        };

        scheduler.flush(Lane::Microtask);
        source.set(1);
        scheduler.flush(Lane::Microtask);
        effect.dispose();

        assert_eq!(
            *log.lock(),
            vec!["run 0", "cleanup 0", "run 1", "cleanup 1"]
        );
    }

    #[test]
    fn nested_effects_are_disposed_before_the_next_run() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let source = Signal::new(0);
        let children = Arc::new(Mutex::new(Vec::new()));

        let _parent = {
            let (source, children) = (source.clone(), children.clone());
            Effect::new(move || {
                source.get();
                children.lock().push(Effect::new(|| {}));
            })
        };

        scheduler.flush(Lane::Microtask);
        source.set(1);
        scheduler.flush(Lane::Microtask);

        let children = children.lock();
        assert_eq!(children.len(), 2);
        assert!(children[0].is_disposed());
        assert!(!children[1].is_disposed());
    }

    #[test]
    fn panicking_effect_is_reported_and_keeps_tracking() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let reports_clone = reports.clone();
        scheduler.set_error_handler(move |err, source| {
            reports_clone.lock().push((err.to_string(), source));
        });

        let source = Signal::new(0);
        let effect = {
            let source = source.clone();
            Effect::new(move || {
                if source.get() == 1 {
                    panic!("bad value");
                }
            })
        };

        scheduler.flush(Lane::Microtask);
        source.set(1);
        scheduler.flush(Lane::Microtask);
        source.set(2);
        scheduler.flush(Lane::Microtask);

        assert_eq!(effect.run_count(), 3);
        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, "callback panicked: bad value");
        assert_eq!(reports[0].1, ErrorSource::Effect(effect.id()));
    }

    #[test]
    fn effects_follow_the_scope_that_created_them() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let scope = Scope::detached();

        let effect = scope.run(|| Effect::new(|| {}));
        assert_eq!(scope.effect_count(), 1);

        scope.dispose();
        assert!(effect.is_disposed());
        assert_eq!(scheduler.flush(Lane::Microtask), 0);
    }

    #[test]
    fn async_effect_cancels_the_previous_run() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let source = Signal::new(0);
        let tokens = Arc::new(Mutex::new(Vec::new()));

        let effect = {
            let (source, tokens) = (source.clone(), tokens.clone());
            Effect::new_async(move |token: CancellationToken| {
                source.get();
                tokens.lock().push(token.clone());
                async move { token.cancelled().await }
            })
        };

        scheduler.run_until_idle();
        source.set(1);
        scheduler.run_until_idle();

        {
            let tokens = tokens.lock();
            assert_eq!(tokens.len(), 2);
            assert!(tokens[0].is_cancelled());
            assert!(!tokens[1].is_cancelled());
        }

        effect.dispose();
        assert!(tokens.lock()[1].is_cancelled());
    }

    #[test]
    fn batched_write_joins_an_already_queued_rerun() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let source = Signal::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let effect = {
            let (source, seen) = (source.clone(), seen.clone());
            Effect::new(move || seen.lock().push(source.get()))
        };
        scheduler.run_until_idle();

        source.set(1);
        scheduler.batch(|| source.set(2));
        assert!(effect.is_scheduled());
        scheduler.run_until_idle();

        assert_eq!(effect.run_count(), 2);
        assert_eq!(*seen.lock(), vec![0, 2]);
    }

    #[test]
    fn batched_rerun_is_skipped_once_the_effect_ran() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let source = Signal::new(0);

        let effect = {
            let source = source.clone();
            Effect::new(move || {
                source.get();
            })
        };
        scheduler.run_until_idle();

        scheduler.batch(|| source.set(1));
        // Something else runs the effect before the batch task drains.
        effect.inner.run();
        scheduler.run_until_idle();

        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn effect_created_in_a_batch_starts_on_the_microtask_lane() {
        let (_host, scheduler) = manual_scheduler();
        let _guard = scheduler.enter();
        let (runs, runs_clone) = counter();

        let effect = scheduler.batch(|| {
            Effect::new(move || {
                runs_clone.fetch_add(1, Ordering::SeqCst);
            })
        });

        assert_eq!(scheduler.pending(Lane::Frame), 0);
        scheduler.flush(Lane::Microtask);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!effect.is_scheduled());
    }
}
