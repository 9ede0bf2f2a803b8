//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computeds Work
//!
//! 1. On first access, the computed runs its function under a tracking
//!    context and caches the result.
//!
//! 2. When accessed again and nothing changed, the cached value is returned.
//!
//! 3. When a dependency is written, the computed is marked dirty right away
//!    and forwards the invalidation to its own subscribers, once per
//!    evaluation. A failed evaluation still re-arms forwarding.
//!
//! 4. On next access, it tears down the old subscriptions, recomputes and
//!    subscribes to whatever the new run read.
//!
//! A computed that is never read again never recomputes.
//!
//! # Failures
//!
//! Reading a computed from inside its own evaluation is a cycle and fails
//! with [`ReactiveError::Cycle`]. A panic in the user function is reported
//! and the stale value returned if one is cached; otherwise the panic
//! propagates to the reader.

use std::fmt::{self, Debug};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::context::{ReactiveContext, SourceList};
use super::subscriber::{
    Listener, Source, SourceId, Subscriber, SubscriberId, SubscriberSet, Subscription,
};
use crate::error::{self, ErrorSource, ReactiveError};
use crate::scheduler::Scheduler;

struct ComputedInner<T> {
    subscriber_id: SubscriberId,
    source_id: SourceId,
    compute: Box<dyn Fn() -> T + Send + Sync>,
    value: RwLock<Option<T>>,
    dirty: AtomicBool,
    /// Invalidation was forwarded since the last evaluation started.
    notified: AtomicBool,
    evaluating: AtomicBool,
    sources: Mutex<SourceList>,
    subscribers: SubscriberSet,
}

impl<T> Subscriber for ComputedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    fn notify(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        if !self.notified.swap(true, Ordering::SeqCst) {
            trace!(computed = %self.subscriber_id, "computed invalidated");
            self.subscribers.notify_all();
        }
    }
}

impl<T> Source for ComputedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn subscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        self.subscribers.insert(subscriber);
    }

    fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.remove(id);
    }
}

struct EvaluatingGuard<'a>(&'a AtomicBool);

impl Drop for EvaluatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T> ComputedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn track(self: &Arc<Self>) {
        if ReactiveContext::is_tracking() {
            ReactiveContext::track(self.clone());
        }
    }

    fn teardown(&self) {
        let sources = std::mem::take(&mut *self.sources.lock());
        for source in sources.iter().filter_map(Weak::upgrade) {
            source.unsubscribe(self.subscriber_id);
        }
    }

    /// Return the cached value, recomputing first if dirty.
    fn evaluate(self: &Arc<Self>) -> Result<T, ReactiveError> {
        if !self.dirty.load(Ordering::SeqCst) {
            if let Some(value) = self.value.read().clone() {
                return Ok(value);
            }
        }

        if self.evaluating.swap(true, Ordering::SeqCst) {
            return Err(ReactiveError::Cycle {
                id: self.subscriber_id,
            });
        }
        let _evaluating = EvaluatingGuard(&self.evaluating);

        let observer: Arc<dyn Subscriber> = self.clone();
        let ctx = ReactiveContext::enter(observer)?;
        self.teardown();
        self.dirty.store(false, Ordering::SeqCst);
        self.notified.store(false, Ordering::SeqCst);

        trace!(computed = %self.subscriber_id, "recomputing");
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.compute)()));

        *self.sources.lock() = ctx.take_sources();
        drop(ctx);

        match result {
            Ok(value) => {
                *self.value.write() = Some(value.clone());
                Ok(value)
            }
            Err(payload) => {
                // Retry on the next read.
                self.dirty.store(true, Ordering::SeqCst);

                let error = ReactiveError::panicked(&*payload);
                if error.is_structural() {
                    return Err(error);
                }

                let stale = self.value.read().clone();
                match stale {
                    Some(value) => {
                        Scheduler::current()
                            .report(error, ErrorSource::Computed(self.subscriber_id));
                        Ok(value)
                    }
                    None => panic::resume_unwind(payload),
                }
            }
        }
    }
}

/// A cached derived value that recomputes only when dependencies change.
///
/// # Example
///
/// ```rust
/// use ripple_core::{computed, signal};
///
/// let price = signal(10);
/// let quantity = signal(3);
///
/// let total = {
///     let (price, quantity) = (price.clone(), quantity.clone());
///     computed(move || price.get() * quantity.get())
/// };
///
/// assert_eq!(total.get(), 30);
/// quantity.set(4);
/// assert!(total.is_dirty());
/// assert_eq!(total.get(), 40);
/// ```
pub struct Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<ComputedInner<T>>,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new computed with the given function.
    ///
    /// The function is not run immediately. It runs on first access.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ComputedInner {
                subscriber_id: SubscriberId::new(),
                source_id: SourceId::new(),
                compute: Box::new(compute),
                value: RwLock::new(None),
                dirty: AtomicBool::new(true),
                notified: AtomicBool::new(false),
                evaluating: AtomicBool::new(false),
                sources: Mutex::new(SourceList::new()),
                subscribers: SubscriberSet::new(),
            }),
        }
    }

    /// Get the subscriber ID used for dependency tracking.
    pub fn subscriber_id(&self) -> SubscriberId {
        self.inner.subscriber_id
    }

    /// Get the ID dependents see this computed under.
    pub fn id(&self) -> SourceId {
        self.inner.source_id
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// # Panics
    ///
    /// Panics with the error message if [`Computed::try_get`] fails.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => error::raise(err),
        }
    }

    /// Get the current value, reporting cycles and runaway nesting as errors.
    pub fn try_get(&self) -> Result<T, ReactiveError> {
        self.inner.track();
        self.inner.evaluate()
    }

    /// Like [`Computed::get`] without tracking. Still recomputes if dirty.
    pub fn peek(&self) -> T {
        match self.try_peek() {
            Ok(value) => value,
            Err(err) => error::raise(err),
        }
    }

    pub fn try_peek(&self) -> Result<T, ReactiveError> {
        self.inner.evaluate()
    }

    /// Whether the next read will recompute.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Check if the computed has a cached value.
    pub fn has_value(&self) -> bool {
        self.inner.value.read().is_some()
    }

    /// Number of sources read by the last evaluation.
    pub fn dependency_count(&self) -> usize {
        self.inner.sources.lock().len()
    }

    /// Get the number of dependents.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Call `callback` with the recomputed value whenever it is invalidated.
    pub fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let listener = Listener::new(move || {
            if let Some(inner) = weak.upgrade() {
                match inner.evaluate() {
                    Ok(value) => callback(&value),
                    Err(err) => error::raise(err),
                }
            }
        });

        let subscriber: Arc<dyn Subscriber> = listener.clone();
        self.inner.subscribers.insert(&subscriber);

        let source: Weak<dyn Source> = Arc::downgrade(&self.inner) as Weak<dyn Source>;
        Subscription::new(source, listener)
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.subscriber_id)
            .field("dirty", &self.is_dirty())
            .field("has_value", &self.has_value())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl<T> super::Readable<T> for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn get(&self) -> T {
        Computed::get(self)
    }

    fn peek(&self) -> T {
        Computed::peek(self)
    }

    fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Computed::on(self, callback)
    }
}

/// Create a computed.
pub fn computed<T, F>(compute: F) -> Computed<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    Computed::new(compute)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
