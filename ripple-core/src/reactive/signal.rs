//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context (computed/effect), the
//!    signal registers that context as a subscriber.
//!
//! 2. When a signal is written, all subscribers are notified synchronously.
//!    Computeds only mark themselves dirty; effects and listeners defer
//!    their work to the scheduler or the active batch.
//!
//! 3. Writes always notify, even when the new value equals the old one.
//!    [`Signal::set_if_changed`] is the opt-in change-only write.
//!
//! # Thread Safety
//!
//! The value sits behind a `parking_lot::RwLock`; the lock is never held
//! while subscribers run.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

use super::context::ReactiveContext;
use super::subscriber::{
    Listener, Source, SourceId, Subscriber, SubscriberId, SubscriberSet, Subscription,
};

pub(crate) struct SignalInner<T> {
    id: SourceId,
    value: RwLock<T>,
    subscribers: SubscriberSet,
}

impl<T: Send + Sync + 'static> Source for SignalInner<T> {
    fn source_id(&self) -> SourceId {
        self.id
    }

    fn subscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        if self.subscribers.insert(subscriber) {
            trace!(signal = ?self.id, subscriber = %subscriber.subscriber_id(), "subscribed");
        }
    }

    fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.remove(id);
    }
}

impl<T> SignalInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn track(self: &Arc<Self>) {
        if ReactiveContext::is_tracking() {
            ReactiveContext::track(self.clone());
        }
    }

    fn on<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        let listener = Listener::new(move || {
            if let Some(inner) = weak.upgrade() {
                let value = inner.value.read().clone();
                callback(&value);
            }
        });

        let subscriber: Arc<dyn Subscriber> = listener.clone();
        self.subscribers.insert(&subscriber);

        let source: Weak<dyn Source> = Arc::downgrade(self) as Weak<dyn Source>;
        Subscription::new(source, listener)
    }
}

/// A reactive signal holding a value of type T.
///
/// # Type Parameters
///
/// - `T`: The type of value stored in the signal. Must be Clone + Send + Sync.
///
/// # Example
///
/// ```rust
/// use ripple_core::signal;
///
/// let count = signal(0);
///
/// // Read the value
/// assert_eq!(count.get(), 0);
///
/// // Update the value (notifies subscribers)
/// count.set(5);
/// count.update(|n| n + 1);
/// assert_eq!(count.peek(), 6);
/// ```
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id: SourceId::new(),
                value: RwLock::new(value),
                subscribers: SubscriberSet::new(),
            }),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If called within a reactive context, this also registers the
    /// current computation as a subscriber.
    pub fn get(&self) -> T {
        self.inner.track();
        self.inner.value.read().clone()
    }

    /// Borrow the current value, with tracking.
    ///
    /// The value is read-locked while `f` runs, so `f` must not write to
    /// this signal.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.track();
        f(&self.inner.value.read())
    }

    /// Get the current value without tracking dependencies.
    pub fn peek(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Set a new value and notify subscribers.
    pub fn set(&self, value: T) {
        *self.inner.value.write() = value;
        trace!(signal = ?self.inner.id, "signal written");
        self.inner.subscribers.notify_all();
    }

    /// Update the value using a function of the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.inner.value.read());
        self.set(next);
    }

    /// Call `callback` with the new value after every write.
    ///
    /// Inside a batch the callback is deferred to the batch flush and runs
    /// once, with the value current at that point.
    pub fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.on(callback)
    }

    /// Get the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// A read-only view sharing this signal's value.
    pub fn readonly(&self) -> ReadSignal<T> {
        ReadSignal {
            inner: self.inner.clone(),
            _owner: None,
        }
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Write `value` only if it differs from the current one.
    ///
    /// Returns whether the write (and notification) happened.
    pub fn set_if_changed(&self, value: T) -> bool {
        {
            let mut current = self.inner.value.write();
            if *current == value {
                return false;
            }
            *current = value;
        }
        trace!(signal = ?self.inner.id, "signal written");
        self.inner.subscribers.notify_all();
        true
    }
}

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.read())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// A read-only handle to a signal's value. There is no setter.
///
/// Derived signals (debounce, throttle) keep their upstream subscription in
/// the handle; dropping every clone stops the derivation.
pub struct ReadSignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<SignalInner<T>>,
    _owner: Option<Arc<dyn Any + Send + Sync>>,
}

impl<T> ReadSignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn with_owner(signal: &Signal<T>, owner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            inner: signal.inner.clone(),
            _owner: Some(owner),
        }
    }

    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    pub fn get(&self) -> T {
        self.inner.track();
        self.inner.value.read().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.track();
        f(&self.inner.value.read())
    }

    pub fn peek(&self) -> T {
        self.inner.value.read().clone()
    }

    pub fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.on(callback)
    }
}

impl<T> Clone for ReadSignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _owner: self._owner.clone(),
        }
    }
}

impl<T> Debug for ReadSignal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSignal")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.read())
            .finish()
    }
}

/// Anything that can be read reactively.
pub trait Readable<T>: Send + Sync {
    /// Read with tracking.
    fn get(&self) -> T;

    /// Read without tracking.
    fn peek(&self) -> T;

    /// Subscribe a callback to every change.
    fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static;
}

impl<T> Readable<T> for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn get(&self) -> T {
        Signal::get(self)
    }

    fn peek(&self) -> T {
        Signal::peek(self)
    }

    fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Signal::on(self, callback)
    }
}

impl<T> Readable<T> for ReadSignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn get(&self) -> T {
        ReadSignal::get(self)
    }

    fn peek(&self) -> T {
        ReadSignal::peek(self)
    }

    fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        ReadSignal::on(self, callback)
    }
}

/// Create a signal.
pub fn signal<T>(value: T) -> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    Signal::new(value)
}

/// A read-only view of `signal`.
pub fn readonly<T>(signal: &Signal<T>) -> ReadSignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    signal.readonly()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Lane, Scheduler};
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn signal_get_and_set() {
        let signal = Signal::new(0);
        assert_eq!(signal.get(), 0);

        signal.set(42);
        assert_eq!(signal.get(), 42);
    }

    #[test]
    fn signal_update() {
        let signal = Signal::new(10);
        signal.update(|v| v + 5);
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn signal_with_borrows_the_value() {
        let signal = Signal::new(vec![1, 2, 3]);
        assert_eq!(signal.with(|v| v.len()), 3);
    }

    #[test]
    fn signal_notifies_listeners() {
        let signal = Signal::new(0);
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let _sub = signal.on(move |value| {
            call_count_clone.fetch_add(*value, Ordering::SeqCst);
        });

        assert_eq!(call_count.load(Ordering::SeqCst), 0);

        signal.set(1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        signal.set(2);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn set_notifies_even_when_unchanged() {
        let signal = Signal::new(7);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let _sub = signal.on(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(!signal.set_if_changed(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(signal.set_if_changed(8));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn signal_unsubscribe() {
        let signal = Signal::new(0);
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let mut sub = signal.on(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sub.is_active());

        signal.set(1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());

        signal.set(2);
        // Should not have been called again
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let signal = Signal::new(0);
        let sub = signal.on(|_| {});
        assert_eq!(signal.subscriber_count(), 1);

        drop(sub);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn listeners_are_deferred_inside_a_batch() {
        let scheduler = Scheduler::new();
        let _guard = scheduler.enter();

        let signal = Signal::new(0);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = signal.on(move |value| seen_clone.lock().push(*value));

        scheduler.batch(|| {
            signal.set(1);
            signal.set(2);
            signal.set(3);
            assert!(seen.lock().is_empty());
        });

        scheduler.flush(Lane::Frame);
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn signal_clone_shares_state() {
        let signal1 = Signal::new(0);
        let signal2 = signal1.clone();

        signal1.set(42);
        assert_eq!(signal2.get(), 42);

        signal2.set(100);
        assert_eq!(signal1.get(), 100);
    }

    #[test]
    fn readonly_view_follows_writes() {
        let source = signal(String::from("a"));
        let view = readonly(&source);

        source.set("b".into());
        assert_eq!(view.get(), "b");
        assert_eq!(view.peek(), "b");
        assert_eq!(view.id(), source.id());
    }

    #[test]
    fn signal_ids_are_unique() {
        let s1 = Signal::new(0);
        let s2 = Signal::new(0);
        let s3 = Signal::new(0);

        assert_ne!(s1.id(), s2.id());
        assert_ne!(s2.id(), s3.id());
        assert_ne!(s1.id(), s3.id());
    }
}
