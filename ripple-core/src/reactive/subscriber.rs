//! Subscriber and source types for the reactive system.
//!
//! A Subscriber is any computation that depends on reactive values: effects,
//! computeds (through their synthetic subscriber) and manual listeners. A
//! Source is anything a subscriber can depend on: signals and computeds.
//!
//! Sources only hold `Weak` references to their subscribers, and subscribers
//! only hold `Weak` references back to their sources for teardown. The graph
//! itself never keeps a node alive.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{ErrorSource, ReactiveError};
use crate::scheduler::{BatchTask, Scheduler};

/// Unique identifier for a subscriber.
///
/// Each subscriber (computed, effect, or listener) gets a unique ID when
/// created. This ID is used to deduplicate subscriptions and to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Unique identifier for a source (signal or computed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    /// Generate a new unique source ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

/// A computation that is notified when one of its sources is written.
pub trait Subscriber: Send + Sync {
    /// The subscriber's unique ID.
    fn subscriber_id(&self) -> SubscriberId;

    /// Called synchronously, right after a source was written.
    ///
    /// Implementations must not run user code that reads the notifying
    /// source inline; effects defer to the scheduler, computeds only flip a
    /// flag.
    fn notify(&self);
}

/// A reactive value that subscribers can depend on.
pub trait Source: Send + Sync {
    /// The source's unique ID.
    fn source_id(&self) -> SourceId;

    /// Add a subscriber. Subscribing twice is a no-op.
    fn subscribe(&self, subscriber: &Arc<dyn Subscriber>);

    /// Remove a subscriber. Unknown IDs are ignored.
    fn unsubscribe(&self, id: SubscriberId);
}

/// The subscriber set shared by signals and computeds.
///
/// Insertion-ordered, so notification order follows subscription order.
#[derive(Default)]
pub(crate) struct SubscriberSet {
    entries: Mutex<IndexMap<SubscriberId, Weak<dyn Subscriber>>>,
}

impl SubscriberSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the subscriber was already present.
    pub(crate) fn insert(&self, subscriber: &Arc<dyn Subscriber>) -> bool {
        let mut entries = self.entries.lock();
        let id = subscriber.subscriber_id();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(id, Arc::downgrade(subscriber));
        true
    }

    pub(crate) fn remove(&self, id: SubscriberId) -> bool {
        self.entries.lock().shift_remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.len()
    }

    /// Notify every live subscriber.
    ///
    /// The set is snapshotted first and the lock released, so subscribers may
    /// freely unsubscribe or resubscribe while being notified.
    pub(crate) fn notify_all(&self) {
        let live: SmallVec<[Arc<dyn Subscriber>; 4]> = {
            let mut entries = self.entries.lock();
            entries.retain(|_, weak| weak.strong_count() > 0);
            entries.values().filter_map(Weak::upgrade).collect()
        };

        for subscriber in live {
            subscriber.notify();
        }
    }
}

/// A subscriber backed by a plain callback.
///
/// Listeners back the manual `on(cb)` subscriptions. Outside a batch the
/// callback runs synchronously on notification; inside a batch it is queued
/// once (by identity) and runs with the batch flush.
pub struct Listener {
    id: SubscriberId,
    task: BatchTask,
}

impl Listener {
    /// Create a new listener with the given notification callback.
    pub fn new<F>(notify: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = SubscriberId::new();
        let task: BatchTask = Arc::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(&notify)) {
                Scheduler::current()
                    .report(ReactiveError::panicked(&*payload), ErrorSource::Listener(id));
            }
        });
        Arc::new(Self { id, task })
    }

    /// Get the listener's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

impl Subscriber for Listener {
    fn subscriber_id(&self) -> SubscriberId {
        self.id
    }

    fn notify(&self) {
        let scheduler = Scheduler::current();
        if scheduler.is_batching() {
            scheduler.queue_in_batch(&self.task);
        } else {
            (self.task)();
        }
    }
}

/// Handle to a manual subscription created by `on`.
///
/// Dropping the handle unsubscribes. [`Subscription::unsubscribe`] is
/// idempotent.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    inner: Option<(Weak<dyn Source>, Arc<Listener>)>,
}

impl Subscription {
    pub(crate) fn new(source: Weak<dyn Source>, listener: Arc<Listener>) -> Self {
        Self {
            inner: Some((source, listener)),
        }
    }

    /// Stop receiving notifications. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some((source, listener)) = self.inner.take() {
            if let Some(source) = source.upgrade() {
                source.unsubscribe(listener.id());
            }
        }
    }

    /// Whether the subscription is still live.
    pub fn is_active(&self) -> bool {
        self.inner
            .as_ref()
            .map(|(source, _)| source.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Keep the callback subscribed for as long as the source lives.
    pub fn detach(mut self) {
        if let Some(inner) = self.inner.take() {
            std::mem::forget(inner);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn listener_notify_calls_callback() {
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let listener = Listener::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        listener.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_set_is_idempotent() {
        let set = SubscriberSet::new();
        let listener: Arc<dyn Subscriber> = Listener::new(|| {});

        assert!(set.insert(&listener));
        assert!(!set.insert(&listener));
        assert_eq!(set.len(), 1);

        assert!(set.remove(listener.subscriber_id()));
        assert!(!set.remove(listener.subscriber_id()));
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn subscriber_set_prunes_dropped_subscribers() {
        let set = SubscriberSet::new();
        let calls = Arc::new(AtomicI32::new(0));

        let kept: Arc<dyn Subscriber> = {
            let calls = calls.clone();
            Listener::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let dropped: Arc<dyn Subscriber> = {
            let calls = calls.clone();
            Listener::new(move || {
                calls.fetch_add(100, Ordering::SeqCst);
            })
        };

        set.insert(&kept);
        set.insert(&dropped);
        drop(dropped);

        set.notify_all();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 1);
    }
}
