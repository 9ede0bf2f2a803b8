//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a signal is read,
//! the current computation is subscribed to it.
//!
//! # Implementation
//!
//! We use a thread-local stack to track the currently executing computation.
//! Entering a context (running a computed or effect, or an `untrack` block)
//! pushes an entry; the returned guard pops it when dropped, so the stack
//! stays balanced on every exit path, including unwinding.
//!
//! An entry without an observer is an untracked frame: reads inside it do
//! not subscribe anything, even if an outer frame is tracking.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use super::subscriber::{Source, SourceId, Subscriber, SubscriberId};
use crate::error::ReactiveError;

/// Maximum number of nested evaluations on one thread.
///
/// Deep computed chains beyond this are reported as
/// [`ReactiveError::DepthExceeded`] instead of overflowing the stack.
pub const MAX_TRACKING_DEPTH: usize = 512;

/// Sources collected during one evaluation.
pub(crate) type SourceList = SmallVec<[Weak<dyn Source>; 4]>;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the reactive context stack.
struct ContextEntry {
    /// The computation collecting dependencies, `None` for untracked frames.
    observer: Option<Arc<dyn Subscriber>>,
    /// Sources read during this evaluation, in first-read order.
    sources: SourceList,
    seen: SmallVec<[SourceId; 4]>,
}

/// Guard that pops the context when dropped.
///
/// This ensures the context stack is properly maintained even if
/// the computation panics.
#[must_use = "the context is exited as soon as the guard is dropped"]
pub struct ReactiveContext {
    depth: usize,
    subscriber_id: Option<SubscriberId>,
    _not_send: PhantomData<*const ()>,
}

impl ReactiveContext {
    /// Enter a new tracking context for the given subscriber.
    ///
    /// While the guard is alive, every source that is read subscribes the
    /// observer and is recorded for [`ReactiveContext::take_sources`].
    pub fn enter(observer: Arc<dyn Subscriber>) -> Result<Self, ReactiveError> {
        let subscriber_id = observer.subscriber_id();
        let depth = CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() >= MAX_TRACKING_DEPTH {
                return Err(ReactiveError::DepthExceeded {
                    limit: MAX_TRACKING_DEPTH,
                });
            }
            stack.push(ContextEntry {
                observer: Some(observer),
                sources: SmallVec::new(),
                seen: SmallVec::new(),
            });
            Ok(stack.len())
        })?;

        Ok(Self {
            depth,
            subscriber_id: Some(subscriber_id),
            _not_send: PhantomData,
        })
    }

    /// Enter an untracked frame.
    pub fn untracked() -> Self {
        let depth = CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(ContextEntry {
                observer: None,
                sources: SmallVec::new(),
                seen: SmallVec::new(),
            });
            stack.len()
        });

        Self {
            depth,
            subscriber_id: None,
            _not_send: PhantomData,
        }
    }

    /// Check if reads would currently be tracked.
    pub fn is_tracking() -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|entry| entry.observer.is_some())
                .unwrap_or(false)
        })
    }

    /// Get the current subscriber ID, if reads are being tracked.
    pub fn current_subscriber() -> Option<SubscriberId> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .and_then(|entry| entry.observer.as_ref())
                .map(|observer| observer.subscriber_id())
        })
    }

    /// Number of active frames on this thread.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }

    /// Record a read of `source` in the current frame.
    ///
    /// Subscribes the current observer the first time a source is seen in a
    /// frame; later reads of the same source are free.
    pub fn track(source: Arc<dyn Source>) {
        let observer = CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let entry = stack.last_mut()?;
            let observer = entry.observer.clone()?;
            let id = source.source_id();
            if entry.seen.contains(&id) {
                return None;
            }
            entry.seen.push(id);
            entry.sources.push(Arc::downgrade(&source));
            Some(observer)
        });

        // Subscribe outside the stack borrow.
        if let Some(observer) = observer {
            source.subscribe(&observer);
        }
    }

    /// Take the sources collected so far in this guard's frame.
    pub(crate) fn take_sources(&self) -> SourceList {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.get_mut(self.depth - 1) {
                Some(entry) => std::mem::take(&mut entry.sources),
                None => SourceList::new(),
            }
        })
    }

    /// Get the number of sources collected in this guard's frame.
    pub fn dependency_count(&self) -> usize {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .get(self.depth - 1)
                .map(|entry| entry.sources.len())
                .unwrap_or(0)
        })
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();

            // Verify we're popping the right context.
            debug_assert_eq!(
                stack.len(),
                self.depth,
                "ReactiveContext dropped out of order for {:?}",
                self.subscriber_id
            );
            stack.truncate(self.depth - 1);
        });
    }
}

/// Run `f` without tracking any reads.
///
/// Reads inside `f` never subscribe the surrounding effect or computed.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _frame = ReactiveContext::untracked();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::subscriber::{Listener, SubscriberSet};

    struct FakeSource {
        id: SourceId,
        subscribers: SubscriberSet,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: SourceId::new(),
                subscribers: SubscriberSet::new(),
            })
        }
    }

    impl Source for FakeSource {
        fn source_id(&self) -> SourceId {
            self.id
        }

        fn subscribe(&self, subscriber: &Arc<dyn Subscriber>) {
            self.subscribers.insert(subscriber);
        }

        fn unsubscribe(&self, id: SubscriberId) {
            self.subscribers.remove(id);
        }
    }

    #[test]
    fn context_tracks_subscriber() {
        let observer: Arc<dyn Subscriber> = Listener::new(|| {});
        let id = observer.subscriber_id();

        assert!(!ReactiveContext::is_tracking());
        assert!(ReactiveContext::current_subscriber().is_none());

        {
            let _ctx = ReactiveContext::enter(observer).unwrap();

            assert!(ReactiveContext::is_tracking());
            assert_eq!(ReactiveContext::current_subscriber(), Some(id));
        }

        // Context should be cleaned up after drop
        assert!(!ReactiveContext::is_tracking());
        assert_eq!(ReactiveContext::depth(), 0);
    }

    #[test]
    fn context_tracks_dependencies_once() {
        let observer: Arc<dyn Subscriber> = Listener::new(|| {});
        let a = FakeSource::new();
        let b = FakeSource::new();

        let ctx = ReactiveContext::enter(observer).unwrap();
        ReactiveContext::track(a.clone());
        ReactiveContext::track(b.clone());
        ReactiveContext::track(a.clone());

        assert_eq!(ctx.dependency_count(), 2);
        assert_eq!(a.subscribers.len(), 1);
        assert_eq!(b.subscribers.len(), 1);

        let sources = ctx.take_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(ctx.dependency_count(), 0);
    }

    #[test]
    fn nested_contexts() {
        let outer: Arc<dyn Subscriber> = Listener::new(|| {});
        let inner: Arc<dyn Subscriber> = Listener::new(|| {});
        let outer_id = outer.subscriber_id();
        let inner_id = inner.subscriber_id();

        {
            let _ctx1 = ReactiveContext::enter(outer).unwrap();
            assert_eq!(ReactiveContext::current_subscriber(), Some(outer_id));

            {
                let _ctx2 = ReactiveContext::enter(inner).unwrap();
                assert_eq!(ReactiveContext::current_subscriber(), Some(inner_id));
            }

            // After inner context drops, outer should be current
            assert_eq!(ReactiveContext::current_subscriber(), Some(outer_id));
        }

        assert!(ReactiveContext::current_subscriber().is_none());
    }

    #[test]
    fn untracked_frame_hides_outer_observer() {
        let observer: Arc<dyn Subscriber> = Listener::new(|| {});
        let source = FakeSource::new();

        let ctx = ReactiveContext::enter(observer).unwrap();
        untrack(|| {
            assert!(!ReactiveContext::is_tracking());
            ReactiveContext::track(source.clone());
        });

        assert!(ReactiveContext::is_tracking());
        assert_eq!(ctx.dependency_count(), 0);
        assert_eq!(source.subscribers.len(), 0);
    }

    #[test]
    fn context_is_restored_after_panic() {
        let observer: Arc<dyn Subscriber> = Listener::new(|| {});

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _ctx = ReactiveContext::enter(observer).unwrap();
            panic!("boom");
        }));

        assert!(result.is_err());
        assert_eq!(ReactiveContext::depth(), 0);
    }
}
