//! Ownership scopes.
//!
//! A scope owns effects, child scopes and cleanup callbacks. Disposing a
//! scope tears all of them down: children first, then effects, then
//! cleanups in reverse registration order.
//!
//! Effects register with the scope that is current when they are created.
//! Outside any explicit scope that is the thread's root scope, which lives
//! as long as the thread.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::effect::Effect;
use super::subscriber::SubscriberId;
use crate::error::{ErrorSource, ReactiveError};
use crate::scheduler::Scheduler;

type Cleanup = Box<dyn FnOnce() + Send>;

pub(crate) struct ScopeInner {
    id: u64,
    disposed: AtomicBool,
    effects: Mutex<Vec<Effect>>,
    children: Mutex<Vec<Scope>>,
    cleanups: Mutex<Vec<Cleanup>>,
    parent: Option<Weak<ScopeInner>>,
}

impl ScopeInner {
    fn new(parent: Option<Weak<ScopeInner>>) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            disposed: AtomicBool::new(false),
            effects: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
            parent,
        }
    }

    /// Dispose everything owned so far. The scope itself stays usable.
    fn clear(&self) {
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            child.dispose();
        }

        let effects = std::mem::take(&mut *self.effects.lock());
        for effect in effects {
            effect.dispose();
        }

        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups.into_iter().rev() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cleanup)) {
                Scheduler::current().report(ReactiveError::panicked(&*payload), ErrorSource::Cleanup);
            }
        }
    }

    fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!(scope = self.id, "disposing scope");
        self.clear();
        true
    }

    /// Forget an effect that disposed itself.
    pub(crate) fn release(&self, id: SubscriberId) {
        self.effects.lock().retain(|effect| effect.id() != id);
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

thread_local! {
    static ROOT: Scope = Scope::detached();
    static SCOPE_STACK: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
}

struct ScopeEntry {
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeEntry {
    fn drop(&mut self) {
        SCOPE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// A disposal-cascade container for effects and cleanups.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Create a scope owned by the current scope.
    pub fn new() -> Self {
        let parent = Scope::current();
        let scope = Self {
            inner: Arc::new(ScopeInner::new(Some(Arc::downgrade(&parent.inner)))),
        };

        if parent.is_disposed() {
            scope.dispose();
        } else {
            parent.inner.children.lock().push(scope.clone());
        }
        scope
    }

    /// Create a scope with no parent. It is disposed when the last handle
    /// is dropped, if not before.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(ScopeInner::new(None)),
        }
    }

    /// The scope new effects register with on this thread.
    pub fn current() -> Self {
        SCOPE_STACK
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(|| ROOT.with(Clone::clone))
    }

    /// Run `f` with this scope current.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        SCOPE_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        let _entry = ScopeEntry {
            _not_send: PhantomData,
        };
        f()
    }

    /// Register a callback for disposal. On an already disposed scope it
    /// runs immediately.
    pub fn on_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_disposed() {
            cleanup();
            return;
        }
        self.inner.cleanups.lock().push(Box::new(cleanup));
    }

    /// Dispose children, effects and cleanups, then detach from the parent.
    /// Idempotent.
    pub fn dispose(&self) {
        if !self.inner.dispose() {
            return;
        }
        if let Some(parent) = self.inner.parent.as_ref().and_then(Weak::upgrade) {
            parent
                .children
                .lock()
                .retain(|child| !Arc::ptr_eq(&child.inner, &self.inner));
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn effect_count(&self) -> usize {
        self.inner.effects.lock().len()
    }

    pub fn child_count(&self) -> usize {
        self.inner.children.lock().len()
    }

    /// Dispose what the scope owns but keep it open. Used between effect runs.
    pub(crate) fn reset(&self) {
        self.inner.clear();
    }

    /// Take ownership of `effect`. A disposed scope disposes it right away.
    pub(crate) fn adopt(&self, effect: Effect) {
        if self.is_disposed() {
            effect.dispose();
            return;
        }
        self.inner.effects.lock().push(effect);
    }

    pub(crate) fn downgrade(&self) -> Weak<ScopeInner> {
        Arc::downgrade(&self.inner)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("disposed", &self.is_disposed())
            .field("effects", &self.effect_count())
            .field("children", &self.child_count())
            .finish()
    }
}

/// Register a cleanup on the current scope.
///
/// Inside an effect body the cleanup runs before the effect's next run and
/// when the effect is disposed.
pub fn on_cleanup<F>(cleanup: F)
where
    F: FnOnce() + Send + 'static,
{
    Scope::current().on_cleanup(cleanup);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_on_cleanup(scope: &Scope, log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) {
        let log = log.clone();
        scope.on_cleanup(move || log.lock().push(label));
    }

    #[test]
    fn cleanups_run_in_reverse_order_once() {
        let scope = Scope::detached();
        let log = Arc::new(Mutex::new(Vec::new()));

        push_on_cleanup(&scope, &log, "first");
        push_on_cleanup(&scope, &log, "second");

        scope.dispose();
        scope.dispose();

        assert_eq!(*log.lock(), vec!["second", "first"]);
        assert!(scope.is_disposed());
    }

    #[test]
    fn children_are_disposed_before_own_cleanups() {
        let parent = Scope::detached();
        let log = Arc::new(Mutex::new(Vec::new()));

        push_on_cleanup(&parent, &log, "parent");
        let child = parent.run(Scope::new);
        push_on_cleanup(&child, &log, "child");
        assert_eq!(parent.child_count(), 1);

        parent.dispose();
        assert!(child.is_disposed());
        assert_eq!(*log.lock(), vec!["child", "parent"]);
    }

    #[test]
    fn disposed_child_detaches_from_parent() {
        let parent = Scope::detached();
        let child = parent.run(Scope::new);

        child.dispose();
        assert_eq!(parent.child_count(), 0);
        assert!(!parent.is_disposed());
    }

    #[test]
    fn run_restores_the_previous_scope() {
        let outer = Scope::detached();
        let inner = Scope::detached();

        outer.run(|| {
            inner.run(|| {
                assert!(Arc::ptr_eq(&Scope::current().inner, &inner.inner));
            });
            assert!(Arc::ptr_eq(&Scope::current().inner, &outer.inner));
        });
    }

    #[test]
    fn cleanup_on_disposed_scope_runs_immediately() {
        let scope = Scope::detached();
        scope.dispose();

        let log = Arc::new(Mutex::new(Vec::new()));
        push_on_cleanup(&scope, &log, "late");
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn panicking_cleanup_is_reported_and_others_still_run() {
        let scheduler = Scheduler::new();
        let _guard = scheduler.enter();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let reported_clone = reported.clone();
        scheduler.set_error_handler(move |_, source| reported_clone.lock().push(source));

        let scope = Scope::detached();
        let log = Arc::new(Mutex::new(Vec::new()));
        push_on_cleanup(&scope, &log, "survivor");
        scope.on_cleanup(|| panic!("cleanup failed"));

        scope.dispose();
        assert_eq!(*log.lock(), vec!["survivor"]);
        assert_eq!(*reported.lock(), vec![ErrorSource::Cleanup]);
    }

    #[test]
    fn dropping_a_detached_scope_disposes_it() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let scope = Scope::detached();
            push_on_cleanup(&scope, &log, "dropped");
        }
        assert_eq!(*log.lock(), vec!["dropped"]);
    }
}
