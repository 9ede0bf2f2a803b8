//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computeds and
//! effects. These primitives form the propagation graph the scheduler drives.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (such as a computed or effect), the signal
//! automatically registers that context as a dependent. When the signal is
//! written, all dependents are notified.
//!
//! ## Computeds
//!
//! A Computed is a derived value that caches its result. A write to one of
//! its dependencies only marks it dirty; it re-evaluates on the next read.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that reruns whenever its
//! dependencies change. Reruns never happen inline: they go through the
//! scheduler's microtask lane, or through the active batch.
//!
//! ## Scopes
//!
//! A Scope owns effects and cleanup callbacks and disposes them as a unit.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to automatically
//! detect dependencies. When a signal is read, we check if there is an active
//! tracking context and, if so, register the dependency.
//!
//! The graph holds no strong edges: sources keep `Weak` references to their
//! subscribers and subscribers keep `Weak` references back for teardown.
//! Effects are kept alive by their owning scope.

mod computed;
mod context;
mod effect;
mod scope;
mod signal;
mod subscriber;
mod timing;

pub use computed::{computed, Computed};
pub use context::{untrack, ReactiveContext, MAX_TRACKING_DEPTH};
pub use effect::{effect, effect_async, Effect};
pub use scope::{on_cleanup, Scope};
pub use signal::{readonly, signal, ReadSignal, Readable, Signal};
pub use subscriber::{Listener, Source, SourceId, Subscriber, SubscriberId, Subscription};
pub use timing::{debounce_signal, throttle_signal, DebounceOptions, ThrottleOptions};
