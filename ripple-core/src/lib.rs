//! Ripple Core
//!
//! This crate provides the core runtime for the Ripple reactive UI toolkit.
//! It implements:
//!
//! - Reactive primitives (signals, computeds, effects, scopes)
//! - A cooperative two-lane scheduler with priority fairness quotas
//! - Batching with identity-based deduplication
//! - Time-derived signals (debounce, throttle) and time slicing
//!
//! Rendering, routing and persistence live in the crates that consume this
//! one.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Core reactive primitives and dependency tracking
//! - `scheduler`: Lanes, priorities, batching, timers and host integration
//! - `error`: Error types and the error-handler chain
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use ripple_core::{batch, computed, effect, signal, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let _current = scheduler.enter();
//!
//! // Create a signal
//! let count = signal(1);
//!
//! // Create a derived value
//! let doubled = {
//!     let count = count.clone();
//!     computed(move || count.get() * 2)
//! };
//!
//! // Create an effect
//! let log = Arc::new(Mutex::new(Vec::new()));
//! {
//!     let (count, doubled, log) = (count.clone(), doubled.clone(), log.clone());
//!     effect(move || log.lock().unwrap().push((count.get(), doubled.get())));
//! }
//!
//! // Many writes, one propagation wave.
//! scheduler.run_until_idle();
//! batch(|| {
//!     count.set(5);
//!     count.set(15);
//! });
//! scheduler.run_until_idle();
//!
//! assert_eq!(*log.lock().unwrap(), vec![(1, 2), (15, 30)]);
//! ```

pub mod error;
pub mod reactive;
pub mod scheduler;

pub use error::{
    clear_effect_error_handler, set_effect_error_handler, ErrorHandler, ErrorSource,
    ReactiveError,
};
pub use reactive::{
    computed, debounce_signal, effect, effect_async, on_cleanup, readonly, signal,
    throttle_signal, untrack, Computed, DebounceOptions, Effect, ReadSignal, Readable, Scope,
    Signal, Subscription, ThrottleOptions,
};
pub use scheduler::{
    batch, configure_scheduler, is_batching, measure, mutate, prioritize, queue_in_batch,
    schedule, schedule_after, schedule_microtask, scheduler_config, time_slice,
    with_scheduler_priority, with_scheduler_priority_async, Lane, ManualHost, Priority,
    Scheduler, SchedulerConfig, SchedulerConfigUpdate, TaskHandle, TimeSliceOptions, TokioHost,
};
