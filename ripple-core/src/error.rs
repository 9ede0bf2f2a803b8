//! Error Types and Reporting
//!
//! Failures inside the reactive graph are local to one node. A panicking
//! effect body, a runaway requeue loop or a cyclic computed never tears the
//! whole graph down; instead the failure is turned into a [`ReactiveError`]
//! and handed to an error handler together with an [`ErrorSource`].
//!
//! Handlers are resolved in this order:
//!
//! 1. the handler installed on the [`Scheduler`](crate::scheduler::Scheduler)
//!    that owns the failing node,
//! 2. the process-wide handler installed with [`set_effect_error_handler`],
//! 3. a default that logs through `tracing::error!`.

use std::any::Any;
use std::fmt;
use std::panic;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::reactive::SubscriberId;
use crate::scheduler::Lane;

/// Errors produced by the reactive core and the scheduler.
#[derive(Debug, Error)]
pub enum ReactiveError {
    /// A user callback panicked.
    #[error("callback panicked: {message}")]
    Panicked { message: String },

    /// A computed was read while it was already being evaluated.
    #[error("cycle detected: computed {id} was read while it was being evaluated")]
    Cycle { id: SubscriberId },

    /// Too many nested evaluations were active at once.
    #[error("tracking depth exceeded {limit} nested evaluations")]
    DepthExceeded { limit: usize },

    /// A lane kept requeueing work past its configured iteration cap.
    #[error("{lane} lane exceeded {limit} drain passes; discarded {discarded} queued tasks")]
    SchedulerOverflow {
        lane: Lane,
        limit: usize,
        discarded: usize,
    },

    /// A time-slice budget was negative or not finite.
    #[error("invalid time budget: {0} ms (must be finite and non-negative)")]
    InvalidBudget(f64),

    /// A scheduler configuration value was out of range.
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),

    /// A scheduler configuration document could not be parsed.
    #[error("failed to parse scheduler config: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl ReactiveError {
    /// Build an error from a caught panic payload.
    ///
    /// If the panic was raised by a failing reactive read (a cycle or the
    /// depth cap), the structural error is returned instead of
    /// [`ReactiveError::Panicked`].
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        match payload.downcast_ref::<Raised>() {
            Some(Raised(Self::Cycle { id })) => Self::Cycle { id: *id },
            Some(Raised(Self::DepthExceeded { limit })) => Self::DepthExceeded { limit: *limit },
            _ => Self::Panicked {
                message: panic_message(payload),
            },
        }
    }

    /// Whether this error comes from the shape of the graph rather than from
    /// user code.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Cycle { .. } | Self::DepthExceeded { .. })
    }
}

/// Panic payload carrying an error out of a failing reactive read.
struct Raised(ReactiveError);

/// Unwind out of a reactive read with `error` as the panic payload.
pub(crate) fn raise(error: ReactiveError) -> ! {
    panic::panic_any(Raised(error))
}

/// Identifies where a reported error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    /// An effect body (sync or async).
    Effect(SubscriberId),
    /// A computed body.
    Computed(SubscriberId),
    /// A manual `on` listener.
    Listener(SubscriberId),
    /// A plain task drained from a lane.
    Task(Lane),
    /// A delayed task fired by the timer queue.
    Timer,
    /// A scope cleanup callback.
    Cleanup,
    /// The lane itself (iteration cap overflow).
    Scheduler(Lane),
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Effect(id) => write!(f, "effect {id}"),
            Self::Computed(id) => write!(f, "computed {id}"),
            Self::Listener(id) => write!(f, "listener {id}"),
            Self::Task(lane) => write!(f, "{lane} task"),
            Self::Timer => f.write_str("timer"),
            Self::Cleanup => f.write_str("cleanup"),
            Self::Scheduler(lane) => write!(f, "{lane} lane"),
        }
    }
}

/// A shared error handler callback.
pub type ErrorHandler = Arc<dyn Fn(&ReactiveError, ErrorSource) + Send + Sync>;

static GLOBAL_HANDLER: RwLock<Option<ErrorHandler>> = RwLock::new(None);

/// Install the process-wide error handler.
///
/// Returns the previously installed handler, if any. Schedulers with their
/// own handler (see `Scheduler::set_error_handler`) take precedence.
pub fn set_effect_error_handler<F>(handler: F) -> Option<ErrorHandler>
where
    F: Fn(&ReactiveError, ErrorSource) + Send + Sync + 'static,
{
    GLOBAL_HANDLER.write().replace(Arc::new(handler))
}

/// Remove the process-wide error handler, returning it.
pub fn clear_effect_error_handler() -> Option<ErrorHandler> {
    GLOBAL_HANDLER.write().take()
}

pub(crate) fn global_handler() -> Option<ErrorHandler> {
    GLOBAL_HANDLER.read().clone()
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(Raised(error)) = payload.downcast_ref::<Raised>() {
        error.to_string()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_handles_str_and_string() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }

    #[test]
    fn raised_errors_survive_the_unwind() {
        let id = SubscriberId::new();
        let payload = std::panic::catch_unwind(|| {
            raise(ReactiveError::Cycle { id });
        })
        .unwrap_err();

        let err = ReactiveError::panicked(&*payload);
        assert!(matches!(err, ReactiveError::Cycle { id: got } if got == id));
        assert!(err.is_structural());

        // Reading the payload twice gives the same error.
        let again = ReactiveError::panicked(&*payload);
        assert!(matches!(again, ReactiveError::Cycle { id: got } if got == id));
    }

    #[test]
    fn swallowed_raise_does_not_leak_into_later_panics() {
        let id = SubscriberId::new();
        let _ = std::panic::catch_unwind(|| {
            raise(ReactiveError::Cycle { id });
        });

        let payload = std::panic::catch_unwind(|| {
            panic!("unrelated");
        })
        .unwrap_err();
        let err = ReactiveError::panicked(&*payload);
        assert_eq!(err.to_string(), "callback panicked: unrelated");
    }

    #[test]
    fn raised_payload_carries_the_error_message() {
        let payload = std::panic::catch_unwind(|| {
            raise(ReactiveError::DepthExceeded { limit: 512 });
        })
        .unwrap_err();

        assert_eq!(
            panic_message(&*payload),
            "tracking depth exceeded 512 nested evaluations"
        );
    }

    #[test]
    fn overflow_message_names_the_lane() {
        let err = ReactiveError::SchedulerOverflow {
            lane: Lane::Microtask,
            limit: 2,
            discarded: 1,
        };
        assert_eq!(
            err.to_string(),
            "microtask lane exceeded 2 drain passes; discarded 1 queued tasks"
        );
    }

    #[test]
    fn config_parse_converts_from_serde() {
        let parse_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: ReactiveError = parse_err.into();
        assert!(matches!(err, ReactiveError::ConfigParse(_)));
    }
}
