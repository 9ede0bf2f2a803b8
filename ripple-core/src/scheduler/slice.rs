//! Cooperative time slicing for long loops.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ReactiveError;

/// Default time slice, in milliseconds.
pub const DEFAULT_SLICE_BUDGET_MS: f64 = 8.0;

#[derive(Debug, Clone, Default)]
pub struct TimeSliceOptions {
    /// Milliseconds of work between yields. Defaults to
    /// [`DEFAULT_SLICE_BUDGET_MS`].
    pub budget_ms: Option<f64>,
    /// Stop early once cancelled.
    pub cancellation_token: Option<CancellationToken>,
}

/// How a [`time_slice`] run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    Completed { processed: usize, yields: usize },
    Cancelled { processed: usize, yields: usize },
}

impl SliceOutcome {
    pub fn processed(&self) -> usize {
        match *self {
            Self::Completed { processed, .. } | Self::Cancelled { processed, .. } => processed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Apply `f` to every item, yielding to the executor whenever the budget is
/// used up.
///
/// The budget is validated before anything runs. Cancellation is checked
/// before each item and ends the run with [`SliceOutcome::Cancelled`].
pub fn time_slice<I, F>(
    items: I,
    mut f: F,
    options: TimeSliceOptions,
) -> Result<impl Future<Output = SliceOutcome>, ReactiveError>
where
    I: IntoIterator,
    F: FnMut(I::Item),
{
    let budget_ms = options.budget_ms.unwrap_or(DEFAULT_SLICE_BUDGET_MS);
    if !budget_ms.is_finite() || budget_ms < 0.0 {
        return Err(ReactiveError::InvalidBudget(budget_ms));
    }
    let budget = Duration::from_secs_f64(budget_ms / 1000.0);
    let token = options.cancellation_token;
    let items = items.into_iter();

    Ok(async move {
        let mut processed = 0;
        let mut yields = 0;
        let mut slice_start = Instant::now();

        for item in items {
            if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                debug!(processed, yields, "time slice cancelled");
                return SliceOutcome::Cancelled { processed, yields };
            }

            f(item);
            processed += 1;

            if slice_start.elapsed() >= budget {
                tokio::task::yield_now().await;
                yields += 1;
                slice_start = Instant::now();
            }
        }

        SliceOutcome::Completed { processed, yields }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_budgets() {
        for budget in [-1.0, f64::NAN, f64::INFINITY] {
            let result = time_slice(
                0..3,
                |_| {},
                TimeSliceOptions {
                    budget_ms: Some(budget),
                    ..Default::default()
                },
            );
            assert!(matches!(result, Err(ReactiveError::InvalidBudget(_))));
        }
    }

    #[tokio::test]
    async fn processes_every_item() {
        let mut seen = Vec::new();
        let outcome = time_slice(0..100, |i| seen.push(i), TimeSliceOptions::default())
            .unwrap()
            .await;

        assert_eq!(outcome.processed(), 100);
        assert!(!outcome.is_cancelled());
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn zero_budget_yields_after_every_item() {
        let outcome = time_slice(
            0..5,
            |_| {},
            TimeSliceOptions {
                budget_ms: Some(0.0),
                ..Default::default()
            },
        )
        .unwrap()
        .await;

        assert_eq!(
            outcome,
            SliceOutcome::Completed {
                processed: 5,
                yields: 5
            }
        );
    }

    #[tokio::test]
    async fn stops_early_when_cancelled() {
        let token = CancellationToken::new();
        let cancel = token.clone();

        let outcome = time_slice(
            0..10,
            move |i| {
                if i == 3 {
                    cancel.cancel();
                }
            },
            TimeSliceOptions {
                budget_ms: None,
                cancellation_token: Some(token),
            },
        )
        .unwrap()
        .await;

        assert!(outcome.is_cancelled());
        assert_eq!(outcome.processed(), 4);
    }
}
