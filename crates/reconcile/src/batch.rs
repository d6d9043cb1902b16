//! Bounded, deadline-aware batch iteration shared by every job.
//!
//! A batch selects at most `limit` records, then handles them strictly one at
//! a time. The deadline is checked only before starting an item; an item that
//! has started always runs to completion. A failing (or panicking) item never
//! stops the next one from being attempted.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use settle_core::{Clock, StoreResult};

use crate::error::JobError;

/// Successful per-item result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The item changed state as intended.
    Succeeded,
    /// Short-circuited to a terminal state without doing the work.
    Skipped,
    /// Nothing to do this run (still in flight, already resolved elsewhere).
    Unchanged,
}

/// Per-item failure tag.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    /// Worth another attempt on a later invocation.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Will not succeed by retrying; needs a human.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl ItemError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }
}

/// Wall-clock budget of one invocation, measured from its start.
#[derive(Clone)]
pub struct Deadline {
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
    budget: Duration,
}

impl Deadline {
    pub fn start(clock: Arc<dyn Clock>, budget: Duration) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            started_at,
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed_since(self.started_at)
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.budget
    }
}

/// The instant `age` before `now`; saturates at the earliest representable time.
pub fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Identifies a record in batch logs.
pub trait BatchItem {
    fn key(&self) -> String;
}

/// Aggregate counters of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Records returned by the selection query.
    pub found: usize,
    /// Records whose handler was started.
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub unchanged: usize,
    pub retryable_failures: usize,
    pub terminal_failures: usize,
    /// `found == limit`: probably more eligible work for the next invocation.
    pub has_more: bool,
    /// The deadline stopped the batch before every record was attempted.
    pub deadline_hit: bool,
}

impl BatchSummary {
    pub fn failed(&self) -> usize {
        self.retryable_failures + self.terminal_failures
    }

    /// Records left untouched for a later invocation.
    pub fn untouched(&self) -> usize {
        self.found - self.attempted
    }
}

/// Runs one bounded batch.
pub struct BatchExecutor {
    name: &'static str,
    limit: usize,
}

impl BatchExecutor {
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self { name, limit }
    }

    /// Select up to `limit` records and handle them in order until done or
    /// until `deadline` expires.
    ///
    /// A failing selection is a setup failure and aborts the batch.
    pub fn run<T, S, H>(&self, deadline: &Deadline, select: S, mut handle: H) -> Result<BatchSummary, JobError>
    where
        T: BatchItem,
        S: FnOnce(usize) -> StoreResult<Vec<T>>,
        H: FnMut(&T) -> Result<Outcome, ItemError>,
    {
        let mut items = select(self.limit)?;
        items.truncate(self.limit);

        let mut summary = BatchSummary {
            found: items.len(),
            has_more: self.limit > 0 && items.len() == self.limit,
            ..BatchSummary::default()
        };

        for item in &items {
            if deadline.is_expired() {
                summary.deadline_hit = true;
                warn!(
                    batch = self.name,
                    elapsed = ?deadline.elapsed(),
                    remaining = summary.untouched(),
                    "batch deadline reached; leaving remaining records for the next run"
                );
                break;
            }

            summary.attempted += 1;
            let key = item.key();

            let result = panic::catch_unwind(AssertUnwindSafe(|| handle(item)))
                .unwrap_or_else(|_| Err(ItemError::terminal("handler panicked")));

            match result {
                Ok(Outcome::Succeeded) => summary.succeeded += 1,
                Ok(Outcome::Skipped) => summary.skipped += 1,
                Ok(Outcome::Unchanged) => summary.unchanged += 1,
                Err(ref e @ ItemError::Retryable(_)) => {
                    summary.retryable_failures += 1;
                    debug!(batch = self.name, item = %key, error = %e, "item failed; will retry");
                }
                Err(ref e @ ItemError::Terminal(_)) => {
                    summary.terminal_failures += 1;
                    warn!(batch = self.name, item = %key, error = %e, "item failed permanently");
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use settle_core::{ManualClock, StoreError};

    #[derive(Debug)]
    struct Item(u32);

    impl BatchItem for Item {
        fn key(&self) -> String {
            self.0.to_string()
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc::now()))
    }

    fn items(n: u32) -> impl FnOnce(usize) -> StoreResult<Vec<Item>> {
        move |limit| Ok((0..n).map(Item).take(limit).collect())
    }

    #[test]
    fn failures_do_not_stop_the_batch() {
        let clock = clock();
        let deadline = Deadline::start(clock, Duration::from_secs(10));
        let executor = BatchExecutor::new("test", 10);

        let summary = executor
            .run(&deadline, items(4), |item| match item.0 {
                0 => Err(ItemError::retryable("flaky")),
                1 => panic!("boom"),
                2 => Ok(Outcome::Skipped),
                _ => Ok(Outcome::Succeeded),
            })
            .unwrap();

        assert_eq!(summary.found, 4);
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.retryable_failures, 1);
        assert_eq!(summary.terminal_failures, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed(), 2);
        assert!(!summary.has_more);
    }

    #[test]
    fn deadline_stops_before_starting_the_next_item() {
        let clock = clock();
        let deadline = Deadline::start(clock.clone(), Duration::from_secs(10));
        let executor = BatchExecutor::new("test", 10);
        let mut started = Vec::new();

        let summary = executor
            .run(&deadline, items(5), |item| {
                started.push(item.0);
                // Item 1 overruns the budget but still completes.
                clock.advance(Duration::from_secs(if item.0 == 1 { 9 } else { 1 }));
                Ok(Outcome::Succeeded)
            })
            .unwrap();

        assert_eq!(started, vec![0, 1]);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.untouched(), 3);
        assert!(summary.deadline_hit);
    }

    #[test]
    fn has_more_when_selection_fills_the_limit() {
        let deadline = Deadline::start(clock(), Duration::from_secs(10));
        let executor = BatchExecutor::new("test", 3);

        let summary = executor.run(&deadline, items(7), |_| Ok(Outcome::Unchanged)).unwrap();

        assert_eq!(summary.found, 3);
        assert_eq!(summary.unchanged, 3);
        assert!(summary.has_more);
    }

    #[test]
    fn selection_failure_aborts() {
        let deadline = Deadline::start(clock(), Duration::from_secs(10));
        let executor = BatchExecutor::new("test", 3);

        let err = executor
            .run(
                &deadline,
                |_| -> StoreResult<Vec<Item>> { Err(StoreError::storage("down")) },
                |_| Ok(Outcome::Succeeded),
            )
            .unwrap_err();

        assert_eq!(err, JobError::Store(StoreError::storage("down")));
    }

    #[test]
    fn cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(cutoff(now, Duration::from_secs(60)), now - chrono::Duration::seconds(60));
        assert_eq!(cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
