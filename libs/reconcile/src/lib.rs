//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge actual state to desired state. Key concepts:
//!
//! - **Desired state**: What the system should look like (from the spec object).
//! - **Actual state**: What the system looks like (listed from the store).
//! - **Convergence**: Repeated passes that each re-derive the diff from scratch.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - Retries are always bounded

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;

mod retry;

pub use retry::{retry_with_backoff, RetryPolicy, Retryable};

/// Reconciliation primitive errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Lower bound above upper bound; no target can satisfy both.
    #[error("minReplicas {min} is greater than maxReplicas {max}")]
    InvalidBounds { min: i32, max: i32 },
}

// =============================================================================
// Replica bounds
// =============================================================================

/// Validated scale bounds for a group.
///
/// Absence of a bound means unbounded in that direction; negative values
/// are treated as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaBounds {
    min: u32,
    max: Option<u32>,
}

impl ReplicaBounds {
    /// Build bounds from optional raw values.
    pub fn new(min: Option<i32>, max: Option<i32>) -> Result<Self, ReconcileError> {
        let lo = min.unwrap_or(0).max(0);
        let hi = max.map(|m| m.max(0));

        if let Some(hi) = hi {
            if lo > hi {
                return Err(ReconcileError::InvalidBounds { min: lo, max: hi });
            }
        }

        Ok(Self {
            min: lo as u32,
            max: hi.map(|h| h as u32),
        })
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> Option<u32> {
        self.max
    }

    /// Effective target for a requested replica count.
    ///
    /// An absent request defaults to the lower bound.
    pub fn clamp(&self, requested: Option<i32>) -> u32 {
        let requested = requested.map_or(self.min, |r| r.max(0) as u32);
        let at_least_min = requested.max(self.min);
        match self.max {
            Some(max) => at_least_min.min(max),
            None => at_least_min,
        }
    }
}

// =============================================================================
// Deletion ordering
// =============================================================================

/// Pick `count` items to remove, lowest key first.
///
/// The sort is stable, so items with equal keys keep their input order.
pub fn select_for_drain<T, K, F>(items: Vec<T>, count: usize, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut keyed: Vec<_> = items.into_iter().map(|i| (key(&i), i)).collect();
    keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
    keyed.into_iter().take(count).map(|(_, i)| i).collect()
}

// =============================================================================
// Failure tracking
// =============================================================================

/// Failure tracker for keys whose passes keep failing.
///
/// Counts failures inside a sliding window; once the count exceeds
/// `max_failures` the key is considered exhausted.
#[derive(Debug, Clone)]
pub struct FailureTracker<K: Ord> {
    /// Failures tolerated inside the window.
    max_failures: u32,

    /// Window duration.
    window: Duration,

    /// key -> (count, first_failure_time).
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> FailureTracker<K> {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for `key`.
    ///
    /// Returns the failure count inside the current window.
    pub fn record_failure(&mut self, key: &K) -> u32 {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count
    }

    /// Failures recorded for `key` inside the current window.
    pub fn failures(&self, key: &K) -> u32 {
        match self.failures.get(key) {
            Some((count, first)) if first.elapsed() <= self.window => *count,
            _ => 0,
        }
    }

    /// True once `key` has failed more than `max_failures` times in the window.
    pub fn is_exhausted(&self, key: &K) -> bool {
        self.failures(key) > self.max_failures
    }

    /// Clear tracking for `key` (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Drop entries whose window has expired.
    pub fn prune(&mut self) {
        let window = self.window;
        self.failures.retain(|_, (_, first)| first.elapsed() <= window);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Default periodic resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default failed passes tolerated before a key is reported as failed.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Default failure window.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
