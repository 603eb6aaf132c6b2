//! Outstanding-work accounting for quiescence detection.
//!
//! A run is finished when no message is pending in any stream, no worker
//! is processing one, and no source is still generating. Rather than poll
//! every stream and worker, the engine keeps a single counter of
//! outstanding units:
//!
//! | Event                                | Effect          |
//! |--------------------------------------|-----------------|
//! | message published into a stream      | `+1`            |
//! | message claimed by a consumer        | none            |
//! | consumer finished with the message   | `-1`            |
//! | source worker spawned / finished     | `+1` / `-1`     |
//! | join parks held inputs / unparks     | `-n` / `+n`     |
//!
//! Publishing always happens before the producing unit is released, so the
//! counter can only reach zero when nothing anywhere can create more work.
//!
//! Every change bumps an epoch. The coordinator waits for zero, then
//! sleeps a debounce interval and requires both the count and the epoch
//! to be unchanged before declaring quiescence.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

// =============================================================================
// Work Tracker
// =============================================================================

/// Counts outstanding units of work across the whole pipeline.
#[derive(Default)]
pub struct WorkTracker {
    outstanding: AtomicUsize,
    parked: AtomicUsize,
    epoch: AtomicU64,
    notify: Notify,
}

/// Point-in-time view of the tracker, for progress logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSnapshot {
    /// Units that can still produce work.
    pub outstanding: usize,
    /// Inputs held by join steps while waiting for a partner.
    pub parked: usize,
    /// Number of changes observed so far.
    pub epoch: u64,
}

impl WorkTracker {
    /// Create a new tracker with nothing outstanding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` outstanding units.
    pub fn inc(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.outstanding.fetch_add(n, Ordering::AcqRel);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Release `n` outstanding units, waking waiters on zero.
    pub fn dec(&self, n: usize) {
        if n == 0 {
            return;
        }
        let prev = self.outstanding.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "work tracker underflow: {prev} - {n}");
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if prev == n {
            trace!("Outstanding work reached zero");
            self.notify.notify_waiters();
        }
    }

    /// Move `n` held units out of the outstanding count.
    ///
    /// Join workers park inputs they hold while blocked on a partner that
    /// may never arrive. Parked units do not keep the run alive.
    pub fn park(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.parked.fetch_add(n, Ordering::AcqRel);
        self.dec(n);
    }

    /// Move `n` parked units back into the outstanding count.
    pub fn unpark(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.inc(n);
        self.parked.fetch_sub(n, Ordering::AcqRel);
    }

    /// Current outstanding units.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Units currently parked by join steps.
    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }

    /// Monotonic change counter.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Snapshot of all counters.
    pub fn snapshot(&self) -> WorkSnapshot {
        WorkSnapshot {
            outstanding: self.outstanding(),
            parked: self.parked(),
            epoch: self.epoch(),
        }
    }

    /// Wait until nothing is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a concurrent dec() is not missed
            let notified = self.notify.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the count is zero and stays untouched for `debounce`.
    pub async fn wait_quiescent(&self, debounce: Duration) {
        loop {
            self.wait_idle().await;
            let epoch = self.epoch();
            tokio::time::sleep(debounce).await;
            if self.outstanding() == 0 && self.epoch() == epoch {
                return;
            }
        }
    }
}

impl std::fmt::Debug for WorkTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkTracker")
            .field("outstanding", &self.outstanding())
            .field("parked", &self.parked())
            .field("epoch", &self.epoch())
            .finish()
    }
}

// =============================================================================
// Work Guard (RAII)
// =============================================================================

/// RAII guard for releasing outstanding units on drop.
///
/// Ensures the count is released even if the holder panics or is
/// cancelled, so a crashed worker can never hang quiescence detection.
pub struct WorkGuard {
    tracker: Arc<WorkTracker>,
    count: usize,
}

impl WorkGuard {
    /// Add `count` units now, release them on drop.
    pub fn acquire(tracker: Arc<WorkTracker>, count: usize) -> Self {
        tracker.inc(count);
        Self { tracker, count }
    }

    /// Take over `count` units someone else already added.
    ///
    /// Used for claimed messages, whose unit was added at publish time.
    pub fn adopt(tracker: Arc<WorkTracker>, count: usize) -> Self {
        Self { tracker, count }
    }

    /// Units this guard will release.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Fold another guard's units into this one.
    pub fn absorb(&mut self, mut other: WorkGuard) {
        self.count += other.count;
        other.count = 0;
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.tracker.dec(self.count);
    }
}
