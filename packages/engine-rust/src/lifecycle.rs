//! Context lifecycle state and in-flight exchange tracking.
//!
//! The in-flight tracker is an atomic counter with RAII guards; draining polls
//! it until it reaches zero or the grace period runs out.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Context lifecycle.
///
/// State machine: Uninitialized -> Starting -> Started -> Stopping -> Stopped,
/// and Stopped -> Starting on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Counts exchanges currently inside a route.
///
/// Cloning shares the counter.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    in_flight: Arc<AtomicU64>,
}

impl InFlightTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an RAII guard that counts one in-flight exchange.
    ///
    /// The counter is decremented when the guard is dropped, including when
    /// the future holding it is cancelled or panics.
    #[must_use]
    pub fn guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits until no exchange is in flight, up to `timeout`.
    ///
    /// Returns `false` if the timeout expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.count() == 0).await
    }
}

/// Polls `done` every 10ms until it holds or `timeout` expires.
///
/// Returns whether `done` held before the deadline.
pub(crate) async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
