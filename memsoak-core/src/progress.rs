//! Tunnel establishment progress and stall detection.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::{Error, Result};

/// Count of successful tunnel establishments.
///
/// Written by the dispatcher on the controller's notice context, read by the
/// orchestration loop. Only ever incremented, so the count is non-decreasing.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    established: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one establishment. Returns the new count.
    pub fn increment(&self) -> u64 {
        self.established.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current count.
    pub fn snapshot(&self) -> u64 {
        self.established.load(Ordering::Acquire)
    }
}

/// Compares consecutive snapshots taken on the memory-sample tick.
///
/// The first comparison is against zero, so a run that has not established a
/// single tunnel by the first tick fails.
#[derive(Debug, Default)]
pub struct StallDetector {
    last: u64,
}

impl StallDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count captured at the previous tick.
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Check that `current` advanced strictly past the previous tick.
    pub fn observe(&mut self, current: u64) -> Result<()> {
        if current <= self.last {
            return Err(Error::ProgressStalled {
                previous: self.last,
                current,
            });
        }
        debug!(previous = self.last, current, "progress advanced");
        self.last = current;
        Ok(())
    }
}
