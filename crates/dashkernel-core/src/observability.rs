//! Point-in-time views for status pages and logs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreSnapshot {
    pub name: String,
    pub capacity: usize,
    pub in_use: usize,
    pub waiting: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub name: String,
    pub queued: usize,
    /// Grants still inside the trailing window.
    pub recent_requests: usize,
    pub max_requests: usize,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub name: String,
    pub time_slice_ms: u64,
    pub yield_delay_ms: u64,
    /// Time spent in the current frame.
    pub frame_elapsed_ms: u64,
    pub yield_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub semaphore: BTreeMap<String, SemaphoreSnapshot>,
    pub mutex: BTreeMap<String, SemaphoreSnapshot>,
    pub rate_limiter: BTreeMap<String, RateLimiterSnapshot>,
    pub scheduler: BTreeMap<String, SchedulerSnapshot>,
}

/// Outcome of one write-behind round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Patches written and cleared.
    pub written: usize,
    /// Transient failures, kept for the next round.
    pub failed: usize,
    /// Patches the store refused for good; discarded.
    pub dropped: usize,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.dropped == 0
    }
}
