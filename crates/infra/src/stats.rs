//! Per-instance pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters owned by one pipeline instance.
///
/// Handlers update them concurrently through a shared reference; nothing is
/// shared across workers.
#[derive(Debug, Default)]
pub struct PipelineStats {
    consumed: AtomicU64,
    stored: AtomicU64,
    retried: AtomicU64,
    escalated: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub consumed: u64,
    pub stored: u64,
    pub retried: u64,
    pub escalated: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub reconnects: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A delivery was taken off the primary queue.
    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    /// An envelope went back to the end of the retry buffer.
    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// An envelope was published to the persistent retry queue.
    pub fn record_escalated(&self) {
        self.escalated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// An envelope was lost because a publish failed.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
