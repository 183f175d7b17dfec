use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Tracks ingestion counters for the recorder
#[derive(Clone, Default)]
pub struct RecorderMetrics {
    /// Events accepted by `submit`
    received: Arc<AtomicU64>,

    /// Records durably appended
    recorded: Arc<AtomicU64>,

    /// Events skipped by the record policy
    skipped: Arc<AtomicU64>,

    /// Malformed events dropped before storage
    dropped: Arc<AtomicU64>,

    /// Append attempts that failed and were retried
    retries: Arc<AtomicU64>,

    /// Records given up on after exhausting retries
    lost: Arc<AtomicU64>,

    /// Events a lagging listener never saw
    missed: Arc<AtomicU64>,

    /// Wall-clock time of the last successful append
    last_recorded_at: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl RecorderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recorded(&self) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        let mut last = self
            .last_recorded_at
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(Utc::now());
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missed(&self, count: u64) {
        self.missed.fetch_add(count, Ordering::Relaxed);
    }

    /// Get snapshot of all counters
    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
            last_recorded_at: *self
                .last_recorded_at
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

/// Snapshot of recorder counters at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub recorded: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub retries: u64,
    pub lost: u64,
    pub missed: u64,
    pub last_recorded_at: Option<DateTime<Utc>>,
}
