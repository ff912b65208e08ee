//! Observational sync counters.
//!
//! Nothing in the pipeline reads these back to make decisions; they exist for
//! status panels and debugging.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use ts_rs::TS;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SyncStatsSnapshot {
    /// Local deltas handed to the batcher
    pub total_updates: u64,
    /// Deltas delivered as part of a confirmed batch
    pub batched_updates: u64,
    /// Deltas in batches that were given up
    pub failed_updates: u64,
    /// Confirmed sends
    pub successful_sends: u64,
    /// Running average send latency in milliseconds
    pub average_latency_ms: f64,
    /// Running average of merged size over raw size for flushed batches
    pub compression_ratio: f64,
    /// Unix timestamp (milliseconds) of the last confirmed send
    #[ts(type = "number | null")]
    pub last_sync_at: Option<i64>,
}

/// Thread-safe counters shared by the batcher and the engine.
#[derive(Debug, Default)]
pub struct SyncStats {
    inner: Mutex<SyncStatsSnapshot>,
    flushes: Mutex<u64>,
}

impl SyncStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one local delta.
    pub fn record_update(&self) {
        self.inner.lock().unwrap().total_updates += 1;
    }

    /// Record a flush of `raw_bytes` worth of deltas merged into `merged_bytes`.
    pub fn record_flush(&self, raw_bytes: usize, merged_bytes: usize) {
        if raw_bytes == 0 {
            return;
        }
        let ratio = merged_bytes as f64 / raw_bytes as f64;
        let mut flushes = self.flushes.lock().unwrap();
        *flushes += 1;
        let mut stats = self.inner.lock().unwrap();
        stats.compression_ratio += (ratio - stats.compression_ratio) / *flushes as f64;
    }

    /// Record a confirmed send of `update_count` deltas.
    pub fn record_success(&self, update_count: usize, latency: Duration) {
        let mut stats = self.inner.lock().unwrap();
        stats.successful_sends += 1;
        stats.batched_updates += update_count as u64;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        stats.average_latency_ms +=
            (latency_ms - stats.average_latency_ms) / stats.successful_sends as f64;
        stats.last_sync_at = Some(chrono::Utc::now().timestamp_millis());
    }

    /// Record a batch of `update_count` deltas that was given up.
    pub fn record_failure(&self, update_count: usize) {
        self.inner.lock().unwrap().failed_updates += update_count as u64;
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        self.inner.lock().unwrap().clone()
    }

    /// Reset every counter.
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = SyncStatsSnapshot::default();
        *self.flushes.lock().unwrap() = 0;
    }
}
