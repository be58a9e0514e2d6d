//! Engine Metrics
//!
//! Lock-free counters updated from every execution context, plus a
//! serializable snapshot for the CLI.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Engine-wide counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    // Scheduler
    requests_issued: AtomicU64,
    fetches_ready: AtomicU64,
    fetches_unavailable: AtomicU64,
    fetches_failed: AtomicU64,
    fetches_cancelled: AtomicU64,
    fetch_latency_us: AtomicU64,

    // GPU sync
    sync_calls: AtomicU64,
    uploads_ok: AtomicU64,
    uploads_failed: AtomicU64,
    bytes_uploaded: AtomicU64,
    unloads: AtomicU64,

    // Eviction
    eviction_passes: AtomicU64,
    junk_marked: AtomicU64,
    entries_removed: AtomicU64,

    // Teardown
    teardown_passes: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // Scheduler
    pub fn record_request_issued(&self) {
        self.requests_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_ready(&self, latency: Duration) {
        self.fetches_ready.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(&self.fetch_latency_us, latency);
    }

    pub fn record_fetch_unavailable(&self) {
        self.fetches_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failed(&self) {
        self.fetches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_cancelled(&self) {
        self.fetches_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_issued(&self) -> u64 {
        self.requests_issued.load(Ordering::Relaxed)
    }

    pub fn fetches_cancelled(&self) -> u64 {
        self.fetches_cancelled.load(Ordering::Relaxed)
    }

    // GPU sync
    pub fn record_sync_call(&self) {
        self.sync_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: usize) {
        self.uploads_ok.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_upload_failed(&self) {
        self.uploads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unload(&self) {
        self.unloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uploads_ok(&self) -> u64 {
        self.uploads_ok.load(Ordering::Relaxed)
    }

    pub fn unloads(&self) -> u64 {
        self.unloads.load(Ordering::Relaxed)
    }

    // Eviction
    pub fn record_eviction_pass(&self) {
        self.eviction_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_junk_marked(&self, count: u64) {
        self.junk_marked.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_entries_removed(&self, count: u64) {
        self.entries_removed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn entries_removed(&self) -> u64 {
        self.entries_removed.load(Ordering::Relaxed)
    }

    // Teardown
    pub fn record_teardown_pass(&self) {
        self.teardown_passes.fetch_add(1, Ordering::Relaxed);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Average fetch latency (EMA)
    pub fn fetch_latency(&self) -> Duration {
        Duration::from_micros(self.fetch_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_issued: self.requests_issued(),
            fetches_ready: self.fetches_ready.load(Ordering::Relaxed),
            fetches_unavailable: self.fetches_unavailable.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            fetches_cancelled: self.fetches_cancelled(),
            fetch_latency_us: self.fetch_latency_us.load(Ordering::Relaxed),

            sync_calls: self.sync_calls.load(Ordering::Relaxed),
            uploads_ok: self.uploads_ok(),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            unloads: self.unloads(),

            eviction_passes: self.eviction_passes.load(Ordering::Relaxed),
            junk_marked: self.junk_marked.load(Ordering::Relaxed),
            entries_removed: self.entries_removed(),

            teardown_passes: self.teardown_passes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of all engine metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    // Scheduler
    pub requests_issued: u64,
    pub fetches_ready: u64,
    pub fetches_unavailable: u64,
    pub fetches_failed: u64,
    pub fetches_cancelled: u64,
    pub fetch_latency_us: u64,

    // GPU sync
    pub sync_calls: u64,
    pub uploads_ok: u64,
    pub uploads_failed: u64,
    pub bytes_uploaded: u64,
    pub unloads: u64,

    // Eviction
    pub eviction_passes: u64,
    pub junk_marked: u64,
    pub entries_removed: u64,

    pub teardown_passes: u64,
}
