use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight dispatch/transfer counters. Tests lean on these to verify
/// the uniform-inlining path, pending-read coalescing, and eviction counts
/// without reaching into backend internals.
#[derive(Default)]
pub struct WgpuMetrics {
    uploads: AtomicU64,
    downloads: AtomicU64,
    dispatches: AtomicU64,
    pool_acquires: AtomicU64,
    pool_reuses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub uploads: u64,
    pub downloads: u64,
    pub dispatches: u64,
    pub pool_acquires: u64,
    pub pool_reuses: u64,
    pub evictions: u64,
}

impl WgpuMetrics {
    pub fn record_upload(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_acquire(&self, reused: bool) {
        self.pool_acquires.fetch_add(1, Ordering::Relaxed);
        if reused {
            self.pool_reuses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            pool_acquires: self.pool_acquires.load(Ordering::Relaxed),
            pool_reuses: self.pool_reuses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
