use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide atomic counters. Plain, process-local instrumentation —
/// exporting these in any wire format is an external collaborator's concern.
#[derive(Debug, Default)]
pub struct Metrics {
    pub ingest_total: AtomicU64,
    pub flush_total: AtomicU64,
    pub flush_ns_total: AtomicU64,
    pub flush_points_total: AtomicU64,
    pub wal_bytes_total: AtomicU64,
    pub queue_max_len: AtomicU64,
    pub queue_len_sum: AtomicU64,
    pub queue_len_samples: AtomicU64,
    pub queue_push_contention_total: AtomicU64,
    pub queue_pop_contention_total: AtomicU64,
    pub queue_hold_ns_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingest(&self) {
        self.ingest_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wal_write(&self, bytes: u64) {
        self.wal_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_flush(&self, points: u64, duration_ns: u64) {
        self.flush_total.fetch_add(1, Ordering::Relaxed);
        self.flush_points_total.fetch_add(points, Ordering::Relaxed);
        self.flush_ns_total.fetch_add(duration_ns, Ordering::Relaxed);
    }

    /// Samples queue depth, tracking sum/count (for averages) and a
    /// monotonic CAS-max.
    pub fn sample_queue_len(&self, len: u64) {
        self.queue_len_sum.fetch_add(len, Ordering::Relaxed);
        self.queue_len_samples.fetch_add(1, Ordering::Relaxed);
        let mut current = self.queue_max_len.load(Ordering::Relaxed);
        while len > current {
            match self.queue_max_len.compare_exchange_weak(
                current,
                len,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ingest_total: self.ingest_total.load(Ordering::Relaxed),
            flush_total: self.flush_total.load(Ordering::Relaxed),
            flush_ns_total: self.flush_ns_total.load(Ordering::Relaxed),
            flush_points_total: self.flush_points_total.load(Ordering::Relaxed),
            wal_bytes_total: self.wal_bytes_total.load(Ordering::Relaxed),
            // Filled in by `Engine::metrics()` from the ingest queue's own
            // counters; `Metrics` has no direct queue reference to draw from.
            queue_pop_total: 0,
            queue_wait_ns_total: 0,
            queue_max_len: self.queue_max_len.load(Ordering::Relaxed),
            queue_len_sum: self.queue_len_sum.load(Ordering::Relaxed),
            queue_len_samples: self.queue_len_samples.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time read of [`Metrics`], safe to log or hand to a
/// collaborator without exposing the atomics themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub ingest_total: u64,
    pub flush_total: u64,
    pub flush_ns_total: u64,
    pub flush_points_total: u64,
    pub wal_bytes_total: u64,
    pub queue_pop_total: u64,
    pub queue_wait_ns_total: u64,
    pub queue_max_len: u64,
    pub queue_len_sum: u64,
    pub queue_len_samples: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_queue_len_tracks_running_max() {
        let metrics = Metrics::new();
        metrics.sample_queue_len(3);
        metrics.sample_queue_len(1);
        metrics.sample_queue_len(7);
        let snap = metrics.snapshot();
        assert_eq!(snap.queue_max_len, 7);
        assert_eq!(snap.queue_len_sum, 11);
        assert_eq!(snap.queue_len_samples, 3);
    }

    #[test]
    fn record_flush_accumulates() {
        let metrics = Metrics::new();
        metrics.record_flush(10, 1_000);
        metrics.record_flush(5, 500);
        let snap = metrics.snapshot();
        assert_eq!(snap.flush_total, 2);
        assert_eq!(snap.flush_points_total, 15);
        assert_eq!(snap.flush_ns_total, 1_500);
    }
}
