//! Lock-free latency histograms for the fetch and apply halves of a poll cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bounds (µs) of the bounded buckets; one overflow bucket follows.
/// Fetches are remote RPCs, so the range runs from 500µs up to the 30s RPC timeout.
const BUCKET_BOUNDS_US: [u64; 11] = [
    500, 1_000, 5_000, 10_000, 50_000, 100_000, 250_000, 500_000, 1_000_000, 5_000_000,
    30_000_000,
];
const BUCKETS: usize = BUCKET_BOUNDS_US.len() + 1;

pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU64 = AtomicU64::new(0);

    pub const fn new() -> Self {
        Self {
            buckets: [Self::ZERO; BUCKETS],
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let idx = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| us <= bound)
            .unwrap_or(BUCKETS - 1);

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Start a timer that records into this histogram when dropped.
    pub fn start(&self) -> LatencyTimer<'_> {
        LatencyTimer {
            histogram: self,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LatencySnapshot {
        let mut buckets = [0u64; BUCKETS];
        for (slot, bucket) in buckets.iter_mut().zip(self.buckets.iter()) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        LatencySnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
            max_us: self.max_us.load(Ordering::Relaxed),
            buckets,
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    pub count: u64,
    pub sum_us: u64,
    pub max_us: u64,
    pub buckets: [u64; BUCKETS],
}

impl LatencySnapshot {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_us(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_us as f64 / self.count as f64
        }
    }

    /// Approximate percentile in microseconds: the upper bound of the bucket
    /// holding the `p`th observation.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn percentile(&self, p: f64) -> u64 {
        if self.count == 0 || !(0.0..=100.0).contains(&p) {
            return 0;
        }
        let target = ((p / 100.0) * self.count as f64).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (idx, &n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= target {
                return BUCKET_BOUNDS_US.get(idx).copied().unwrap_or(self.max_us);
            }
        }
        self.max_us
    }
}

/// Records the elapsed time on drop.
pub struct LatencyTimer<'a> {
    histogram: &'a LatencyHistogram,
    start: Instant,
}

impl Drop for LatencyTimer<'_> {
    fn drop(&mut self) {
        self.histogram.record(self.start.elapsed());
    }
}

/// Remote `get_changes` round trips.
pub static LATENCY_FETCH: LatencyHistogram = LatencyHistogram::new();

/// Apply of one fetched batch to the local tablet.
pub static LATENCY_APPLY: LatencyHistogram = LatencyHistogram::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucketing_and_percentiles() {
        let h = LatencyHistogram::new();
        for _ in 0..90 {
            h.record(Duration::from_micros(800));
        }
        for _ in 0..10 {
            h.record(Duration::from_millis(200));
        }

        let snap = h.snapshot();
        assert_eq!(snap.count, 100);
        assert_eq!(snap.buckets[1], 90);
        assert_eq!(snap.buckets[6], 10);
        assert_eq!(snap.percentile(50.0), 1_000);
        assert_eq!(snap.percentile(99.0), 250_000);
        assert_eq!(snap.max_us, 200_000);
    }

    #[test]
    fn test_overflow_bucket_reports_max() {
        let h = LatencyHistogram::new();
        h.record(Duration::from_secs(45));
        let snap = h.snapshot();
        assert_eq!(snap.buckets[BUCKETS - 1], 1);
        assert_eq!(snap.percentile(100.0), 45_000_000);
    }

    #[test]
    fn test_timer_records_on_drop() {
        let h = LatencyHistogram::new();
        {
            let _timer = h.start();
        }
        assert_eq!(h.snapshot().count, 1);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = LatencyHistogram::new().snapshot();
        assert_eq!(snap.percentile(99.0), 0);
        assert!(snap.avg_us().abs() < f64::EPSILON);
    }
}
