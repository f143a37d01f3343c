use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::{AtomicF64, Metric};
use crate::{HuginnError, Result};

/// Validated bucket upper bounds: non-empty, finite, strictly ascending.
///
/// The implicit `+Inf` bucket is not part of the list. Cloning is cheap, so a
/// single `Buckets` value is shared by every histogram in a family.
#[derive(Debug, Clone, PartialEq)]
pub struct Buckets(Arc<[f64]>);

impl Buckets {
    pub fn new(bounds: impl Into<Vec<f64>>) -> Result<Self> {
        let bounds = bounds.into();
        if bounds.is_empty() {
            return Err(HuginnError::InvalidArgument(
                "histogram needs at least one bucket".to_string(),
            ));
        }
        if let Some(bad) = bounds.iter().find(|b| !b.is_finite()) {
            return Err(HuginnError::InvalidArgument(format!(
                "histogram bucket bound must be finite, got {bad}"
            )));
        }
        if let Some(pair) = bounds.windows(2).find(|w| w[0] >= w[1]) {
            return Err(HuginnError::InvalidArgument(format!(
                "histogram buckets must be strictly ascending, got {} before {}",
                pair[0], pair[1]
            )));
        }
        Ok(Self(bounds.into()))
    }

    pub fn bounds(&self) -> &[f64] {
        &self.0
    }
}

/// Histogram with fixed buckets and cumulative per-bucket counts.
///
/// An observation increments every bucket whose upper bound is `>=` the
/// value, plus the `+Inf` bucket, the total count and the running sum.
#[derive(Debug)]
pub struct Histogram {
    buckets: Buckets,
    // One slot per bound, plus the trailing +Inf slot.
    counts: Box<[AtomicU64]>,
    count: AtomicU64,
    sum: AtomicF64,
}

/// One finite bucket in a [`HistogramSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketCount {
    /// Upper bound (inclusive).
    pub le: f64,
    /// Cumulative number of observations `<= le`.
    pub count: u64,
}

/// Point-in-time copy of a [`Histogram`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    /// Finite buckets in ascending order.
    pub buckets: Vec<BucketCount>,
    /// The `+Inf` bucket.
    pub inf: u64,
    pub count: u64,
    pub sum: f64,
}

impl Histogram {
    pub fn new(buckets: Buckets) -> Self {
        let counts = (0..=buckets.bounds().len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            counts,
            count: AtomicU64::new(0),
            sum: AtomicF64::default(),
        }
    }

    /// Record one observation. `NaN` is rejected and records nothing.
    pub fn observe(&self, value: f64) -> Result<()> {
        if value.is_nan() {
            return Err(HuginnError::InvalidArgument(
                "histogram observation must not be NaN".to_string(),
            ));
        }
        self.record(value);
        Ok(())
    }

    /// Record a duration in seconds.
    pub fn observe_duration(&self, duration: Duration) {
        self.record(duration.as_secs_f64());
    }

    /// Record a whole count, such as tokens per request.
    pub fn observe_count(&self, n: u64) {
        self.record(n as f64);
    }

    fn record(&self, value: f64) {
        // Bounds are ascending, so the buckets to bump form a suffix. Bump it
        // from +Inf down: a reader loading ascending that sees a lower slot
        // incremented also sees every higher one.
        let first = self.buckets.bounds().partition_point(|&b| b < value);
        for slot in self.counts[first..].iter().rev() {
            slot.fetch_add(1, Ordering::Release);
        }
        self.sum.fetch_add(value);
        // Count last: a reader that loads it first never sees more
        // observations counted than sit in the +Inf bucket.
        self.count.fetch_add(1, Ordering::Release);
    }

    pub fn buckets(&self) -> &Buckets {
        &self.buckets
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn sum(&self) -> f64 {
        self.sum.load()
    }
}

impl Metric for Histogram {
    type Snapshot = HistogramSnapshot;

    fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count();
        let sum = self.sum();
        let bounds = self.buckets.bounds();
        let buckets = bounds
            .iter()
            .zip(self.counts.iter())
            .map(|(&le, slot)| BucketCount {
                le,
                count: slot.load(Ordering::Acquire),
            })
            .collect();
        let inf = self.counts[bounds.len()].load(Ordering::Acquire);
        HistogramSnapshot {
            buckets,
            inf,
            count,
            sum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(bounds: &[f64]) -> Histogram {
        Histogram::new(Buckets::new(bounds.to_vec()).unwrap())
    }

    #[test]
    fn buckets_must_be_ascending_and_finite() {
        assert!(Buckets::new(vec![]).is_err());
        assert!(Buckets::new(vec![1.0, 1.0]).is_err());
        assert!(Buckets::new(vec![2.0, 1.0]).is_err());
        assert!(Buckets::new(vec![1.0, f64::INFINITY]).is_err());
        assert!(Buckets::new(vec![0.5, 1.0, 2.5]).is_ok());
    }

    #[test]
    fn observe_is_cumulative() {
        let h = histogram(&[1.0, 2.0, 5.0]);
        for v in [0.5, 1.0, 1.5, 3.0, 100.0] {
            h.observe(v).unwrap();
        }
        let snap = h.snapshot();
        let counts: Vec<u64> = snap.buckets.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![2, 3, 4]);
        assert_eq!(snap.inf, 5);
        assert_eq!(snap.count, 5);
        assert_eq!(snap.sum, 106.0);
    }

    #[test]
    fn nan_is_rejected_without_mutation() {
        let h = histogram(&[1.0]);
        h.observe(0.1).unwrap();
        assert!(h.observe(f64::NAN).is_err());
        let snap = h.snapshot();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.inf, 1);
        assert_eq!(snap.sum, 0.1);
    }

    #[test]
    fn inf_bucket_matches_count_after_concurrent_observations() {
        let h = std::sync::Arc::new(histogram(&[0.01, 0.1, 1.0]));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let h = std::sync::Arc::clone(&h);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        h.observe(f64::from(t * 500 + i) / 1_000.0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = h.snapshot();
        assert_eq!(snap.count, 2_000);
        assert_eq!(snap.inf, 2_000);
        assert!(snap.buckets.windows(2).all(|w| w[0].count <= w[1].count));
    }

    #[test]
    fn snapshots_stay_cumulative_under_concurrent_writes() {
        use std::sync::atomic::AtomicBool;

        let h = std::sync::Arc::new(histogram(&[0.1, 0.2, 0.5, 1.0]));
        let done = std::sync::Arc::new(AtomicBool::new(false));
        let writers: Vec<_> = (0..3)
            .map(|_| {
                let h = std::sync::Arc::clone(&h);
                std::thread::spawn(move || {
                    // Mostly small values, so the lowest buckets move the most.
                    for i in 0..20_000u32 {
                        h.observe(if i % 4 == 0 { 2.0 } else { 0.05 }).unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let h = std::sync::Arc::clone(&h);
            let done = std::sync::Arc::clone(&done);
            std::thread::spawn(move || {
                let mut snapshots = 0;
                while !done.load(Ordering::Acquire) || snapshots == 0 {
                    let snap = h.snapshot();
                    let counts: Vec<u64> = snap.buckets.iter().map(|b| b.count).collect();
                    assert!(counts.windows(2).all(|w| w[0] <= w[1]), "{counts:?}");
                    assert!(snap.inf >= counts[counts.len() - 1], "{snap:?}");
                    assert!(snap.count <= snap.inf, "{snap:?}");
                    snapshots += 1;
                }
            })
        };
        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);
        reader.join().unwrap();
        assert_eq!(h.snapshot().inf, 60_000);
    }
}
