//! Concurrency-safe metric primitives.
//!
//! - [`Counter`]: monotonically non-decreasing value
//! - [`Gauge`]: current value that can go up and down
//! - [`Histogram`]: fixed ascending buckets with cumulative counts
//! - [`Family`]: label vector: one primitive per distinct label tuple,
//!   created lazily on first use and never removed
//!
//! Every primitive is lock-free on the write path. Floating point cells are
//! stored as `AtomicU64` bit patterns and updated with compare-and-swap, so
//! concurrent increments are never lost.

mod counter;
mod family;
mod gauge;
mod histogram;

use std::sync::atomic::{AtomicU64, Ordering};

pub use counter::Counter;
pub use family::{Family, LabeledSnapshot};
pub use gauge::Gauge;
pub use histogram::{BucketCount, Buckets, Histogram, HistogramSnapshot};

/// A primitive that can produce an immutable copy of its current value.
pub trait Metric: Send + Sync {
    /// Immutable point-in-time copy.
    type Snapshot: Clone + std::fmt::Debug;

    /// Read the current value. Never blocks writers.
    fn snapshot(&self) -> Self::Snapshot;
}

/// `f64` cell with atomic load/store/add.
#[derive(Debug)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// Add `delta`, retrying until no concurrent writer interferes.
    pub(crate) fn fetch_add(&self, delta: f64) -> f64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let new = f64::from_bits(current) + delta;
            match self.0.compare_exchange_weak(
                current,
                new.to_bits(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(previous) => return f64::from_bits(previous),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}
