use super::{AtomicF64, Metric};
use crate::{HuginnError, Result};

/// Monotonically non-decreasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicF64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1.0);
    }

    /// Increment by `n`.
    ///
    /// Negative or non-finite amounts are rejected with
    /// [`HuginnError::InvalidArgument`] and leave the value untouched.
    pub fn add(&self, n: f64) -> Result<()> {
        if !n.is_finite() || n < 0.0 {
            return Err(HuginnError::InvalidArgument(format!(
                "counter increment must be a finite non-negative number, got {n}"
            )));
        }
        self.value.fetch_add(n);
        Ok(())
    }

    /// Increment by a whole count, which is always a valid amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n as f64);
    }

    pub fn get(&self) -> f64 {
        self.value.load()
    }
}

impl Metric for Counter {
    type Snapshot = f64;

    fn snapshot(&self) -> f64 {
        self.get()
    }
}
