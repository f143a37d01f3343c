use super::{AtomicF64, Metric};

/// Current-value-in-time gauge. No constraints on sign.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicF64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: f64) {
        self.value.store(value);
    }

    /// Adjust by `delta`, which may be negative.
    pub fn add(&self, delta: f64) {
        self.value.fetch_add(delta);
    }

    pub fn inc(&self) {
        self.add(1.0);
    }

    pub fn dec(&self) {
        self.add(-1.0);
    }

    pub fn get(&self) -> f64 {
        self.value.load()
    }
}

impl Metric for Gauge {
    type Snapshot = f64;

    fn snapshot(&self) -> f64 {
        self.get()
    }
}
