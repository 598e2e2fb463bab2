//! Atomic helpers for device statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing event counter.
#[derive(Debug)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create a new counter.
    pub const fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Increment the counter.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// A gauge that goes up and down, with a high-water mark.
#[derive(Debug, Default)]
pub struct AtomicGauge {
    value: AtomicU64,
    peak: AtomicU64,
}

impl AtomicGauge {
    /// Create a new gauge at zero.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    /// Add to the gauge and update the peak.
    pub fn add(&self, amount: u64) -> u64 {
        let now = self.value.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(now, Ordering::Relaxed);
        now
    }

    /// Subtract from the gauge, saturating at zero.
    pub fn sub(&self, amount: u64) -> u64 {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(amount);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(c) => current = c,
            }
        }
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Highest value ever observed.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_peak_and_saturation() {
        let g = AtomicGauge::new();
        g.add(10);
        g.add(5);
        assert_eq!(g.sub(12), 3);
        assert_eq!(g.sub(100), 0);
        assert_eq!(g.peak(), 15);
    }

    #[test]
    fn test_counter() {
        let c = AtomicCounter::default();
        c.increment();
        c.increment();
        assert_eq!(c.get(), 2);
    }
}
