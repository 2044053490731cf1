//! Event Counters
//!
//! Based on Mach4 kern/counters.h/c by CMU (1987-1991)
//!
//! `Counter` counts events; `HighWater` remembers the largest value a
//! queue or list length ever reached. Both are relaxed atomics: they feed
//! statistics, never decisions.

use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter
// ============================================================================

/// Named event counter
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Count one event
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// High-Water Mark
// ============================================================================

/// Largest value observed for a length that rises and falls
#[derive(Debug)]
pub struct HighWater {
    peak: AtomicU64,
    name: &'static str,
}

impl HighWater {
    pub const fn new(name: &'static str) -> Self {
        Self {
            peak: AtomicU64::new(0),
            name,
        }
    }

    /// Record the current length; returns true if it set a new peak
    #[inline]
    pub fn observe(&self, current: usize) -> bool {
        let current = current as u64;
        self.peak.fetch_max(current, Ordering::Relaxed) < current
    }

    #[inline]
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_counts() {
        let counter = Counter::new("writes");
        assert_eq!(counter.get(), 0);
        assert_eq!(counter.name(), "writes");

        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_high_water_keeps_peak() {
        let mark = HighWater::new("queue");
        assert!(mark.observe(7));
        assert!(!mark.observe(3));
        assert!(!mark.observe(7));
        assert_eq!(mark.peak(), 7);
        assert!(mark.observe(9));
        assert_eq!(mark.peak(), 9);
    }
}
