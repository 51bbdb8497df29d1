//! Concurrency Limiter
//!
//! Caps the number of in-flight backend calls per instance.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default per-instance in-flight cap.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// Per-instance in-flight counter.
///
/// Keys are instance URLs. Slots are acquired without waiting: a full
/// instance rejects immediately and the caller fails the task.
pub struct ConcurrencyLimiter {
    max_in_flight: usize,
    counters: DashMap<String, Arc<AtomicUsize>>,
}

impl ConcurrencyLimiter {
    /// Create a limiter with the given per-key cap.
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            counters: DashMap::new(),
        }
    }

    /// Try to take a slot for `key`.
    ///
    /// Returns `None` when the key is at capacity. The slot is released
    /// when the returned permit is dropped.
    pub fn try_acquire(&self, key: &str) -> Option<InFlightPermit> {
        let counter = self.counter(key);

        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= self.max_in_flight {
                return None;
            }

            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(InFlightPermit { counter }),
                Err(c) => current = c,
            }
        }
    }

    /// Current number of held slots for `key`.
    pub fn in_flight(&self, key: &str) -> usize {
        self.counters
            .get(key)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    fn counter(&self, key: &str) -> Arc<AtomicUsize> {
        if let Some(c) = self.counters.get(key) {
            return c.clone();
        }
        self.counters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

/// RAII slot on one instance.
///
/// Releases exactly once, on drop, whichever path the call ends on.
#[derive(Debug)]
pub struct InFlightPermit {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_up_to_cap() {
        let limiter = ConcurrencyLimiter::new(2);

        let p1 = limiter.try_acquire("http://a");
        let p2 = limiter.try_acquire("http://a");
        let p3 = limiter.try_acquire("http://a");

        assert!(p1.is_some());
        assert!(p2.is_some());
        assert!(p3.is_none());
        assert_eq!(limiter.in_flight("http://a"), 2);
    }

    #[test]
    fn test_drop_releases_slot() {
        let limiter = ConcurrencyLimiter::new(1);

        let permit = limiter.try_acquire("http://a").unwrap();
        assert!(limiter.try_acquire("http://a").is_none());

        drop(permit);
        assert_eq!(limiter.in_flight("http://a"), 0);
        assert!(limiter.try_acquire("http://a").is_some());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = ConcurrencyLimiter::new(1);

        let _a = limiter.try_acquire("http://a").unwrap();
        assert!(limiter.try_acquire("http://b").is_some());
    }

    #[test]
    fn test_unknown_key_reports_zero() {
        let limiter = ConcurrencyLimiter::default();
        assert_eq!(limiter.in_flight("http://nowhere"), 0);
        assert_eq!(limiter.max_in_flight(), DEFAULT_MAX_IN_FLIGHT);
    }

    #[test]
    fn test_zero_cap_is_clamped() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.max_in_flight(), 1);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_cap() {
        let limiter = Arc::new(ConcurrencyLimiter::new(10));
        let mut handles = Vec::new();

        for _ in 0..32 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                let mut held = Vec::new();
                for _ in 0..100 {
                    if let Some(p) = limiter.try_acquire("http://a") {
                        assert!(limiter.in_flight("http://a") <= 10);
                        held.push(p);
                    }
                    if held.len() > 2 {
                        held.clear();
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(limiter.in_flight("http://a"), 0);
    }
}
