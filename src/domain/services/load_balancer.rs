//! Load Balancer Service
//!
//! Pure domain logic for selecting a backend instance for a model.
//! This service has NO external dependencies - it's pure Rust.

use crate::domain::entities::Instance;
use crate::domain::errors::GatewayError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Round-robin selection over healthy instances.
///
/// One counter is shared across all models. When no instance is healthy
/// the least-failed one is returned so traffic keeps flowing while circuits
/// are open. Instance weight is not consulted.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Select an instance for `model` out of its configured instances.
    ///
    /// # Errors
    /// [`GatewayError::NoInstancesConfigured`] when `instances` is empty.
    pub fn next(&self, model: &str, instances: &[Arc<Instance>]) -> Result<Arc<Instance>, GatewayError> {
        if instances.is_empty() {
            return Err(GatewayError::NoInstancesConfigured(model.to_string()));
        }

        let healthy: Vec<&Arc<Instance>> = instances.iter().filter(|i| i.is_healthy()).collect();

        if healthy.is_empty() {
            // min_by_key keeps the first of equal minima, so ties go to list order
            let fallback = instances
                .iter()
                .min_by_key(|i| i.failure_count())
                .ok_or_else(|| GatewayError::AllInstancesDown(model.to_string()))?;
            tracing::warn!(
                "all instances down for model={}, falling back to {} (failures={})",
                model,
                fallback.url,
                fallback.failure_count()
            );
            return Ok(fallback.clone());
        }

        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Ok(healthy[idx].clone())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::entities::InstanceRecord;
    use std::collections::HashMap;

    // ===== Test Helpers =====

    fn create_instance(url: &str, active: bool) -> Arc<Instance> {
        Arc::new(Instance::new(InstanceRecord {
            id: 1,
            provider_id: 1,
            provider_name: "openai".to_string(),
            model_name: "gpt-4".to_string(),
            url: url.to_string(),
            api_key: "sk".to_string(),
            weight: 10,
            active,
        }))
    }

    fn fail(instance: &Instance, times: u32) {
        for _ in 0..times {
            instance.record_failure();
        }
    }

    // ===== Selection Tests =====

    #[test]
    fn test_next_empty_is_no_instances_configured() {
        let lb = LoadBalancer::new();
        let result = lb.next("gpt-4", &[]);
        assert!(matches!(result, Err(GatewayError::NoInstancesConfigured(m)) if m == "gpt-4"));
    }

    #[test]
    fn test_next_single_instance() {
        let lb = LoadBalancer::new();
        let instances = vec![create_instance("http://a", true)];
        for _ in 0..3 {
            assert_eq!(lb.next("gpt-4", &instances).unwrap().url, "http://a");
        }
    }

    #[test]
    fn test_next_round_robin_is_fair() {
        let lb = LoadBalancer::new();
        let instances = vec![
            create_instance("http://a", true),
            create_instance("http://b", true),
            create_instance("http://c", true),
        ];

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..300 {
            let picked = lb.next("gpt-4", &instances).unwrap();
            *counts.entry(picked.url.clone()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for (url, count) in counts {
            assert_eq!(count, 100, "url {}", url);
        }
    }

    #[test]
    fn test_next_round_robin_uneven_split() {
        for (m, n) in [(10usize, 3usize), (7, 2), (11, 4)] {
            let lb = LoadBalancer::new();
            let instances: Vec<_> = (0..n)
                .map(|i| create_instance(&format!("http://{}", i), true))
                .collect();

            let mut counts: HashMap<String, usize> = HashMap::new();
            for _ in 0..m {
                let picked = lb.next("gpt-4", &instances).unwrap();
                *counts.entry(picked.url.clone()).or_default() += 1;
            }

            assert_eq!(counts.len(), n);
            for (url, count) in counts {
                assert!(
                    count == m / n || count == (m + n - 1) / n,
                    "m={} n={} url {} picked {} times",
                    m,
                    n,
                    url,
                    count
                );
            }
        }
    }

    #[test]
    fn test_next_skips_open_circuit() {
        let lb = LoadBalancer::new();
        let a = create_instance("http://a", true);
        let b = create_instance("http://b", true);
        fail(&a, 3);

        let instances = vec![a, b];
        for _ in 0..10 {
            assert_eq!(lb.next("gpt-4", &instances).unwrap().url, "http://b");
        }
    }

    #[test]
    fn test_next_skips_inactive() {
        let lb = LoadBalancer::new();
        let instances = vec![create_instance("http://a", false), create_instance("http://b", true)];
        for _ in 0..10 {
            assert_eq!(lb.next("gpt-4", &instances).unwrap().url, "http://b");
        }
    }

    #[test]
    fn test_next_falls_back_to_least_failed() {
        let lb = LoadBalancer::new();
        let a = create_instance("http://a", true);
        let b = create_instance("http://b", true);
        fail(&a, 5);
        fail(&b, 3);

        let picked = lb.next("gpt-4", &[a, b]).unwrap();
        assert_eq!(picked.url, "http://b");
        assert!(picked.is_circuit_open());
    }

    #[test]
    fn test_next_fallback_tie_takes_first() {
        let lb = LoadBalancer::new();
        let a = create_instance("http://a", true);
        let b = create_instance("http://b", true);
        fail(&a, 3);
        fail(&b, 3);

        assert_eq!(lb.next("gpt-4", &[a, b]).unwrap().url, "http://a");
    }

    #[test]
    fn test_next_fallback_includes_inactive() {
        let lb = LoadBalancer::new();
        let instances = vec![create_instance("http://a", false)];
        assert_eq!(lb.next("gpt-4", &instances).unwrap().url, "http://a");
    }

    #[test]
    fn test_next_shares_counter_across_models() {
        let lb = LoadBalancer::new();
        let instances = vec![create_instance("http://a", true), create_instance("http://b", true)];

        let first = lb.next("gpt-4", &instances).unwrap();
        let _ = lb.next("claude", &instances).unwrap();
        let third = lb.next("gpt-4", &instances).unwrap();
        assert_eq!(first.url, third.url);
    }
}
