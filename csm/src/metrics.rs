use prometheus::{IntCounter, Registry};

/// Counters this state machine maintains. Construction never touches a
/// process-wide registry; wiring these into one is left to the host process
/// via [`Metrics::register`], matching the split between "metrics a
/// component emits" and "metrics registration plumbing" described in the
/// scope notes.
pub struct Metrics {
    pub not_open_verify_failures: IntCounter,
    pub start_transaction_verify_failures: IntCounter,
    pub cache_evictions: IntCounter,
    pub cache_misses: IntCounter,
    pub apply_failures: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            not_open_verify_failures: IntCounter::new(
                "csm_not_open_verify_failures",
                "Pre-replication validations rejected for container-not-open",
            )
            .unwrap(),
            start_transaction_verify_failures: IntCounter::new(
                "csm_start_transaction_verify_failures",
                "Pre-replication validations rejected for any other reason",
            )
            .unwrap(),
            cache_evictions: IntCounter::new(
                "csm_cache_evictions",
                "State-machine-data cache entries evicted under byte pressure",
            )
            .unwrap(),
            cache_misses: IntCounter::new(
                "csm_cache_misses",
                "State-machine-data cache misses falling back to a dispatcher read",
            )
            .unwrap(),
            apply_failures: IntCounter::new(
                "csm_apply_failures",
                "Apply results outside the tolerated result set",
            )
            .unwrap(),
        }
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.not_open_verify_failures.clone()))?;
        registry.register(Box::new(self.start_transaction_verify_failures.clone()))?;
        registry.register(Box::new(self.cache_evictions.clone()))?;
        registry.register(Box::new(self.cache_misses.clone()))?;
        registry.register(Box::new(self.apply_failures.clone()))?;
        Ok(())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
