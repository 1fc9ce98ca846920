//! Metrics collection and monitoring for the persistent heap.
//!
//! This module provides low-overhead metrics collection using Prometheus.
//! The gauges mirror the ctl `stats.heap.*` nodes, which remain the source
//! of truth; counters track operation throughput.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Heap metrics
pub struct HeapMetrics {
    /// Bytes currently allocated
    pub allocated_bytes: IntGauge,
    /// Bytes freed since open
    pub freed_bytes: IntGauge,
    /// Zones with rebuilt volatile state
    pub active_zones: IntGauge,
    /// Completed allocations
    pub allocs_total: IntCounter,
    /// Completed frees
    pub frees_total: IntCounter,
    /// Completed reallocations
    pub reallocs_total: IntCounter,
}

impl HeapMetrics {
    fn new() -> prometheus::Result<Self> {
        let metrics = Self {
            allocated_bytes: IntGauge::with_opts(Opts::new(
                "pmheap_allocated_bytes",
                "Bytes currently allocated from the pool",
            ))?,
            freed_bytes: IntGauge::with_opts(Opts::new(
                "pmheap_freed_bytes",
                "Bytes freed since the pool was opened",
            ))?,
            active_zones: IntGauge::with_opts(Opts::new(
                "pmheap_active_zones",
                "Zones whose volatile state has been rebuilt",
            ))?,
            allocs_total: IntCounter::with_opts(Opts::new(
                "pmheap_allocs_total",
                "Total completed allocations",
            ))?,
            frees_total: IntCounter::with_opts(Opts::new(
                "pmheap_frees_total",
                "Total completed frees",
            ))?,
            reallocs_total: IntCounter::with_opts(Opts::new(
                "pmheap_reallocs_total",
                "Total completed reallocations",
            ))?,
        };
        REGISTRY.register(Box::new(metrics.allocated_bytes.clone()))?;
        REGISTRY.register(Box::new(metrics.freed_bytes.clone()))?;
        REGISTRY.register(Box::new(metrics.active_zones.clone()))?;
        REGISTRY.register(Box::new(metrics.allocs_total.clone()))?;
        REGISTRY.register(Box::new(metrics.frees_total.clone()))?;
        REGISTRY.register(Box::new(metrics.reallocs_total.clone()))?;
        Ok(metrics)
    }
}

/// The process-wide heap metrics instance.
pub fn heap() -> &'static HeapMetrics {
    static INSTANCE: Lazy<HeapMetrics> = Lazy::new(|| {
        HeapMetrics::new().expect("Failed to initialize heap metrics")
    });
    &INSTANCE
}

/// The registry metrics are exported from.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let m = heap();
        m.allocs_total.inc();
        assert!(m.allocs_total.get() >= 1);
        // A second lookup returns the same instance.
        let again = heap();
        assert_eq!(again.allocs_total.get(), m.allocs_total.get());
    }

    #[test]
    fn test_registry_gathers_heap_families() {
        heap().allocated_bytes.set(42);
        let families = registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "pmheap_allocated_bytes"));
    }
}
