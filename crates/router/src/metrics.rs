//! Prometheus metrics for the router's event path.

use prometheus::{Counter, Histogram, HistogramOpts, Registry};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RouterMetrics {
    inner: Arc<RouterMetricsInner>,
}

#[derive(Debug)]
struct RouterMetricsInner {
    events_processed: Counter,
    events_duplicate: Counter,
    events_malformed: Counter,
    store_errors: Counter,
    deltas_published: Counter,
    events_reclaimed: Counter,
    process_duration_seconds: Histogram,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterMetricsInner {
                events_processed: Counter::new(
                    "router_events_processed_total",
                    "Events accepted and written to the state KV",
                )
                .unwrap(),
                events_duplicate: Counter::new(
                    "router_events_duplicate_total",
                    "Events rejected as stale or already seen",
                )
                .unwrap(),
                events_malformed: Counter::new(
                    "router_events_malformed_total",
                    "Entries that could not be parsed into an envelope",
                )
                .unwrap(),
                store_errors: Counter::new(
                    "router_store_errors_total",
                    "Store failures while processing an entry",
                )
                .unwrap(),
                deltas_published: Counter::new(
                    "router_deltas_published_total",
                    "Accepted events republished over pub/sub",
                )
                .unwrap(),
                events_reclaimed: Counter::new(
                    "router_events_reclaimed_total",
                    "Pending entries claimed from dead consumers",
                )
                .unwrap(),
                process_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                    "router_process_duration_seconds",
                    "Per-entry processing latency in seconds",
                ))
                .unwrap(),
            }),
        }
    }

    pub fn register(&self, registry: &mut Registry) {
        registry
            .register(Box::new(self.inner.events_processed.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.events_duplicate.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.events_malformed.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.store_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.deltas_published.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.events_reclaimed.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.process_duration_seconds.clone()))
            .unwrap();
    }

    pub fn record_processed(&self) {
        self.inner.events_processed.inc();
    }

    pub fn record_duplicate(&self) {
        self.inner.events_duplicate.inc();
    }

    pub fn record_malformed(&self) {
        self.inner.events_malformed.inc();
    }

    pub fn record_store_error(&self) {
        self.inner.store_errors.inc();
    }

    pub fn record_delta_published(&self) {
        self.inner.deltas_published.inc();
    }

    pub fn record_reclaimed(&self, count: u64) {
        self.inner.events_reclaimed.inc_by(count as f64);
    }

    pub fn record_process_duration(&self, seconds: f64) {
        self.inner.process_duration_seconds.observe(seconds);
    }

    #[cfg(test)]
    pub fn processed_count(&self) -> u64 {
        self.inner.events_processed.get() as u64
    }

    #[cfg(test)]
    pub fn duplicate_count(&self) -> u64 {
        self.inner.events_duplicate.get() as u64
    }

    #[cfg(test)]
    pub fn malformed_count(&self) -> u64 {
        self.inner.events_malformed.get() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_all_collectors() {
        let metrics = RouterMetrics::new();
        let mut registry = Registry::new();
        metrics.register(&mut registry);
        metrics.record_processed();
        metrics.record_process_duration(0.002);
        assert_eq!(registry.gather().len(), 7);
    }
}
