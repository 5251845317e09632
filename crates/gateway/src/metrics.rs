//! Prometheus metrics for rooms, subscribers, and the SSE path.

use prometheus::{Counter, Gauge, Registry};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    inner: Arc<GatewayMetricsInner>,
}

#[derive(Debug)]
struct GatewayMetricsInner {
    rooms_active: Gauge,
    subscribers_active: Gauge,
    connections_total: Counter,
    events_delivered: Counter,
    events_dropped: Counter,
    snapshots_served: Counter,
    keepalives_sent: Counter,
    timeouts: Counter,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GatewayMetricsInner {
                rooms_active: Gauge::new("gateway_rooms_active", "Rooms with live subscribers")
                    .unwrap(),
                subscribers_active: Gauge::new(
                    "gateway_subscribers_active",
                    "Open SSE connections",
                )
                .unwrap(),
                connections_total: Counter::new(
                    "gateway_connections_total",
                    "SSE connections accepted",
                )
                .unwrap(),
                events_delivered: Counter::new(
                    "gateway_events_delivered_total",
                    "Stage events written to SSE streams",
                )
                .unwrap(),
                events_dropped: Counter::new(
                    "gateway_events_dropped_total",
                    "Events dropped by slow connections",
                )
                .unwrap(),
                snapshots_served: Counter::new(
                    "gateway_snapshots_served_total",
                    "State snapshots served on connect or re-poll",
                )
                .unwrap(),
                keepalives_sent: Counter::new(
                    "gateway_keepalives_sent_total",
                    "Keepalive events sent",
                )
                .unwrap(),
                timeouts: Counter::new(
                    "gateway_timeouts_total",
                    "Connections ended by the max wait limit",
                )
                .unwrap(),
            }),
        }
    }

    pub fn register(&self, registry: &mut Registry) {
        registry
            .register(Box::new(self.inner.rooms_active.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.subscribers_active.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.events_delivered.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.events_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.snapshots_served.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.keepalives_sent.clone()))
            .unwrap();
        registry
            .register(Box::new(self.inner.timeouts.clone()))
            .unwrap();
    }

    pub fn room_opened(&self) {
        self.inner.rooms_active.inc();
    }

    pub fn room_closed(&self) {
        self.inner.rooms_active.dec();
    }

    pub fn subscriber_connected(&self) {
        self.inner.subscribers_active.inc();
        self.inner.connections_total.inc();
    }

    pub fn subscriber_disconnected(&self) {
        self.inner.subscribers_active.dec();
    }

    pub fn record_delivered(&self) {
        self.inner.events_delivered.inc();
    }

    pub fn record_dropped(&self, count: u64) {
        self.inner.events_dropped.inc_by(count as f64);
    }

    pub fn record_snapshot(&self) {
        self.inner.snapshots_served.inc();
    }

    pub fn record_keepalive(&self) {
        self.inner.keepalives_sent.inc();
    }

    pub fn record_timeout(&self) {
        self.inner.timeouts.inc();
    }

    pub fn active_rooms(&self) -> i64 {
        self.inner.rooms_active.get() as i64
    }

    pub fn active_subscribers(&self) -> i64 {
        self.inner.subscribers_active.get() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_all_collectors() {
        let metrics = GatewayMetrics::new();
        let mut registry = Registry::new();
        metrics.register(&mut registry);
        metrics.room_opened();
        metrics.subscriber_connected();
        assert_eq!(registry.gather().len(), 8);
        assert_eq!(metrics.active_rooms(), 1);
        assert_eq!(metrics.active_subscribers(), 1);
    }
}
