//! Event Router: turns the at-least-once, sharded event streams into
//! a durable per-job state snapshot plus a best-effort delta feed.
//!
//! One consumer task per (domain, shard) reads under a named consumer
//! group; every entry goes through one atomic dedup script; accepted
//! events are republished to the per-job pub/sub channel; a periodic
//! reclaimer re-runs entries abandoned by crashed consumers.

pub mod config;
pub mod consumer;
pub mod http;
pub mod metrics;
pub mod processor;
pub mod reclaimer;
pub mod store;

pub use config::{DomainConfig, RouterConfig};
pub use metrics::RouterMetrics;
pub use processor::Processor;
pub use store::{EventStore, RedisEventStore, RouterError};
