//! SSE gateway: fans the router's per-job delta feed out to browser
//! connections over Server-Sent Events.
//!
//! Rooms are created on first subscriber and torn down with the last
//! one; every connection starts from the durable state snapshot, so a
//! reconnect or a missed delta never loses the job's latest stage.

pub mod broadcast;
pub mod config;
pub mod http;
pub mod metrics;
pub mod state;
pub mod stream;

pub use broadcast::BroadcastManager;
pub use config::GatewayConfig;
pub use metrics::GatewayMetrics;
pub use state::{GatewayError, RedisStateReader, StateReader};
