//! Key and channel naming, kept in one place so producers, the
//! router, and the gateway never drift apart.

/// Default stream prefix for the scan pipeline.
pub const SCAN_STREAM_PREFIX: &str = "scan:events";
/// Default stream prefix for the chat pipeline.
pub const CHAT_STREAM_PREFIX: &str = "chat:events";

/// Pub/sub channel prefix for router-to-gateway deltas.
pub const PUBSUB_CHANNEL_PREFIX: &str = "sse:events";
/// Prefix of the router's highest-accepted-seq ledger.
pub const PUBLISHED_KEY_PREFIX: &str = "router:published";
/// Prefix of producer-side idempotency markers.
pub const PRODUCER_MARKER_PREFIX: &str = "published";

/// Durable snapshot of the latest accepted event for a job,
/// e.g. `scan:state:job-1`.
pub fn state_key(state_prefix: &str, job_id: &str) -> String {
    format!("{state_prefix}:{job_id}")
}

/// Ledger key holding the highest accepted seq for a job.
pub fn published_key(published_prefix: &str, job_id: &str) -> String {
    format!("{published_prefix}:{job_id}")
}

/// Pub/sub channel carrying deltas for a job.
pub fn channel(channel_prefix: &str, job_id: &str) -> String {
    format!("{channel_prefix}:{job_id}")
}

/// Derive a domain's state prefix from its stream prefix by swapping
/// the trailing `events` segment, e.g. `scan:events` → `scan:state`.
pub fn state_prefix_for_stream(stream_prefix: &str) -> String {
    match stream_prefix.strip_suffix(":events") {
        Some(domain) => format!("{domain}:state"),
        None => format!("{stream_prefix}:state"),
    }
}
