//! Environment-driven router configuration.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use pulso_shared::keys;

/// One event domain the router consumes, e.g. `scan:events` × 4.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub stream_prefix: String,
    pub shard_count: u32,
    /// State KV prefix, derived from the stream prefix.
    pub state_prefix: String,
}

impl DomainConfig {
    pub fn new(stream_prefix: impl Into<String>, shard_count: u32) -> Self {
        let stream_prefix = stream_prefix.into();
        let state_prefix = keys::state_prefix_for_stream(&stream_prefix);
        Self {
            stream_prefix,
            shard_count,
            state_prefix,
        }
    }

    /// `{prefix}:{shard}` for every shard of this domain.
    pub fn stream_keys(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.shard_count).map(|shard| format!("{}:{shard}", self.stream_prefix))
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Streams connection (XREADGROUP/XACK/XCLAIM and the dedup script).
    pub redis_streams_url: String,
    /// Pub/sub connection (PUBLISH only); may point at the same server.
    pub redis_pubsub_url: String,
    pub domains: Vec<DomainConfig>,
    pub consumer_group: String,
    /// Per-process consumer identity; fresh on every start so a
    /// crashed pod's pending entries become reclaimable.
    pub consumer_name: String,
    pub xread_count: usize,
    pub xread_block_ms: usize,
    pub reclaim_interval: Duration,
    pub reclaim_min_idle: Duration,
    /// Max pending entries inspected per shard per reclaim pass.
    pub reclaim_batch: usize,
    pub state_ttl: u64,
    pub published_ttl: u64,
    pub channel_prefix: String,
    pub published_prefix: String,
    pub http_addr: SocketAddr,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            redis_streams_url: "redis://localhost:6379".to_string(),
            redis_pubsub_url: "redis://localhost:6379".to_string(),
            domains: vec![
                DomainConfig::new(keys::SCAN_STREAM_PREFIX, 4),
                DomainConfig::new(keys::CHAT_STREAM_PREFIX, 4),
            ],
            consumer_group: "event-router".to_string(),
            consumer_name: consumer_identity(),
            xread_count: 32,
            xread_block_ms: 5_000,
            reclaim_interval: Duration::from_secs(60),
            reclaim_min_idle: Duration::from_secs(300),
            reclaim_batch: 100,
            state_ttl: 3_600,
            published_ttl: 7_200,
            channel_prefix: keys::PUBSUB_CHANNEL_PREFIX.to_string(),
            published_prefix: keys::PUBLISHED_KEY_PREFIX.to_string(),
            http_addr: "0.0.0.0:8080".parse().unwrap(),
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let domains = match env::var("ROUTER_DOMAINS") {
            Ok(spec) => parse_domains(&spec)?,
            Err(_) => defaults.domains,
        };

        let http_port: u16 = env::var("ROUTER_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()?;

        Ok(Self {
            redis_streams_url: env::var("ROUTER_REDIS_STREAMS_URL")
                .unwrap_or(defaults.redis_streams_url),
            redis_pubsub_url: env::var("ROUTER_REDIS_PUBSUB_URL")
                .unwrap_or(defaults.redis_pubsub_url),
            domains,
            consumer_group: env::var("ROUTER_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            consumer_name: consumer_identity(),
            xread_count: env_parse("ROUTER_XREAD_COUNT", defaults.xread_count)?,
            xread_block_ms: env_parse("ROUTER_XREAD_BLOCK_MS", defaults.xread_block_ms)?,
            reclaim_interval: Duration::from_secs(env_parse(
                "ROUTER_RECLAIM_INTERVAL_SECONDS",
                defaults.reclaim_interval.as_secs(),
            )?),
            reclaim_min_idle: Duration::from_secs(env_parse(
                "ROUTER_RECLAIM_MIN_IDLE_SECONDS",
                defaults.reclaim_min_idle.as_secs(),
            )?),
            reclaim_batch: env_parse("ROUTER_RECLAIM_BATCH", defaults.reclaim_batch)?,
            state_ttl: env_parse("ROUTER_STATE_TTL", defaults.state_ttl)?,
            published_ttl: env_parse("ROUTER_PUBLISHED_TTL", defaults.published_ttl)?,
            channel_prefix: env::var("ROUTER_PUBSUB_CHANNEL_PREFIX")
                .unwrap_or(defaults.channel_prefix),
            published_prefix: env::var("ROUTER_PUBLISHED_PREFIX")
                .unwrap_or(defaults.published_prefix),
            http_addr: format!("0.0.0.0:{http_port}").parse()?,
        })
    }
}

/// `{POD_NAME or "router"}-{nonce}`. The nonce makes every process
/// start a new consumer, leaving a crashed predecessor's pending
/// entries orphaned under its old name for the reclaimer.
pub fn consumer_identity() -> String {
    let pod = env::var("POD_NAME").unwrap_or_else(|_| "router".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{pod}-{}", &nonce[..8])
}

/// Parse `prefix:count[,prefix:count...]`, e.g. `scan:events:4,chat:events:4`.
fn parse_domains(spec: &str) -> anyhow::Result<Vec<DomainConfig>> {
    let mut domains = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (prefix, count) = entry
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid domain spec '{entry}'"))?;
        let shard_count: u32 = count
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid shard count in '{entry}'"))?;
        if prefix.is_empty() || shard_count == 0 {
            anyhow::bail!("invalid domain spec '{entry}'");
        }
        domains.push(DomainConfig::new(prefix, shard_count));
    }
    if domains.is_empty() {
        anyhow::bail!("no domains configured");
    }
    Ok(domains)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}
