//! Environment-driven gateway configuration.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use pulso_shared::keys;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub redis_url: String,
    /// Pub/sub channel prefix the router publishes deltas on.
    pub channel_prefix: String,
    /// State KV prefixes probed for a job's snapshot, in order.
    pub state_prefixes: Vec<String>,
    pub keepalive: Duration,
    /// Hard per-connection lifetime; hitting it ends the stream with
    /// a timeout error event.
    pub max_wait: Duration,
    /// Idle time after which the snapshot is re-read, covering deltas
    /// lost to pub/sub's at-most-once delivery.
    pub state_repoll: Duration,
    /// Per-room fanout buffer; a slow consumer loses oldest first.
    pub queue_capacity: usize,
    pub min_job_id_len: usize,
    pub http_addr: SocketAddr,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            channel_prefix: keys::PUBSUB_CHANNEL_PREFIX.to_string(),
            state_prefixes: vec![
                keys::state_prefix_for_stream(keys::SCAN_STREAM_PREFIX),
                keys::state_prefix_for_stream(keys::CHAT_STREAM_PREFIX),
            ],
            keepalive: Duration::from_secs(15),
            max_wait: Duration::from_secs(300),
            state_repoll: Duration::from_secs(30),
            queue_capacity: 100,
            min_job_id_len: 10,
            http_addr: "0.0.0.0:8081".parse().unwrap(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let state_prefixes = match env::var("GATEWAY_STATE_PREFIXES") {
            Ok(spec) => {
                let prefixes: Vec<String> = spec
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if prefixes.is_empty() {
                    anyhow::bail!("GATEWAY_STATE_PREFIXES is empty");
                }
                prefixes
            }
            Err(_) => defaults.state_prefixes,
        };

        let http_port: u16 = env::var("GATEWAY_HTTP_PORT")
            .unwrap_or_else(|_| "8081".to_string())
            .parse()?;

        Ok(Self {
            redis_url: env::var("GATEWAY_REDIS_URL").unwrap_or(defaults.redis_url),
            channel_prefix: env::var("GATEWAY_PUBSUB_CHANNEL_PREFIX")
                .unwrap_or(defaults.channel_prefix),
            state_prefixes,
            keepalive: Duration::from_secs(env_parse(
                "GATEWAY_KEEPALIVE_SECONDS",
                defaults.keepalive.as_secs(),
            )?),
            max_wait: Duration::from_secs(env_parse(
                "GATEWAY_MAX_WAIT_SECONDS",
                defaults.max_wait.as_secs(),
            )?),
            state_repoll: Duration::from_secs(env_parse(
                "GATEWAY_STATE_REPOLL_SECONDS",
                defaults.state_repoll.as_secs(),
            )?),
            queue_capacity: env_parse("GATEWAY_QUEUE_CAPACITY", defaults.queue_capacity)?,
            min_job_id_len: env_parse("GATEWAY_MIN_JOB_ID_LEN", defaults.min_job_id_len)?,
            http_addr: format!("0.0.0.0:{http_port}").parse()?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.keepalive, Duration::from_secs(15));
        assert_eq!(config.max_wait, Duration::from_secs(300));
        assert_eq!(config.state_repoll, Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.min_job_id_len, 10);
        assert_eq!(
            config.state_prefixes,
            vec!["scan:state".to_string(), "chat:state".to_string()]
        );
    }

    #[test]
    fn repoll_shorter_than_keepalive_budget() {
        // The re-poll must be reachable well before max wait expires.
        let config = GatewayConfig::default();
        assert!(config.state_repoll < config.max_wait);
        assert!(config.keepalive < config.state_repoll * 2);
    }
}
