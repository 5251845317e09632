//! State snapshot access.
//!
//! The gateway only ever reads. [`StateReader`] is the seam the
//! stream logic is tested through.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use pulso_shared::{keys, Envelope};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),
}

#[async_trait]
pub trait StateReader: Send + Sync {
    /// Latest accepted event for the job, or `None` when nothing has
    /// been routed yet (or the snapshot expired).
    async fn snapshot(&self, job_id: &str) -> Result<Option<Envelope>, GatewayError>;
}

pub struct RedisStateReader {
    conn: ConnectionManager,
    state_prefixes: Vec<String>,
}

impl RedisStateReader {
    pub fn new(conn: ConnectionManager, state_prefixes: Vec<String>) -> Self {
        Self {
            conn,
            state_prefixes,
        }
    }

    pub async fn ping(&self) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl StateReader for RedisStateReader {
    async fn snapshot(&self, job_id: &str) -> Result<Option<Envelope>, GatewayError> {
        let mut conn = self.conn.clone();
        // Jobs live in exactly one domain; probe prefixes in order.
        for prefix in &self.state_prefixes {
            let key = keys::state_key(prefix, job_id);
            let raw: Option<String> = conn.get(&key).await?;
            let Some(raw) = raw else { continue };
            match serde_json::from_str(&raw) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => {
                    // The router only writes well-formed JSON; treat
                    // anything else as absent rather than failing the
                    // subscription.
                    warn!(key = %key, error = %e, "unreadable state snapshot");
                }
            }
        }
        Ok(None)
    }
}
