//! Shard consumer loop.
//!
//! One task per (domain, shard). Each task owns a dedicated Redis
//! connection because XREADGROUP BLOCK would otherwise stall every
//! command multiplexed on the shared one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::processor::Processor;
use crate::store::{EventStore, RedisEventStore, RouterError};

pub struct ShardConsumer {
    store: Arc<RedisEventStore>,
    processor: Arc<Processor<RedisEventStore>>,
    stream_key: String,
    state_prefix: String,
    consumer_name: String,
    read_count: usize,
    block_ms: usize,
}

impl ShardConsumer {
    pub fn new(
        store: Arc<RedisEventStore>,
        processor: Arc<Processor<RedisEventStore>>,
        config: &RouterConfig,
        stream_key: String,
        state_prefix: String,
    ) -> Self {
        Self {
            store,
            processor,
            stream_key,
            state_prefix,
            consumer_name: config.consumer_name.clone(),
            read_count: config.xread_count,
            block_ms: config.xread_block_ms,
        }
    }

    /// Read-process-ack until shutdown. Read errors back off and
    /// retry; entries that fail processing are left pending for the
    /// reclaimer.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RouterError> {
        let mut conn = self.store.dedicated_connection().await?;
        info!(
            stream = %self.stream_key,
            consumer = %self.consumer_name,
            "shard consumer started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(stream = %self.stream_key, "shard consumer stopping");
                    return Ok(());
                }
                read = self.store.read_group(
                    &mut conn,
                    &self.stream_key,
                    &self.consumer_name,
                    self.read_count,
                    self.block_ms,
                ) => {
                    match read {
                        Ok(reply) => self.drain(reply).await,
                        Err(e) => {
                            warn!(stream = %self.stream_key, error = %e, "stream read failed, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    async fn drain(&self, reply: redis::streams::StreamReadReply) {
        for stream in reply.keys {
            for entry in stream.ids {
                let handled = self
                    .processor
                    .process(&self.state_prefix, &self.stream_key, &entry.id, &entry.map)
                    .await;
                if !handled {
                    continue;
                }
                if let Err(e) = self.store.ack(&self.stream_key, &entry.id).await {
                    // An unacked handled entry is redelivered and
                    // then resolved as a duplicate.
                    warn!(stream = %self.stream_key, id = %entry.id, error = %e, "ack failed");
                } else {
                    debug!(stream = %self.stream_key, id = %entry.id, "acked");
                }
            }
        }
    }
}
