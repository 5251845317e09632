//! Store access for the router.
//!
//! [`EventStore`] is the seam the processor is tested through; the
//! Redis implementation runs the dedup check-and-set as one Lua
//! script so no other consumer or reclaimer can interleave between
//! the seq check and the state write.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Script};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),
}

/// The store effects the processing and recovery paths need; the
/// consumers and the reclaimer face the store through this trait so
/// their logic unit-tests against an in-memory impl.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically: read the highest accepted seq for the job; if this
    /// event is newer, write the state snapshot and the new ledger
    /// value (each with its TTL) and return `true`; otherwise leave
    /// everything untouched and return `false`.
    async fn try_accept(
        &self,
        state_key: &str,
        seq_key: &str,
        payload: &str,
        seq: u64,
    ) -> Result<bool, RouterError>;

    /// Fire-and-forget delta broadcast to currently connected
    /// gateway subscribers.
    async fn publish_delta(&self, channel: &str, payload: &str) -> Result<(), RouterError>;

    async fn ack(&self, stream_key: &str, message_id: &str) -> Result<(), RouterError>;

    /// Pending entries of the group on one shard, oldest first.
    async fn pending(
        &self,
        stream_key: &str,
        count: usize,
    ) -> Result<StreamPendingCountReply, RouterError>;

    /// Claim entries idle for at least `min_idle_ms` under `consumer`.
    async fn claim(
        &self,
        stream_key: &str,
        consumer: &str,
        min_idle_ms: usize,
        ids: &[String],
    ) -> Result<Vec<StreamId>, RouterError>;
}

// KEYS[1] = state key, KEYS[2] = seq ledger key.
// ARGV[1] = payload, ARGV[2] = seq, ARGV[3] = state TTL, ARGV[4] = ledger TTL.
// The ledger TTL outlives the state TTL so a late redelivery after
// state expiry is still rejected.
const ACCEPT_EVENT_SCRIPT: &str = r#"
local last = redis.call('GET', KEYS[2])
if last and tonumber(ARGV[2]) <= tonumber(last) then
    return 0
end

redis.call('SETEX', KEYS[1], tonumber(ARGV[3]), ARGV[1])
redis.call('SETEX', KEYS[2], tonumber(ARGV[4]), ARGV[2])

return 1
"#;

pub struct RedisEventStore {
    streams_client: redis::Client,
    /// Shared connection for non-blocking commands (ack, pending,
    /// claim, script). Blocking XREADGROUPs use dedicated
    /// connections, see [`Self::dedicated_connection`].
    conn: ConnectionManager,
    pubsub_conn: ConnectionManager,
    script: Script,
    group: String,
    state_ttl: u64,
    published_ttl: u64,
}

impl RedisEventStore {
    pub async fn connect(
        streams_url: &str,
        pubsub_url: &str,
        group: String,
        state_ttl: u64,
        published_ttl: u64,
    ) -> Result<Self, RouterError> {
        let streams_client = redis::Client::open(streams_url)?;
        let pubsub_client = redis::Client::open(pubsub_url)?;
        let conn = streams_client.get_connection_manager().await?;
        let pubsub_conn = pubsub_client.get_connection_manager().await?;
        Ok(Self {
            streams_client,
            conn,
            pubsub_conn,
            script: Script::new(ACCEPT_EVENT_SCRIPT),
            group,
            state_ttl,
            published_ttl,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// A connection of its own for a blocking reader, so XREADGROUP
    /// BLOCK never stalls acks or the dedup script.
    pub async fn dedicated_connection(&self) -> Result<ConnectionManager, RouterError> {
        Ok(self.streams_client.get_connection_manager().await?)
    }

    /// Create the consumer group, tolerating one that already exists.
    pub async fn ensure_group(&self, stream_key: &str) -> Result<(), RouterError> {
        let mut conn = self.conn.clone();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(stream_key, &self.group, "$")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_group(
        &self,
        conn: &mut ConnectionManager,
        stream_key: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<StreamReadReply, RouterError> {
        let opts = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(count)
            .block(block_ms);
        let reply: StreamReadReply = conn
            .xread_options(&[stream_key], &[">"], &opts)
            .await?;
        Ok(reply)
    }

    /// Total unacknowledged backlog of the group on one shard.
    pub async fn backlog(&self, stream_key: &str) -> Result<usize, RouterError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(stream_key, &self.group).await?;
        Ok(reply.count())
    }

    pub async fn ping(&self) -> Result<(), RouterError> {
        let mut conn = self.conn.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn try_accept(
        &self,
        state_key: &str,
        seq_key: &str,
        payload: &str,
        seq: u64,
    ) -> Result<bool, RouterError> {
        let mut conn = self.conn.clone();
        let accepted: i64 = self
            .script
            .key(state_key)
            .key(seq_key)
            .arg(payload)
            .arg(seq)
            .arg(self.state_ttl)
            .arg(self.published_ttl)
            .invoke_async(&mut conn)
            .await?;
        Ok(accepted == 1)
    }

    async fn publish_delta(&self, channel: &str, payload: &str) -> Result<(), RouterError> {
        let mut conn = self.pubsub_conn.clone();
        let _receivers: u64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn ack(&self, stream_key: &str, message_id: &str) -> Result<(), RouterError> {
        let mut conn = self.conn.clone();
        let _acked: u64 = conn.xack(stream_key, &self.group, &[message_id]).await?;
        Ok(())
    }

    async fn pending(
        &self,
        stream_key: &str,
        count: usize,
    ) -> Result<StreamPendingCountReply, RouterError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream_key, &self.group, "-", "+", count)
            .await?;
        Ok(reply)
    }

    // The server re-checks idleness, so a racing reclaimer on another
    // pod simply claims fewer entries.
    async fn claim(
        &self,
        stream_key: &str,
        consumer: &str,
        min_idle_ms: usize,
        ids: &[String],
    ) -> Result<Vec<StreamId>, RouterError> {
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn
            .xclaim(stream_key, &self.group, consumer, min_idle_ms, ids)
            .await?;
        Ok(reply.ids)
    }
}
