//! Producer-side event publishing.
//!
//! Workers call [`EventProducer::publish_stage_event`] once per stage
//! transition. The append is idempotent: a Lua script checks a
//! per-(job, stage, seq) marker before the `XADD`, so task-level
//! retries never double-append. State updates are NOT done here; the
//! event router is the single authority for the State KV.

use std::time::{SystemTime, UNIX_EPOCH};

use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;

use crate::envelope::{Envelope, Stage, Status};
use crate::error::ProtocolError;
use crate::keys::PRODUCER_MARKER_PREFIX;
use crate::sharding::{shard_for_job, stream_key};

// Check the idempotency marker and append in one atomic unit.
// KEYS[1] = published:{job_id}:{stage}:{seq}, KEYS[2] = sharded stream.
const IDEMPOTENT_XADD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    local existing_msg_id = redis.call('GET', KEYS[1])
    return {0, existing_msg_id}
end

local msg_id = redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[1],
    '*',
    'job_id', ARGV[2],
    'stage', ARGV[3],
    'status', ARGV[4],
    'seq', ARGV[5],
    'ts', ARGV[6],
    'progress', ARGV[7],
    'result', ARGV[8]
)

redis.call('SETEX', KEYS[1], ARGV[9], msg_id)

return {1, msg_id}
"#;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub stream_prefix: String,
    pub shard_count: u32,
    /// `XADD MAXLEN ~` bound per shard.
    pub stream_maxlen: u64,
    /// TTL of the idempotency marker, seconds.
    pub published_ttl: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            stream_prefix: crate::keys::SCAN_STREAM_PREFIX.to_string(),
            shard_count: 4,
            stream_maxlen: 10_000,
            published_ttl: 7_200,
        }
    }
}

/// Result of one publish attempt.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// False when the marker already existed and nothing was appended.
    pub appended: bool,
    /// Stream id of the (new or previously appended) entry.
    pub message_id: String,
    pub seq: u64,
    pub shard: u32,
}

/// Monotonic per-job seq derived from the pipeline position.
///
/// Each stage owns a band of ten: `started` lands on the band floor,
/// `completed` one above it, so redelivery of the same transition
/// always reproduces the same seq.
pub fn seq_for(stage: Stage, status: Status) -> u64 {
    stage.order() * 10 + u64::from(status == Status::Completed)
}

pub struct EventProducer {
    conn: ConnectionManager,
    script: Script,
    config: ProducerConfig,
}

impl EventProducer {
    pub fn new(conn: ConnectionManager, config: ProducerConfig) -> Self {
        Self {
            conn,
            script: Script::new(IDEMPOTENT_XADD_SCRIPT),
            config,
        }
    }

    /// Append a stage transition to the job's shard, exactly once per
    /// distinct `(job_id, stage, seq)` even under producer retries.
    pub async fn publish_stage_event(
        &self,
        job_id: &str,
        stage: Stage,
        status: Status,
        progress: Option<u8>,
        result: Option<serde_json::Value>,
    ) -> Result<PublishOutcome, ProtocolError> {
        let seq = seq_for(stage, status);
        let shard = shard_for_job(job_id, self.config.shard_count);
        let stream = stream_key(&self.config.stream_prefix, job_id, self.config.shard_count);
        let marker = format!("{PRODUCER_MARKER_PREFIX}:{job_id}:{stage}:{seq}");

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let progress_arg = progress.map(|p| p.to_string()).unwrap_or_default();
        let result_arg = result.as_ref().map(|r| r.to_string()).unwrap_or_default();

        let mut conn = self.conn.clone();
        let (is_new, message_id): (i64, String) = self
            .script
            .key(&marker)
            .key(&stream)
            .arg(self.config.stream_maxlen)
            .arg(job_id)
            .arg(stage.as_str())
            .arg(status.as_str())
            .arg(seq)
            .arg(ts)
            .arg(&progress_arg)
            .arg(&result_arg)
            .arg(self.config.published_ttl)
            .invoke_async(&mut conn)
            .await?;

        let appended = is_new == 1;
        if appended {
            debug!(job_id, %stage, %status, seq, shard, stream = %stream, message_id = %message_id, "stage event published");
        } else {
            debug!(job_id, %stage, seq, shard, message_id = %message_id, "stage event already published, skipped");
        }

        Ok(PublishOutcome {
            appended,
            message_id,
            seq,
            shard,
        })
    }

    /// Envelope as the router will reconstruct it, useful for tests
    /// and for callers that log what they emitted.
    pub fn envelope_for(
        &self,
        job_id: &str,
        stage: Stage,
        status: Status,
        progress: Option<u8>,
        result: Option<serde_json::Value>,
    ) -> Envelope {
        Envelope {
            job_id: job_id.to_string(),
            stage,
            status,
            seq: seq_for(stage, status),
            progress,
            result,
            ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_follows_stage_order() {
        assert_eq!(seq_for(Stage::Queued, Status::Started), 0);
        assert_eq!(seq_for(Stage::Vision, Status::Started), 10);
        assert_eq!(seq_for(Stage::Vision, Status::Completed), 11);
        assert_eq!(seq_for(Stage::Rule, Status::Completed), 21);
        assert_eq!(seq_for(Stage::Done, Status::Completed), 51);
    }

    #[test]
    fn seq_is_strictly_increasing_along_the_pipeline() {
        let transitions = [
            (Stage::Queued, Status::Started),
            (Stage::Vision, Status::Started),
            (Stage::Vision, Status::Completed),
            (Stage::Rule, Status::Started),
            (Stage::Rule, Status::Completed),
            (Stage::Answer, Status::Completed),
            (Stage::Reward, Status::Completed),
            (Stage::Done, Status::Completed),
        ];
        let seqs: Vec<u64> = transitions.iter().map(|(st, s)| seq_for(*st, *s)).collect();
        for pair in seqs.windows(2) {
            assert!(pair[0] < pair[1], "seq must increase: {seqs:?}");
        }
    }

    #[test]
    fn only_completed_bumps_within_the_band() {
        assert_eq!(
            seq_for(Stage::Answer, Status::Failed),
            seq_for(Stage::Answer, Status::Started)
        );
        assert_eq!(
            seq_for(Stage::Answer, Status::Completed),
            seq_for(Stage::Answer, Status::Started) + 1
        );
    }
}
