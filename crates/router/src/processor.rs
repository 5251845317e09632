//! Per-entry processing: parse, dedup, persist, republish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use pulso_shared::keys;
use pulso_shared::Envelope;
use tracing::{debug, warn};

use crate::metrics::RouterMetrics;
use crate::store::EventStore;

/// Decides, for one stream entry, whether it may be acknowledged.
///
/// Shared by the live consumers and the reclaimer so both paths apply
/// identical semantics.
pub struct Processor<S> {
    store: Arc<S>,
    metrics: RouterMetrics,
    channel_prefix: String,
    published_prefix: String,
}

impl<S: EventStore> Processor<S> {
    pub fn new(
        store: Arc<S>,
        metrics: RouterMetrics,
        channel_prefix: String,
        published_prefix: String,
    ) -> Self {
        Self {
            store,
            metrics,
            channel_prefix,
            published_prefix,
        }
    }

    /// Returns `true` when the entry is fully handled and must be
    /// acked: accepted and republished, rejected as a duplicate, or
    /// malformed beyond retry. Returns `false` on store failure so
    /// the entry stays pending for the reclaimer.
    pub async fn process(
        &self,
        state_prefix: &str,
        stream_key: &str,
        message_id: &str,
        fields: &HashMap<String, redis::Value>,
    ) -> bool {
        let started = Instant::now();

        let envelope = match Envelope::from_stream_fields(fields) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Re-delivering a malformed entry can never succeed.
                warn!(stream = %stream_key, id = %message_id, error = %e, "dropping malformed entry");
                self.metrics.record_malformed();
                return true;
            }
        };

        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %envelope.job_id, error = %e, "dropping unserializable envelope");
                self.metrics.record_malformed();
                return true;
            }
        };

        let state_key = keys::state_key(state_prefix, &envelope.job_id);
        let seq_key = keys::published_key(&self.published_prefix, &envelope.job_id);

        let accepted = match self
            .store
            .try_accept(&state_key, &seq_key, &payload, envelope.seq)
            .await
        {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(job_id = %envelope.job_id, seq = envelope.seq, error = %e, "dedup check failed, leaving entry pending");
                self.metrics.record_store_error();
                return false;
            }
        };

        if !accepted {
            debug!(job_id = %envelope.job_id, seq = envelope.seq, "duplicate or stale event");
            self.metrics.record_duplicate();
            self.metrics
                .record_process_duration(started.elapsed().as_secs_f64());
            return true;
        }

        // Delta delivery is best effort. On publish failure the entry
        // stays pending so the problem shows up in the backlog; the
        // reclaimed rerun resolves as a duplicate and subscribers
        // catch up from the state snapshot.
        let channel = keys::channel(&self.channel_prefix, &envelope.job_id);
        if let Err(e) = self.store.publish_delta(&channel, &payload).await {
            warn!(job_id = %envelope.job_id, seq = envelope.seq, error = %e, "delta publish failed, leaving entry pending");
            self.metrics.record_store_error();
            return false;
        }

        debug!(
            job_id = %envelope.job_id,
            stage = %envelope.stage,
            seq = envelope.seq,
            "event accepted and republished"
        );
        self.metrics.record_processed();
        self.metrics.record_delta_published();
        self.metrics
            .record_process_duration(started.elapsed().as_secs_f64());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RouterError;
    use async_trait::async_trait;
    use pulso_shared::{Stage, Status};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockStore {
        /// Highest seq per ledger key, mirroring the Lua script.
        ledger: Mutex<HashMap<String, u64>>,
        states: Mutex<HashMap<String, String>>,
        published: Mutex<Vec<(String, String)>>,
        fail_accept: Mutex<bool>,
        fail_publish: Mutex<bool>,
    }

    #[async_trait]
    impl EventStore for MockStore {
        async fn try_accept(
            &self,
            state_key: &str,
            seq_key: &str,
            payload: &str,
            seq: u64,
        ) -> Result<bool, RouterError> {
            if *self.fail_accept.lock().unwrap() {
                return Err(RouterError::Store(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "connection refused",
                ))));
            }
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.get(seq_key).is_some_and(|last| seq <= *last) {
                return Ok(false);
            }
            ledger.insert(seq_key.to_string(), seq);
            self.states
                .lock()
                .unwrap()
                .insert(state_key.to_string(), payload.to_string());
            Ok(true)
        }

        async fn publish_delta(&self, channel: &str, payload: &str) -> Result<(), RouterError> {
            if *self.fail_publish.lock().unwrap() {
                return Err(RouterError::Store(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "connection reset",
                ))));
            }
            self.published
                .lock()
                .unwrap()
                .push((channel.to_string(), payload.to_string()));
            Ok(())
        }

        // The processor never touches the group bookkeeping.
        async fn ack(&self, _stream_key: &str, _message_id: &str) -> Result<(), RouterError> {
            Ok(())
        }

        async fn pending(
            &self,
            _stream_key: &str,
            _count: usize,
        ) -> Result<redis::streams::StreamPendingCountReply, RouterError> {
            Ok(Default::default())
        }

        async fn claim(
            &self,
            _stream_key: &str,
            _consumer: &str,
            _min_idle_ms: usize,
            _ids: &[String],
        ) -> Result<Vec<redis::streams::StreamId>, RouterError> {
            Ok(Vec::new())
        }
    }

    fn fields_for(job_id: &str, stage: Stage, status: Status, seq: u64) -> HashMap<String, redis::Value> {
        let envelope = Envelope {
            job_id: job_id.to_string(),
            stage,
            status,
            seq,
            progress: Some(50),
            result: None,
            ts: 1_700_000_000.0,
        };
        envelope
            .to_stream_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), redis::Value::BulkString(v.into_bytes())))
            .collect()
    }

    fn processor(store: Arc<MockStore>) -> Processor<MockStore> {
        Processor::new(
            store,
            RouterMetrics::new(),
            "sse:events".to_string(),
            "router:published".to_string(),
        )
    }

    #[tokio::test]
    async fn accepted_event_is_persisted_and_republished() {
        let store = Arc::new(MockStore::default());
        let processor = processor(store.clone());

        let fields = fields_for("job-000001", Stage::Vision, Status::Started, 10);
        assert!(processor.process("scan:state", "scan:events:0", "1-0", &fields).await);

        let states = store.states.lock().unwrap();
        assert!(states.contains_key("scan:state:job-000001"));
        let published = store.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "sse:events:job-000001");
    }

    #[tokio::test]
    async fn redelivery_is_acked_without_republish() {
        let store = Arc::new(MockStore::default());
        let processor = processor(store.clone());

        let fields = fields_for("job-000001", Stage::Rule, Status::Completed, 21);
        assert!(processor.process("scan:state", "scan:events:0", "1-0", &fields).await);
        assert!(processor.process("scan:state", "scan:events:0", "1-0", &fields).await);

        assert_eq!(store.published.lock().unwrap().len(), 1);
        assert_eq!(processor.metrics.duplicate_count(), 1);
    }

    #[tokio::test]
    async fn stale_event_after_newer_one_is_rejected() {
        let store = Arc::new(MockStore::default());
        let processor = processor(store.clone());

        let newer = fields_for("job-000001", Stage::Rule, Status::Started, 20);
        let stale = fields_for("job-000001", Stage::Vision, Status::Started, 10);
        assert!(processor.process("scan:state", "scan:events:0", "2-0", &newer).await);
        assert!(processor.process("scan:state", "scan:events:0", "1-0", &stale).await);

        // The snapshot still holds the newer event.
        let states = store.states.lock().unwrap();
        let payload = states.get("scan:state:job-000001").unwrap();
        let envelope: Envelope = serde_json::from_str(payload).unwrap();
        assert_eq!(envelope.seq, 20);
        assert_eq!(store.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_entry_is_handled_without_store_access() {
        let store = Arc::new(MockStore::default());
        let processor = processor(store.clone());

        let mut fields = HashMap::new();
        fields.insert(
            "stage".to_string(),
            redis::Value::BulkString(b"vision".to_vec()),
        );
        assert!(processor.process("scan:state", "scan:events:0", "1-0", &fields).await);

        assert_eq!(processor.metrics.malformed_count(), 1);
        assert!(store.states.lock().unwrap().is_empty());
        assert!(store.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_leaves_entry_pending() {
        let store = Arc::new(MockStore::default());
        *store.fail_accept.lock().unwrap() = true;
        let processor = processor(store.clone());

        let fields = fields_for("job-000001", Stage::Vision, Status::Started, 10);
        assert!(!processor.process("scan:state", "scan:events:0", "1-0", &fields).await);
    }

    #[tokio::test]
    async fn publish_failure_leaves_entry_pending_and_rerun_resolves_as_duplicate() {
        let store = Arc::new(MockStore::default());
        *store.fail_publish.lock().unwrap() = true;
        let processor = processor(store.clone());

        let fields = fields_for("job-000001", Stage::Vision, Status::Started, 10);
        assert!(!processor.process("scan:state", "scan:events:0", "1-0", &fields).await);

        // The rerun hits the dedup as a duplicate (state already
        // written) and is handled without another publish attempt.
        *store.fail_publish.lock().unwrap() = false;
        assert!(processor.process("scan:state", "scan:events:0", "1-0", &fields).await);
        assert!(store.published.lock().unwrap().is_empty());
        assert_eq!(processor.metrics.duplicate_count(), 1);
    }
}
