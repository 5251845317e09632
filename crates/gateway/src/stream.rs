//! The per-connection subscription flow.
//!
//! Every connection replays the durable snapshot first, then follows
//! live deltas, filtered so `seq` never goes backwards on one stream.
//! Quiet periods produce keepalives and an occasional snapshot
//! re-poll; the max wait limit ends the stream with an error event.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use pulso_shared::Envelope;

use crate::broadcast::BroadcastManager;
use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::state::StateReader;

/// What the SSE layer sends, before wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Stage(Envelope),
    Keepalive,
    Error {
        error: &'static str,
        message: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub keepalive: Duration,
    pub max_wait: Duration,
    pub state_repoll: Duration,
}

impl From<&GatewayConfig> for StreamSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            keepalive: config.keepalive,
            max_wait: config.max_wait,
            state_repoll: config.state_repoll,
        }
    }
}

struct ConnectionGuard(GatewayMetrics);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.subscriber_disconnected();
    }
}

/// The event stream for one subscriber of one job.
///
/// Dropping the stream (the client went away) releases the room
/// membership and the subscriber gauge through drop guards.
pub fn job_stream(
    manager: BroadcastManager,
    reader: Arc<dyn StateReader>,
    metrics: GatewayMetrics,
    settings: StreamSettings,
    job_id: String,
) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        metrics.subscriber_connected();
        let _guard = ConnectionGuard(metrics.clone());

        let snapshot = match reader.snapshot(&job_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "snapshot read failed");
                yield StreamEvent::Error {
                    error: "unavailable",
                    message: "State store unavailable",
                };
                return;
            }
        };

        // A job already in a terminal state needs no live feed.
        if let Some(envelope) = &snapshot {
            if envelope.is_terminal() {
                metrics.record_snapshot();
                yield StreamEvent::Stage(envelope.clone());
                return;
            }
        }

        // Join the room before replaying the snapshot so no delta can
        // fall between the two.
        let mut subscription = manager.attach(&job_id);
        let mut last_seq = 0u64;

        if let Some(envelope) = snapshot {
            last_seq = envelope.seq;
            metrics.record_snapshot();
            yield StreamEvent::Stage(envelope);
        }

        let deadline = Instant::now() + settings.max_wait;
        let mut last_poll = Instant::now();

        loop {
            // Checked every iteration: a steady delta feed must not
            // keep a connection alive past the ceiling.
            if Instant::now() >= deadline {
                debug!(job_id = %job_id, "max wait reached");
                metrics.record_timeout();
                yield StreamEvent::Error {
                    error: "timeout",
                    message: "Maximum wait time exceeded",
                };
                return;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = settings.keepalive.min(remaining);
            match tokio::time::timeout(wait, subscription.rx.recv()).await {
                Ok(Ok(envelope)) => {
                    // Replays and out-of-order deltas never move a
                    // stream backwards.
                    if envelope.seq <= last_seq {
                        continue;
                    }
                    last_seq = envelope.seq;
                    metrics.record_delivered();
                    let terminal = envelope.is_terminal();
                    yield StreamEvent::Stage(envelope);
                    if terminal {
                        return;
                    }
                }
                Ok(Err(RecvError::Lagged(missed))) => {
                    // This connection fell behind; the oldest buffered
                    // deltas are gone, newer ones follow.
                    metrics.record_dropped(missed);
                }
                Ok(Err(RecvError::Closed)) => {
                    debug!(job_id = %job_id, "room closed, ending stream");
                    return;
                }
                Err(_elapsed) => {
                    // At the deadline the loop head emits the timeout
                    // error, not another keepalive.
                    if Instant::now() >= deadline {
                        continue;
                    }

                    metrics.record_keepalive();
                    yield StreamEvent::Keepalive;

                    // Pub/sub is at most once; a long-quiet stream
                    // re-checks the snapshot for anything it missed.
                    if last_poll.elapsed() >= settings.state_repoll {
                        last_poll = Instant::now();
                        match reader.snapshot(&job_id).await {
                            Ok(Some(envelope)) if envelope.seq > last_seq => {
                                last_seq = envelope.seq;
                                metrics.record_snapshot();
                                let terminal = envelope.is_terminal();
                                yield StreamEvent::Stage(envelope);
                                if terminal {
                                    return;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(job_id = %job_id, error = %e, "snapshot re-poll failed");
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GatewayError;
    use async_trait::async_trait;
    use futures::StreamExt;
    use pulso_shared::{Stage, Status};
    use std::sync::Mutex;

    struct MockReader {
        snapshot: Mutex<Option<Envelope>>,
    }

    impl MockReader {
        fn new(snapshot: Option<Envelope>) -> Arc<Self> {
            Arc::new(Self {
                snapshot: Mutex::new(snapshot),
            })
        }

        fn set(&self, snapshot: Option<Envelope>) {
            *self.snapshot.lock().unwrap() = snapshot;
        }
    }

    #[async_trait]
    impl StateReader for MockReader {
        async fn snapshot(&self, _job_id: &str) -> Result<Option<Envelope>, GatewayError> {
            Ok(self.snapshot.lock().unwrap().clone())
        }
    }

    fn manager() -> BroadcastManager {
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        BroadcastManager::new(client, "sse:events".to_string(), 8, GatewayMetrics::new())
    }

    fn envelope(seq: u64, stage: Stage, status: Status) -> Envelope {
        Envelope {
            job_id: "job-000001".to_string(),
            stage,
            status,
            seq,
            progress: None,
            result: None,
            ts: 0.0,
        }
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            keepalive: Duration::from_secs(1),
            max_wait: Duration::from_secs(5),
            state_repoll: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_snapshot_short_circuits() {
        let manager = manager();
        let reader = MockReader::new(Some(envelope(51, Stage::Done, Status::Completed)));
        let mut stream = Box::pin(job_stream(
            manager.clone(),
            reader,
            GatewayMetrics::new(),
            settings(),
            "job-000001".to_string(),
        ));

        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Stage(e) if e.seq == 51));
        assert!(stream.next().await.is_none());
        // No room was ever created for a finished job.
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_replays_before_live_deltas() {
        let manager = manager();
        let reader = MockReader::new(Some(envelope(10, Stage::Vision, Status::Started)));
        let mut stream = Box::pin(job_stream(
            manager.clone(),
            reader,
            GatewayMetrics::new(),
            settings(),
            "job-000001".to_string(),
        ));

        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Stage(e) if e.seq == 10));

        manager.publish_local("job-000001", envelope(20, Stage::Rule, Status::Started));
        let second = stream.next().await.unwrap();
        assert!(matches!(second, StreamEvent::Stage(e) if e.seq == 20));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_deltas_are_filtered() {
        let manager = manager();
        let reader = MockReader::new(Some(envelope(20, Stage::Rule, Status::Started)));
        let mut stream = Box::pin(job_stream(
            manager.clone(),
            reader,
            GatewayMetrics::new(),
            settings(),
            "job-000001".to_string(),
        ));

        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Stage(e) if e.seq == 20));

        // The replayed vision delta is older than the snapshot.
        manager.publish_local("job-000001", envelope(10, Stage::Vision, Status::Started));
        manager.publish_local("job-000001", envelope(30, Stage::Answer, Status::Started));
        let second = stream.next().await.unwrap();
        assert!(matches!(second, StreamEvent::Stage(e) if e.seq == 30));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_delta_ends_the_stream() {
        let manager = manager();
        let reader = MockReader::new(None);
        let mut stream = Box::pin(job_stream(
            manager.clone(),
            reader,
            GatewayMetrics::new(),
            settings(),
            "job-000001".to_string(),
        ));

        // First poll runs up to the room attach.
        let poll = futures::poll!(stream.next());
        assert!(poll.is_pending());
        manager.publish_local("job-000001", envelope(51, Stage::Done, Status::Completed));

        let event = stream.next().await.unwrap();
        assert!(matches!(event, StreamEvent::Stage(e) if e.is_terminal()));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_stream_sends_keepalives_then_times_out() {
        let manager = manager();
        let reader = MockReader::new(None);
        let mut stream = Box::pin(job_stream(
            manager,
            reader,
            GatewayMetrics::new(),
            settings(),
            "job-000001".to_string(),
        ));

        let mut keepalives = 0;
        loop {
            match stream.next().await.unwrap() {
                StreamEvent::Keepalive => keepalives += 1,
                StreamEvent::Error { error, .. } => {
                    assert_eq!(error, "timeout");
                    break;
                }
                StreamEvent::Stage(e) => panic!("unexpected stage event {e:?}"),
            }
        }
        // One keepalive per second until the 5s limit.
        assert_eq!(keepalives, 4);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repoll_recovers_a_missed_delta() {
        let manager = manager();
        let reader = MockReader::new(None);
        let mut stream = Box::pin(job_stream(
            manager,
            reader.clone(),
            GatewayMetrics::new(),
            settings(),
            "job-000001".to_string(),
        ));

        // The connect-time snapshot was empty; only after the stream
        // is live does the state KV gain an event, and the matching
        // delta never arrives over pub/sub.
        assert_eq!(stream.next().await.unwrap(), StreamEvent::Keepalive);
        reader.set(Some(envelope(30, Stage::Answer, Status::Started)));

        assert_eq!(stream.next().await.unwrap(), StreamEvent::Keepalive);
        let recovered = stream.next().await.unwrap();
        assert!(matches!(recovered, StreamEvent::Stage(e) if e.seq == 30));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_stream_still_hits_max_wait() {
        let manager = manager();
        let reader = MockReader::new(None);
        let mut stream = Box::pin(job_stream(
            manager.clone(),
            reader,
            GatewayMetrics::new(),
            settings(),
            "job-000001".to_string(),
        ));

        let poll = futures::poll!(stream.next());
        assert!(poll.is_pending());
        manager.publish_local("job-000001", envelope(10, Stage::Vision, Status::Started));
        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Stage(e) if e.seq == 10));

        // A delta is already queued when the ceiling passes; the
        // stream must end with the timeout error, not deliver it.
        tokio::time::advance(Duration::from_secs(6)).await;
        manager.publish_local("job-000001", envelope(20, Stage::Rule, Status::Started));

        let last = stream.next().await.unwrap();
        assert!(matches!(last, StreamEvent::Error { error: "timeout", .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_stream_releases_the_room() {
        let manager = manager();
        let reader = MockReader::new(None);
        let mut stream = Box::pin(job_stream(
            manager.clone(),
            reader,
            GatewayMetrics::new(),
            settings(),
            "job-000001".to_string(),
        ));

        let poll = futures::poll!(stream.next());
        assert!(poll.is_pending());
        assert_eq!(manager.room_count(), 1);

        drop(stream);
        assert_eq!(manager.room_count(), 0);
    }
}
