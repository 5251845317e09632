//! Per-job rooms fanning the router's delta feed out to subscribers.
//!
//! A room exists only while it has subscribers: the first attach
//! spawns one pub/sub listener for the job's channel, the last detach
//! tears it down. Fanout goes through a bounded broadcast channel, so
//! a slow connection lags and loses oldest events instead of blocking
//! the room.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulso_shared::{keys, Envelope};

use crate::metrics::GatewayMetrics;

struct Room {
    tx: broadcast::Sender<Envelope>,
    listener: JoinHandle<()>,
}

#[derive(Clone)]
pub struct BroadcastManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    client: redis::Client,
    channel_prefix: String,
    queue_capacity: usize,
    metrics: GatewayMetrics,
    rooms: DashMap<String, Room>,
}

impl BroadcastManager {
    pub fn new(
        client: redis::Client,
        channel_prefix: String,
        queue_capacity: usize,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                client,
                channel_prefix,
                queue_capacity,
                metrics,
                rooms: DashMap::new(),
            }),
        }
    }

    /// Join the room for `job_id`, creating it (and its channel
    /// listener) on first use. The subscription deregisters itself on
    /// drop.
    pub fn attach(&self, job_id: &str) -> RoomSubscription {
        let rx = match self.inner.rooms.entry(job_id.to_string()) {
            Entry::Occupied(room) => room.get().tx.subscribe(),
            Entry::Vacant(slot) => {
                // Lag eviction drops oldest first, so the terminal
                // event, always the newest on a finished job, stays
                // reachable for a slow subscriber.
                let (tx, rx) = broadcast::channel(self.inner.queue_capacity);
                let listener = self.spawn_listener(job_id.to_string(), tx.clone());
                slot.insert(Room { tx, listener });
                self.inner.metrics.room_opened();
                debug!(job_id = %job_id, "room opened");
                rx
            }
        };
        RoomSubscription {
            rx,
            guard: RoomGuard {
                manager: self.clone(),
                job_id: job_id.to_string(),
            },
        }
    }

    /// One pub/sub connection per room. Deltas missed while the
    /// subscription is still being set up are covered by the
    /// connection's snapshot re-poll.
    fn spawn_listener(&self, job_id: String, tx: broadcast::Sender<Envelope>) -> JoinHandle<()> {
        let client = self.inner.client.clone();
        let channel = keys::channel(&self.inner.channel_prefix, &job_id);
        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "pubsub connect failed");
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                warn!(channel = %channel, error = %e, "pubsub subscribe failed");
                return;
            }

            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "undecodable delta payload");
                        continue;
                    }
                };
                match serde_json::from_str::<Envelope>(&payload) {
                    // A send error only means no receiver right now.
                    Ok(envelope) => {
                        let _ = tx.send(envelope);
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "malformed delta, skipping");
                    }
                }
            }
            debug!(channel = %channel, "pubsub listener ended");
        })
    }

    /// Close the room if the departing subscriber was the last one.
    /// The entry lock serializes this against a concurrent attach, so
    /// a new subscriber either joins before the check or creates a
    /// fresh room after the removal.
    fn release(&self, job_id: &str) {
        if let Entry::Occupied(room) = self.inner.rooms.entry(job_id.to_string()) {
            if room.get().tx.receiver_count() == 0 {
                let (_, room) = room.remove_entry();
                room.listener.abort();
                self.inner.metrics.room_closed();
                debug!(job_id = %job_id, "room closed");
            }
        }
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .rooms
            .iter()
            .map(|room| room.tx.receiver_count())
            .sum()
    }

    /// Tear down all rooms, e.g. on shutdown.
    pub fn stop(&self) {
        let job_ids: Vec<String> = self
            .inner
            .rooms
            .iter()
            .map(|room| room.key().clone())
            .collect();
        for job_id in job_ids {
            if let Some((_, room)) = self.inner.rooms.remove(&job_id) {
                room.listener.abort();
                self.inner.metrics.room_closed();
            }
        }
        info!("broadcast manager stopped");
    }

    /// Inject a delta directly into a room, bypassing pub/sub.
    #[cfg(test)]
    pub fn publish_local(&self, job_id: &str, envelope: Envelope) {
        if let Some(room) = self.inner.rooms.get(job_id) {
            let _ = room.tx.send(envelope);
        }
    }
}

/// Live membership in a room. Dropping it (the connection closed)
/// deregisters the subscriber and closes the room when it was the
/// last one.
pub struct RoomSubscription {
    // Declared before the guard: the receiver must be gone when the
    // guard's release runs its last-subscriber check.
    pub rx: broadcast::Receiver<Envelope>,
    #[allow(dead_code)]
    guard: RoomGuard,
}

struct RoomGuard {
    manager: BroadcastManager,
    job_id: String,
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        self.manager.release(&self.job_id);
    }
}
