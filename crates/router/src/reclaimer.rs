//! Periodic recovery of entries abandoned by crashed consumers.
//!
//! Every consumer starts under a fresh name, so a restart leaves its
//! predecessor's pending entries orphaned. This task claims entries
//! idle past the threshold and runs them through the same processor
//! as the live path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::RouterConfig;
use crate::metrics::RouterMetrics;
use crate::processor::Processor;
use crate::store::{EventStore, RouterError};

pub struct Reclaimer<S> {
    store: Arc<S>,
    processor: Arc<Processor<S>>,
    metrics: RouterMetrics,
    /// (stream key, state prefix) for every shard of every domain.
    shards: Vec<(String, String)>,
    consumer_name: String,
    interval: Duration,
    min_idle: Duration,
    batch: usize,
}

impl<S: EventStore> Reclaimer<S> {
    pub fn new(
        store: Arc<S>,
        processor: Arc<Processor<S>>,
        metrics: RouterMetrics,
        config: &RouterConfig,
    ) -> Self {
        let shards = config
            .domains
            .iter()
            .flat_map(|domain| {
                domain
                    .stream_keys()
                    .map(|key| (key, domain.state_prefix.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        Self {
            store,
            processor,
            metrics,
            shards,
            consumer_name: config.consumer_name.clone(),
            interval: config.reclaim_interval,
            min_idle: config.reclaim_min_idle,
            batch: config.reclaim_batch,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so a restart does
        // not race entries the predecessor is still about to ack.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("reclaimer stopping");
                    return;
                }
                _ = ticker.tick() => {
                    for (stream_key, state_prefix) in &self.shards {
                        if let Err(e) = self.sweep(stream_key, state_prefix).await {
                            warn!(stream = %stream_key, error = %e, "reclaim sweep failed");
                        }
                    }
                }
            }
        }
    }

    async fn sweep(&self, stream_key: &str, state_prefix: &str) -> Result<(), RouterError> {
        let pending = self.store.pending(stream_key, self.batch).await?;
        let min_idle_ms = self.min_idle.as_millis() as usize;

        let stale: Vec<String> = pending
            .ids
            .iter()
            .filter(|entry| entry.last_delivered_ms as usize >= min_idle_ms)
            .map(|entry| entry.id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let claimed = self
            .store
            .claim(stream_key, &self.consumer_name, min_idle_ms, &stale)
            .await?;
        if claimed.is_empty() {
            return Ok(());
        }

        info!(stream = %stream_key, count = claimed.len(), "reclaiming abandoned entries");
        let mut recovered = 0u64;
        for entry in &claimed {
            let handled = self
                .processor
                .process(state_prefix, stream_key, &entry.id, &entry.map)
                .await;
            if handled {
                self.store.ack(stream_key, &entry.id).await?;
                recovered += 1;
            }
        }
        self.metrics.record_reclaimed(recovered);
        Ok(())
    }
}
