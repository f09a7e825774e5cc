// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Collection of peak events streamed by nodes.
//!
//! One watcher task per node subscribes to `StreamPeakEvents`, upserts every
//! received event into the peak-event store (idempotent on
//! `(node_id, dedupe_key, seq)`), and re-broadcasts it to in-process
//! listeners (operator-facing relays, alerting hooks).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warden_node_client::NodeClient;
use warden_service::types::PeakEvent;

use crate::store::PeakEventStore;

const STREAM_RETRY_DELAY: Duration = Duration::from_secs(5);
const BROADCAST_CAPACITY: usize = 1024;

/// Receives, persists, and re-broadcasts node peak events.
pub struct PeakCollector {
    store: Arc<dyn PeakEventStore>,
    tx: broadcast::Sender<PeakEvent>,
}

impl PeakCollector {
    pub fn new(store: Arc<dyn PeakEventStore>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(PeakCollector { store, tx })
    }

    /// Subscribes to the live event feed. Consumers requiring strict
    /// ordering sort by `seq` per node.
    pub fn subscribe(&self) -> broadcast::Receiver<PeakEvent> {
        self.tx.subscribe()
    }

    /// Spawns the watcher task for one node. The task re-opens the stream
    /// after failures until aborted by the caller.
    pub fn watch_node(self: &Arc<Self>, client: Arc<NodeClient>) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let stream = client.stream_peak_events();
                tokio::pin!(stream);
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => collector.ingest(event).await,
                        Err(err) => {
                            debug!(node_id = client.id(), error = %err, "peak stream error");
                            break;
                        }
                    }
                }
                tokio::time::sleep(STREAM_RETRY_DELAY).await;
            }
        })
    }

    async fn ingest(&self, event: PeakEvent) {
        if let Err(err) = self.store.upsert_event(&event).await {
            warn!(node_id = event.node_id, error = %format!("{err:#}"), "failed to persist peak event");
        }
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use warden_service::types::{PeakCategory, PeakLevel};

    use super::*;
    use crate::store::MemoryStore;

    fn event(seq: u64) -> PeakEvent {
        PeakEvent {
            node_id: 4,
            category: PeakCategory::Memory,
            metric: "memory_percent".into(),
            level: PeakLevel::Warning,
            value: 85.0,
            threshold: 80.0,
            dedupe_key: "0011223344556677".into(),
            context_json: "{}".into(),
            started_at_ms: 10,
            resolved_at_ms: None,
            seq,
        }
    }

    #[tokio::test]
    async fn ingest_persists_and_broadcasts() {
        let store = Arc::new(MemoryStore::new());
        let collector = PeakCollector::new(Arc::clone(&store) as _);
        let mut rx = collector.subscribe();

        collector.ingest(event(1)).await;
        // Redelivery after a stream reset must not duplicate.
        collector.ingest(event(1)).await;
        collector.ingest(event(2)).await;

        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);

        let stored = store.events_since(4, 0).await.unwrap();
        assert_eq!(stored.len(), 2);
    }
}
