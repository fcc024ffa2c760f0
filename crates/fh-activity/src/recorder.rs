//! The activity recorder: a bounded queue feeding the one task that owns
//! the event cache.
//!
//! Producers await `record`, so a saturated queue back-pressures ingest
//! instead of dropping events. Escalation outcomes are forwarded on a side
//! channel for the moderation layer to act on.

use crate::cache::{EventCache, Outcome};
use crate::events::TimedEvent;
use crate::metrics::ActivityMetrics;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

/// Queue capacity between the dispatcher and the recorder.
pub const MAX_BACKLOG: usize = 10_000;

#[derive(Clone)]
pub struct EventRecorder {
    tx: mpsc::Sender<TimedEvent>,
    metrics: Arc<ActivityMetrics>,
}

impl EventRecorder {
    /// Spawn the consumer task and return the producer handle.
    pub fn start(
        cache: EventCache,
        metrics: Arc<ActivityMetrics>,
        outcome_tx: Option<mpsc::Sender<Outcome>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TimedEvent>(MAX_BACKLOG);
        let task_metrics = metrics.clone();
        let handle = tokio::spawn(async move {
            let mut cache = cache;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || !*shutdown.borrow() {
                            break;
                        }
                    }
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        task_metrics
                            .backlog
                            .with_label_values(&["events"])
                            .dec();
                        for outcome in cache.record(event) {
                            if let Some(tx) = &outcome_tx {
                                let _ = tx.send(outcome).await;
                            }
                        }
                    }
                }
            }
            info!("event recorder stopping");
        });
        (EventRecorder { tx, metrics }, handle)
    }

    /// Enqueue one event, waiting for space when the queue is full.
    pub async fn record(&self, event: TimedEvent) {
        self.metrics.backlog.with_label_values(&["events"]).inc();
        if self.tx.send(event).await.is_err() {
            self.metrics.backlog.with_label_values(&["events"]).dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use chrono::Utc;
    use fh_atproto::AtUri;

    #[tokio::test]
    async fn events_flow_through_to_outcomes() {
        let metrics = Arc::new(ActivityMetrics::detached());
        let cache = EventCache::with_capacity(
            16,
            metrics.clone(),
            Some("did:plc:modservice".to_owned()),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(true);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(4);
        let (recorder, handle) =
            EventRecorder::start(cache, metrics, Some(outcome_tx), shutdown_rx);

        recorder
            .record(TimedEvent::new(
                "did:plc:poster",
                Utc::now(),
                Event::Post {
                    uri: AtUri::parse("at://did:plc:poster/app.bsky.feed.post/1").unwrap(),
                },
            ))
            .await;
        recorder
            .record(TimedEvent::new(
                "did:plc:hostile",
                Utc::now(),
                Event::Block {
                    blocked: "did:plc:modservice".to_owned(),
                },
            ))
            .await;

        let outcome = outcome_rx.recv().await.unwrap();
        assert_eq!(
            outcome,
            Outcome::BlocksModeration {
                did: "did:plc:hostile".to_owned()
            }
        );

        shutdown_tx.send(false).unwrap();
        handle.await.unwrap();
    }
}
