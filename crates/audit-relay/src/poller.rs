// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The poll-transform-ship loop.
//!
//! Each cycle requests events since the current checkpoint, transforms them in
//! order, ships the batch, and only then moves the checkpoint to one second past
//! the last event and persists it. Any failure leaves the checkpoint where it
//! was, so the next cycle asks for the same events again (at-least-once).

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::ApiError;
use crate::sink::EventSink;
use crate::source::EventSource;
use crate::transformer::{transform, TransformedEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Shipped {
        events: usize,
        /// `None` when the last event had no usable timestamp.
        checkpoint: Option<Checkpoint>,
    },
    NoEvents,
    SourceFailed(ApiError),
    SinkFailed(ApiError),
}

pub struct Poller {
    source: Arc<dyn EventSource>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn CheckpointStore>,
    checkpoint: Checkpoint,
    interval: Duration,
}

impl Poller {
    pub fn new(
        source: Arc<dyn EventSource>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn CheckpointStore>,
        checkpoint: Checkpoint,
        interval: Duration,
    ) -> Self {
        Poller {
            source,
            sink,
            store,
            checkpoint,
            interval,
        }
    }

    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Runs cycles until `cancel` fires. Cancellation is observed before each
    /// cycle and during the sleep; an in-flight request is allowed to finish.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            "POLLER | Starting from checkpoint {}, polling every {}s",
            self.checkpoint,
            self.interval.as_secs()
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.run_cycle().await;

            info!("POLLER | Going to sleep for {}s", self.interval.as_secs());
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("POLLER | Shutting down at checkpoint {}", self.checkpoint);
    }

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        info!("POLLER | Requesting events since {}", self.checkpoint);
        let events = match self.source.fetch_since(&self.checkpoint).await {
            Ok(events) => events,
            Err(e) => {
                error!(
                    kind = e.kind(),
                    "POLLER | Failed to retrieve events: {}", e
                );
                return CycleOutcome::SourceFailed(e);
            }
        };

        if events.is_empty() {
            info!("POLLER | No events");
            return CycleOutcome::NoEvents;
        }

        info!("POLLER | Events number: {}", events.len());
        let transformed: Vec<TransformedEvent> = events.iter().map(transform).collect();

        if let Err(e) = self.sink.ship(&transformed).await {
            error!(
                kind = e.kind(),
                "POLLER | Failed to ship {} events: {}",
                transformed.len(),
                e
            );
            return CycleOutcome::SinkFailed(e);
        }

        let checkpoint = self.advance(transformed.last());
        CycleOutcome::Shipped {
            events: transformed.len(),
            checkpoint,
        }
    }

    fn advance(&mut self, last: Option<&TransformedEvent>) -> Option<Checkpoint> {
        let Some(raw) = last.and_then(TransformedEvent::timestamp) else {
            error!("POLLER | Last shipped event has no timestamp, checkpoint not advanced");
            return None;
        };
        let Some(last_seen) = Checkpoint::from_event_timestamp(raw) else {
            error!("POLLER | Unparseable event timestamp '{raw}', checkpoint not advanced");
            return None;
        };

        let next = last_seen.advanced();
        if next < self.checkpoint {
            warn!(
                "POLLER | Events ended at {last_seen}, before checkpoint {}; keeping the checkpoint",
                self.checkpoint
            );
            return None;
        }

        self.checkpoint = next;
        if let Err(e) = self.store.save(&self.checkpoint) {
            error!("POLLER | Failed to persist checkpoint {}: {e}", self.checkpoint);
        }
        debug!("POLLER | Checkpoint advanced to {}", self.checkpoint);
        Some(self.checkpoint)
    }
}

/// Picks the starting checkpoint: the persisted file, then the configured
/// start date, then the current time.
pub fn resolve_start_checkpoint(
    store: &dyn CheckpointStore,
    configured: Option<Checkpoint>,
) -> Checkpoint {
    if let Some(persisted) = store.load() {
        info!("POLLER | Resuming from persisted checkpoint {persisted}");
        return persisted;
    }
    if let Some(configured) = configured {
        info!("POLLER | Starting from configured start date {configured}");
        return configured;
    }
    let now = Checkpoint::now();
    info!("POLLER | No checkpoint found, starting from {now}");
    now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointError;
    use crate::transformer::RawEvent;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    struct MockSource {
        responses: Mutex<Vec<Result<Vec<RawEvent>, ApiError>>>,
        requested: Mutex<Vec<Checkpoint>>,
    }

    impl MockSource {
        fn new(responses: Vec<Result<Vec<RawEvent>, ApiError>>) -> Arc<Self> {
            Arc::new(MockSource {
                responses: Mutex::new(responses),
                requested: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EventSource for MockSource {
        async fn fetch_since(&self, since: &Checkpoint) -> Result<Vec<RawEvent>, ApiError> {
            self.requested.lock().unwrap().push(*since);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(Vec::new())
            } else {
                responses.remove(0)
            }
        }
    }

    #[derive(Default)]
    struct MockSink {
        fail_with: Option<ApiError>,
        shipped: Mutex<Vec<Vec<TransformedEvent>>>,
    }

    #[async_trait]
    impl EventSink for MockSink {
        async fn ship(&self, events: &[TransformedEvent]) -> Result<(), ApiError> {
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            self.shipped.lock().unwrap().push(events.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<Checkpoint>>,
    }

    impl CheckpointStore for MemoryStore {
        fn load(&self) -> Option<Checkpoint> {
            self.saved.lock().unwrap().last().copied()
        }

        fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
            self.saved.lock().unwrap().push(*checkpoint);
            Ok(())
        }
    }

    fn event(timestamp: &str) -> RawEvent {
        match json!({"timestamp": timestamp, "event_type": "user_update"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn start() -> Checkpoint {
        Checkpoint::parse("2024-01-01T00:00:00.000000Z").unwrap()
    }

    fn poller(
        source: Arc<MockSource>,
        sink: Arc<MockSink>,
        store: Arc<MemoryStore>,
    ) -> Poller {
        Poller::new(source, sink, store, start(), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_successful_cycle_advances_past_last_event() {
        let source = MockSource::new(vec![Ok(vec![
            event("2024-01-01T00:00:05.000000Z"),
            event("2024-01-01T00:00:06.000000Z"),
        ])]);
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MemoryStore::default());
        let mut poller = poller(source, sink.clone(), store.clone());

        let outcome = poller.run_cycle().await;

        let expected = Checkpoint::parse("2024-01-01T00:00:07.000000Z").unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Shipped {
                events: 2,
                checkpoint: Some(expected)
            }
        );
        assert_eq!(poller.checkpoint(), &expected);
        assert_eq!(store.load(), Some(expected));

        let shipped = sink.shipped.lock().unwrap();
        assert_eq!(shipped.len(), 1);
        assert_eq!(
            shipped[0][0].fields()["@timestamp"],
            json!("2024-01-01T00:00:05.000000Z")
        );
        assert_eq!(
            shipped[0][1].timestamp(),
            Some("2024-01-01T00:00:06.000000Z")
        );
    }

    #[tokio::test]
    async fn test_checkpoint_follows_received_order() {
        // The last event in the response wins even if an earlier one is later.
        let source = MockSource::new(vec![Ok(vec![
            event("2024-01-01T00:00:09.000000Z"),
            event("2024-01-01T00:00:06.000000Z"),
        ])]);
        let store = Arc::new(MemoryStore::default());
        let mut poller = poller(source, Arc::new(MockSink::default()), store.clone());

        poller.run_cycle().await;
        assert_eq!(
            poller.checkpoint().to_string(),
            "2024-01-01T00:00:07.000000Z"
        );
    }

    #[tokio::test]
    async fn test_no_events_leaves_checkpoint() {
        let source = MockSource::new(vec![Ok(Vec::new())]);
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MemoryStore::default());
        let mut poller = poller(source, sink.clone(), store.clone());

        assert_eq!(poller.run_cycle().await, CycleOutcome::NoEvents);
        assert_eq!(poller.checkpoint(), &start());
        assert_eq!(store.load(), None);
        assert!(sink.shipped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_leaves_checkpoint() {
        let source = MockSource::new(vec![
            Ok(vec![event("2024-01-01T00:00:05.000000Z")]),
            Ok(vec![event("2024-01-01T00:00:05.000000Z")]),
        ]);
        let sink = Arc::new(MockSink {
            fail_with: Some(ApiError::BadRequest("badly formatted logs".to_string())),
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::default());
        let mut poller = poller(source.clone(), sink, store.clone());
        let before = poller.checkpoint().to_string();

        let outcome = poller.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::SinkFailed(ApiError::BadRequest("badly formatted logs".to_string()))
        );
        assert_eq!(poller.checkpoint().to_string(), before);
        assert_eq!(store.load(), None);

        // The next cycle asks for the same window again.
        poller.run_cycle().await;
        let requested = source.requested.lock().unwrap();
        assert_eq!(requested.as_slice(), &[start(), start()]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_source_unauthorized_is_logged_and_survived() {
        let source = MockSource::new(vec![Err(ApiError::Unauthorized(
            "invalid API key".to_string(),
        ))]);
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MemoryStore::default());
        let mut poller = poller(source, sink.clone(), store.clone());

        let outcome = poller.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::SourceFailed(ApiError::Unauthorized("invalid API key".to_string()))
        );
        assert!(logs_contain("Unauthorized: invalid API key"));
        assert_eq!(poller.checkpoint(), &start());
        assert!(sink.shipped.lock().unwrap().is_empty());
        assert_eq!(store.load(), None);
    }

    #[tokio::test]
    async fn test_missing_timestamp_ships_without_advancing() {
        let untimed = match json!({"event_type": "odd"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let source = MockSource::new(vec![Ok(vec![untimed])]);
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MemoryStore::default());
        let mut poller = poller(source, sink.clone(), store.clone());

        let outcome = poller.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::Shipped {
                events: 1,
                checkpoint: None
            }
        );
        assert_eq!(sink.shipped.lock().unwrap().len(), 1);
        assert_eq!(poller.checkpoint(), &start());
    }

    #[tokio::test]
    async fn test_checkpoint_never_rewinds() {
        let source = MockSource::new(vec![Ok(vec![event("2023-12-31T00:00:00.000000Z")])]);
        let store = Arc::new(MemoryStore::default());
        let mut poller = poller(source, Arc::new(MockSink::default()), store.clone());

        poller.run_cycle().await;
        assert_eq!(poller.checkpoint(), &start());
        assert_eq!(store.load(), None);
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let source = MockSource::new(vec![Ok(vec![event("2024-01-01T00:00:05.000000Z")])]);
        let store = Arc::new(MemoryStore::default());
        let mut poller = Poller::new(
            source.clone(),
            Arc::new(MockSink::default()),
            store.clone(),
            start(),
            Duration::from_secs(3600),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let handle = tokio::spawn(async move {
            poller.run(cancel).await;
            poller
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();

        let poller = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
        assert_eq!(source.requested.lock().unwrap().len(), 1);
        assert_eq!(
            poller.checkpoint().to_string(),
            "2024-01-01T00:00:06.000000Z"
        );
    }

    #[tokio::test]
    async fn test_run_does_not_start_when_already_cancelled() {
        let source = MockSource::new(Vec::new());
        let mut poller = poller(
            source.clone(),
            Arc::new(MockSink::default()),
            Arc::new(MemoryStore::default()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        poller.run(cancel).await;
        assert!(source.requested.lock().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_start_checkpoint_precedence() {
        let configured = Checkpoint::parse("2023-01-01T00:00:00.000000Z").unwrap();
        let store = MemoryStore::default();
        assert_eq!(
            resolve_start_checkpoint(&store, Some(configured)),
            configured
        );

        let persisted = Checkpoint::parse("2024-02-02T00:00:00.000000Z").unwrap();
        store.save(&persisted).unwrap();
        assert_eq!(resolve_start_checkpoint(&store, Some(configured)), persisted);

        let empty = MemoryStore::default();
        let before = Checkpoint::now();
        let resolved = resolve_start_checkpoint(&empty, None);
        assert!(resolved >= before);
    }
}
