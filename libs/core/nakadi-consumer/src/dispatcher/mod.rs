//! Turns framed stream lines into handler calls and commits.
//!
//! Every line is one batch envelope `{"cursor":{...},"events":[...]}`.
//! Envelopes without events are keep-alives and only advance the cursor.
//! Event-granular handlers commit after every event, the n-th last event of
//! an envelope at `offset - (n - 1)`; batch-granular handlers commit once per
//! envelope and only when the whole batch succeeded.

mod handler;
mod replay;

pub use handler::{
    CommitGranularity, ErasedBulkListener, ErasedEventListener, HandlerKind, JsonEventBulkListener,
    JsonEventListener, RawContentListener, RawEventBulkListener, RawEventListener,
    TypedEventBulkListener, TypedEventListener,
};
pub use replay::{FailedEvent, ReplayPolicy, ReplayReport, replay_events};

use crate::coordinator::{PartitionCoordinator, ProcessingFailure};
use crate::error::{ConsumerError, ConsumerResult, HandlerError};
use crate::metrics::ConsumerMetrics;
use crate::model::{EventType, EventTypeCursor, EventTypePartition, Offset, WireCursor};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct BatchEnvelope {
    cursor: WireCursor,
    #[serde(default)]
    events: Option<Vec<Box<RawValue>>>,
}

/// Dispatches the envelopes of one event type to one handler
pub struct ResponseDispatcher {
    event_type: EventType,
    handler: HandlerKind,
    coordinator: Arc<dyn PartitionCoordinator>,
    metrics: ConsumerMetrics,
}

impl ResponseDispatcher {
    pub fn new(
        event_type: EventType,
        handler: HandlerKind,
        coordinator: Arc<dyn PartitionCoordinator>,
    ) -> Self {
        let metrics = ConsumerMetrics::new(event_type.name(), coordinator.consumer_name().as_str());
        Self {
            event_type,
            handler,
            coordinator,
            metrics,
        }
    }

    pub fn granularity(&self) -> CommitGranularity {
        self.handler.granularity()
    }

    /// Handle one envelope line. Errors returned here end the stream attempt;
    /// unrecoverable ones unsubscribe the channel.
    pub async fn dispatch(&self, line: &str) -> ConsumerResult<()> {
        let envelope: BatchEnvelope = serde_json::from_str(line)?;
        let cursor = EventTypeCursor::new(
            EventTypePartition::new(self.event_type.clone(), envelope.cursor.partition),
            Offset::parse(&envelope.cursor.offset),
        );

        let events = match envelope.events {
            Some(events) if !events.is_empty() => events,
            _ => {
                debug!(cursor = %cursor, "Keep-alive");
                return self.coordinator.commit(&cursor).await;
            }
        };

        let started = Instant::now();
        match self.granularity() {
            CommitGranularity::Event => self.dispatch_events(&cursor, &events).await?,
            CommitGranularity::Batch => self.dispatch_batch(&cursor, line, &events).await?,
        }
        self.metrics.batch_processed(started.elapsed());
        Ok(())
    }

    async fn dispatch_events(
        &self,
        cursor: &EventTypeCursor,
        events: &[Box<RawValue>],
    ) -> ConsumerResult<()> {
        let count = events.len() as u64;
        let envelope_offset = cursor.offset().numeric();
        for (index, event) in events.iter().enumerate() {
            // Saturates at offset 0 so commits within an envelope never go back
            let steps = (count - 1 - index as u64).min(envelope_offset.unwrap_or(0));
            let event_cursor = match cursor.offset().preceding(steps) {
                Some(offset) => cursor.with_offset(offset),
                None => cursor.clone(),
            };

            match self.handler.handle_event(&event_cursor, event).await {
                Ok(()) => self.metrics.events_processed(1),
                Err(e) => self.report(&event_cursor, e, Some(event.get())).await?,
            }
            self.coordinator.commit(&event_cursor).await?;
        }
        Ok(())
    }

    async fn dispatch_batch(
        &self,
        cursor: &EventTypeCursor,
        line: &str,
        events: &[Box<RawValue>],
    ) -> ConsumerResult<()> {
        match self.handler.handle_batch(cursor, line, events).await {
            Ok(()) => {
                self.metrics.events_processed(events.len() as u64);
                self.coordinator.commit(cursor).await
            }
            Err(e) => self.report(cursor, e, None).await,
        }
    }

    /// Route a handler failure through the coordinator; only unrecoverable
    /// failures come back.
    async fn report(
        &self,
        cursor: &EventTypeCursor,
        error: HandlerError,
        raw_event: Option<&str>,
    ) -> ConsumerResult<()> {
        warn!(
            cursor = %cursor,
            handler = self.handler.name(),
            recoverable = error.is_recoverable(),
            error = %error,
            "Event handler failed"
        );

        let mut failure =
            ProcessingFailure::new(cursor.partition().clone(), ConsumerError::from(error))
                .at(cursor.offset().clone());
        if let Some(raw_event) = raw_event {
            failure = failure.with_raw_event(raw_event);
        }
        self.coordinator.error(failure).await
    }
}
