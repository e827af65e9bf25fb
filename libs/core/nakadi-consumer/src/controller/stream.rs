//! Channel handler for one partition's event stream.
//!
//! Requests resume from the last committed cursor, so a repeated or retried
//! attempt picks up where the previous one stopped. A 412 naming an
//! unavailable offset is reported to the coordinator as a stale cursor.

use crate::channel::{ChannelHandler, ResponseUnit};
use crate::config::StreamParameters;
use crate::coordinator::{CommitCallback, PartitionCoordinator, ProcessingFailure};
use crate::dispatcher::ResponseDispatcher;
use crate::error::{ConsumerError, ConsumerResult};
use crate::http::{ResourceRequest, events_request};
use crate::model::{EventTypeCursor, EventTypePartition};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Next cursor to request; advanced by every commit of the partition.
#[derive(Debug)]
pub(crate) struct CursorState {
    cursor: Mutex<EventTypeCursor>,
}

impl CursorState {
    fn new(cursor: EventTypeCursor) -> Self {
        Self {
            cursor: Mutex::new(cursor),
        }
    }

    pub(crate) fn current(&self) -> EventTypeCursor {
        match self.cursor.lock() {
            Ok(cursor) => cursor.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CommitCallback for CursorState {
    fn on_commit(&self, cursor: &EventTypeCursor) {
        if let Ok(mut current) = self.cursor.lock() {
            *current = cursor.clone();
        }
    }
}

/// Drives the event stream of one partition
pub(crate) struct PartitionStreamHandler {
    partition: EventTypePartition,
    cursor: Arc<CursorState>,
    base_url: String,
    params: StreamParameters,
    retry_after_ms: u64,
    coordinator: Arc<dyn PartitionCoordinator>,
    dispatcher: Arc<ResponseDispatcher>,
}

impl PartitionStreamHandler {
    pub(crate) fn new(
        start: EventTypeCursor,
        base_url: impl Into<String>,
        params: StreamParameters,
        retry_after_ms: u64,
        coordinator: Arc<dyn PartitionCoordinator>,
        dispatcher: Arc<ResponseDispatcher>,
    ) -> Self {
        Self {
            partition: start.partition().clone(),
            cursor: Arc::new(CursorState::new(start)),
            base_url: base_url.into(),
            params,
            retry_after_ms,
            coordinator,
            dispatcher,
        }
    }

    pub(crate) fn cursor(&self) -> EventTypeCursor {
        self.cursor.current()
    }

    /// The broker answers 412 with an "unavailable" detail when the cursor
    /// left its retention window.
    fn is_stale_cursor(unit: &ResponseUnit) -> bool {
        unit.status == 412 && unit.body.to_ascii_lowercase().contains("unavailable")
    }
}

#[async_trait]
impl ChannelHandler for PartitionStreamHandler {
    async fn init(&self) -> ConsumerResult<()> {
        self.coordinator
            .register_commit_callback(&self.partition, self.cursor.clone())
    }

    fn request(&self) -> ConsumerResult<ResourceRequest> {
        events_request(&self.base_url, &self.cursor.current(), &self.params)
    }

    async fn on_started(&self) {
        debug!(partition = %self.partition, cursor = %self.cursor.current(), "Event stream opened");
    }

    async fn on_response(&self, unit: ResponseUnit) -> ConsumerResult<()> {
        self.dispatcher.dispatch(&unit.body).await
    }

    async fn on_error_response(&self, unit: ResponseUnit) -> ConsumerResult<()> {
        let cursor = self.cursor.current();

        if Self::is_stale_cursor(&unit) {
            let failure = ProcessingFailure::new(
                self.partition.clone(),
                ConsumerError::StaleCursor {
                    partition: self.partition.to_string(),
                    detail: unit.body,
                },
            )
            .at(cursor.offset().clone());
            return self.coordinator.error(failure).await;
        }

        warn!(
            partition = %self.partition,
            cursor = %cursor,
            status = unit.status,
            body = %unit.body,
            "Event stream request rejected"
        );
        Ok(())
    }

    async fn on_finished(&self) {
        if let Err(e) = self.coordinator.flush(&self.partition).await {
            warn!(partition = %self.partition, error = %e, "Flush failed");
        }
    }

    async fn close(&self) {
        self.coordinator.unregister_commit_callback(&self.partition);
    }

    fn retry_after_millis(&self) -> u64 {
        self.retry_after_ms
    }
}
