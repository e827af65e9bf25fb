//! Listeners that log what they receive.

use async_trait::async_trait;
use nakadi_consumer::dispatcher::{JsonEventBulkListener, JsonEventListener};
use nakadi_consumer::{EventTypeCursor, HandlerError, HandlerKind};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub struct LoggingListener {
    /// Log whole payloads instead of just their metadata
    verbose: bool,
}

impl LoggingListener {
    pub fn handler(verbose: bool, bulk: bool) -> HandlerKind {
        let listener = Arc::new(Self { verbose });
        if bulk {
            HandlerKind::JsonEventBulk(listener)
        } else {
            HandlerKind::JsonEvent(listener)
        }
    }

    fn log(&self, cursor: &EventTypeCursor, event: &Value) {
        let eid = event["metadata"]["eid"].as_str().unwrap_or("-");
        if self.verbose {
            info!(cursor = %cursor, eid, event = %event, "Event");
        } else {
            info!(cursor = %cursor, eid, "Event");
        }
    }
}

#[async_trait]
impl JsonEventListener for LoggingListener {
    async fn on_event(&self, cursor: &EventTypeCursor, event: Value) -> Result<(), HandlerError> {
        self.log(cursor, &event);
        Ok(())
    }
}

#[async_trait]
impl JsonEventBulkListener for LoggingListener {
    async fn on_events(&self, cursor: &EventTypeCursor, events: Vec<Value>) -> Result<(), HandlerError> {
        info!(cursor = %cursor, count = events.len(), "Batch");
        for event in &events {
            self.log(cursor, event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nakadi_consumer::{CommitGranularity, EventType, EventTypePartition, Offset};
    use serde_json::json;

    #[test]
    fn test_bulk_flag_selects_granularity() {
        assert_eq!(LoggingListener::handler(false, false).granularity(), CommitGranularity::Event);
        assert_eq!(LoggingListener::handler(false, true).granularity(), CommitGranularity::Batch);
    }

    #[tokio::test]
    async fn test_events_without_metadata_are_accepted() {
        let listener = LoggingListener { verbose: true };
        let cursor = EventTypeCursor::new(
            EventTypePartition::new(EventType::new("order.created"), "0"),
            Offset::parse("3"),
        );

        JsonEventListener::on_event(&listener, &cursor, json!({"order": 1}))
            .await
            .unwrap();
    }
}
