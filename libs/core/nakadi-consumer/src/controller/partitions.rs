//! Partition-list poller driving rebalances.

use super::ChannelMap;
use crate::channel::{ChannelHandler, Framing, ResponseUnit};
use crate::coordinator::PartitionCoordinator;
use crate::error::ConsumerResult;
use crate::http::{ResourceRequest, partitions_request};
use crate::model::{EventType, NakadiPartition};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Polls the partition list and feeds every answer to the coordinator
pub(crate) struct PartitionListHandler {
    event_type: EventType,
    base_url: String,
    poll_interval_ms: u64,
    coordinator: Arc<dyn PartitionCoordinator>,
    channels: Arc<ChannelMap>,
}

impl PartitionListHandler {
    pub(crate) fn new(
        event_type: EventType,
        base_url: impl Into<String>,
        poll_interval_ms: u64,
        coordinator: Arc<dyn PartitionCoordinator>,
        channels: Arc<ChannelMap>,
    ) -> Self {
        Self {
            event_type,
            base_url: base_url.into(),
            poll_interval_ms,
            coordinator,
            channels,
        }
    }
}

#[async_trait]
impl ChannelHandler for PartitionListHandler {
    fn request(&self) -> ConsumerResult<ResourceRequest> {
        Ok(partitions_request(&self.base_url, &self.event_type))
    }

    fn framing(&self) -> Framing {
        Framing::WholeBody
    }

    async fn on_response(&self, unit: ResponseUnit) -> ConsumerResult<()> {
        let partitions: Vec<NakadiPartition> = serde_json::from_str(&unit.body)?;
        let owned = self.channels.owned();
        debug!(
            event_type = %self.event_type,
            reported = partitions.len(),
            owned = owned.len(),
            "Partition list received"
        );

        // Coordination failures are retried on the next poll
        if let Err(e) = self
            .coordinator
            .rebalance(&self.event_type, &owned, &partitions)
            .await
        {
            error!(event_type = %self.event_type, error = %e, "Rebalance failed");
        }
        Ok(())
    }

    async fn on_error_response(&self, unit: ResponseUnit) -> ConsumerResult<()> {
        warn!(
            event_type = %self.event_type,
            status = unit.status,
            body = %unit.body,
            "Partition list request rejected"
        );
        Ok(())
    }

    fn retry_after_millis(&self) -> u64 {
        self.poll_interval_ms
    }
}
