use super::{CoordinatorCore, ErrorAction, PartitionCoordinator, ProcessingFailure};
use crate::config::ConsumerConfig;
use crate::error::ConsumerResult;
use crate::model::{EventType, EventTypePartition, NakadiPartition};
use crate::offsets::OffsetStore;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Single-process coordinator: this process owns every reported partition.
pub struct LocalCoordinator {
    core: CoordinatorCore,
    durable: bool,
}

impl LocalCoordinator {
    /// Starts every partition at the configured default offset and keeps
    /// progress in memory only.
    pub fn simple(config: &ConsumerConfig) -> Self {
        Self {
            core: CoordinatorCore::new(
                config.consumer_name.clone(),
                config.start_offset,
                config.delete_unavailable_cursors,
                None,
            ),
            durable: false,
        }
    }

    /// Resumes from `offsets` and persists every commit.
    pub fn durable(config: &ConsumerConfig, offsets: Arc<dyn OffsetStore>) -> Self {
        Self {
            core: CoordinatorCore::new(
                config.consumer_name.clone(),
                config.start_offset,
                config.delete_unavailable_cursors,
                Some(offsets),
            ),
            durable: true,
        }
    }
}

#[async_trait]
impl PartitionCoordinator for LocalCoordinator {
    fn core(&self) -> &CoordinatorCore {
        &self.core
    }

    async fn init(&self) -> ConsumerResult<()> {
        info!(consumer = %self.core.consumer(), durable = self.durable, "Local coordinator ready");
        Ok(())
    }

    async fn close(&self) -> ConsumerResult<()> {
        Ok(())
    }

    async fn rebalance(
        &self,
        event_type: &EventType,
        owned: &BTreeSet<String>,
        partitions: &[NakadiPartition],
    ) -> ConsumerResult<()> {
        let reported: BTreeSet<&str> = partitions.iter().map(|p| p.partition.as_str()).collect();

        let revoked: Vec<EventTypePartition> = owned
            .iter()
            .filter(|id| !reported.contains(id.as_str()))
            .map(|id| EventTypePartition::new(event_type.clone(), id.as_str()))
            .collect();

        let mut assigned = Vec::new();
        for partition in partitions.iter().filter(|p| !owned.contains(&p.partition)) {
            match self.core.start_cursor(event_type, partition).await {
                Ok(cursor) => assigned.push(cursor),
                Err(e) => warn!(
                    event_type = %event_type,
                    partition = %partition.partition,
                    error = %e,
                    "Could not read start offset, skipping partition this round"
                ),
            }
        }

        if revoked.is_empty() && assigned.is_empty() {
            self.core.emit_health_check(event_type);
            return Ok(());
        }

        info!(
            event_type = %event_type,
            consumer = %self.core.consumer(),
            assigned = assigned.len(),
            revoked = revoked.len(),
            "Rebalanced partitions"
        );
        self.core.record_rebalance(event_type, assigned.len(), revoked.len());
        self.core.emit_revoke(event_type, revoked);
        self.core.emit_assign(event_type, assigned);
        Ok(())
    }

    async fn error(&self, failure: ProcessingFailure) -> ConsumerResult<()> {
        if let ErrorAction::Revoke(partition) = self.core.route_error(failure).await? {
            let event_type = partition.event_type().clone();
            self.core.emit_revoke(&event_type, vec![partition]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConsumerError;
    use crate::model::{EventTypeCursor, Offset};
    use crate::offsets::MockOffsetStore;
    use crate::testing::{Notification, RecordingListener};

    const EVENT_TYPE: &str = "order.created";

    fn config() -> ConsumerConfig {
        ConsumerConfig::new("http://nakadi.local", "billing")
    }

    fn partition(id: &str, oldest: &str, newest: &str) -> NakadiPartition {
        NakadiPartition {
            partition: id.to_string(),
            oldest_available_offset: oldest.to_string(),
            newest_available_offset: newest.to_string(),
            unconsumed_events: None,
        }
    }

    fn cursor(id: &str, offset: &str) -> EventTypeCursor {
        EventTypeCursor::new(
            EventTypePartition::new(EventType::new(EVENT_TYPE), id),
            Offset::parse(offset),
        )
    }

    fn owned(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn listening(coordinator: &LocalCoordinator) -> Arc<RecordingListener> {
        let listener = Arc::new(RecordingListener::default());
        coordinator
            .register_rebalance_listener(&EventType::new(EVENT_TYPE), listener.clone())
            .unwrap();
        listener
    }

    #[tokio::test]
    async fn test_assigns_all_partitions_at_newest() {
        let coordinator = LocalCoordinator::simple(&config());
        let listener = listening(&coordinator);

        coordinator
            .rebalance(
                &EventType::new(EVENT_TYPE),
                &owned(&[]),
                &[partition("0", "0", "41"), partition("1", "3", "17")],
            )
            .await
            .unwrap();

        assert_eq!(listener.assigned(), vec![cursor("0", "41"), cursor("1", "17")]);
        assert!(listener.revoked().is_empty());
    }

    #[tokio::test]
    async fn test_oldest_start_offset() {
        let config = config().with_start_offset(crate::config::StartOffset::Oldest);
        let coordinator = LocalCoordinator::simple(&config);
        let listener = listening(&coordinator);

        coordinator
            .rebalance(&EventType::new(EVENT_TYPE), &owned(&[]), &[partition("0", "BEGIN", "41")])
            .await
            .unwrap();

        assert_eq!(
            listener.assigned(),
            vec![EventTypeCursor::new(
                EventTypePartition::new(EventType::new(EVENT_TYPE), "0"),
                Offset::Begin
            )]
        );
    }

    #[tokio::test]
    async fn test_revokes_vanished_and_health_checks_when_unchanged() {
        let coordinator = LocalCoordinator::simple(&config());
        let listener = listening(&coordinator);
        let event_type = EventType::new(EVENT_TYPE);

        coordinator
            .rebalance(&event_type, &owned(&["0", "1"]), &[partition("0", "0", "5")])
            .await
            .unwrap();
        coordinator
            .rebalance(&event_type, &owned(&["0"]), &[partition("0", "0", "5")])
            .await
            .unwrap();

        assert_eq!(
            listener.notifications(),
            vec![
                Notification::Revoke(vec![EventTypePartition::new(event_type.clone(), "1")]),
                Notification::HealthCheck,
            ]
        );
    }

    #[tokio::test]
    async fn test_durable_resumes_from_store() {
        let mut offsets = MockOffsetStore::new();
        offsets.expect_get().returning(|partition, _| {
            Ok(match partition.partition() {
                "0" => Some(Offset::parse("20")),
                "1" => Some(Offset::parse("2")),
                _ => None,
            })
        });

        let coordinator = LocalCoordinator::durable(&config(), Arc::new(offsets));
        let listener = listening(&coordinator);

        coordinator
            .rebalance(
                &EventType::new(EVENT_TYPE),
                &owned(&[]),
                &[
                    partition("0", "0", "41"),
                    partition("1", "10", "41"),
                    partition("2", "0", "41"),
                ],
            )
            .await
            .unwrap();

        // "1" was purged by retention and is clamped, "2" has nothing persisted
        assert_eq!(
            listener.assigned(),
            vec![cursor("0", "20"), cursor("1", "10"), cursor("2", "41")]
        );
    }

    #[tokio::test]
    async fn test_unreadable_offset_skips_partition() {
        let mut offsets = MockOffsetStore::new();
        offsets.expect_get().returning(|partition, _| match partition.partition() {
            "0" => Err(ConsumerError::Transport("connection refused".into())),
            _ => Ok(None),
        });

        let coordinator = LocalCoordinator::durable(&config(), Arc::new(offsets));
        let listener = listening(&coordinator);

        coordinator
            .rebalance(
                &EventType::new(EVENT_TYPE),
                &owned(&[]),
                &[partition("0", "0", "9"), partition("1", "0", "9")],
            )
            .await
            .unwrap();

        assert_eq!(listener.assigned(), vec![cursor("1", "9")]);
    }

    #[tokio::test]
    async fn test_stale_cursor_revokes_partition() {
        let mut offsets = MockOffsetStore::new();
        offsets.expect_delete().times(1).returning(|_, _| Ok(()));

        let coordinator = LocalCoordinator::durable(&config(), Arc::new(offsets));
        let listener = listening(&coordinator);
        let stale = EventTypePartition::new(EventType::new(EVENT_TYPE), "4");

        coordinator
            .error(ProcessingFailure::new(
                stale.clone(),
                ConsumerError::StaleCursor {
                    partition: "4".into(),
                    detail: "offset unavailable".into(),
                },
            ))
            .await
            .unwrap();

        assert_eq!(listener.revoked(), vec![stale]);
    }

    #[tokio::test]
    async fn test_processing_error_continues() {
        let coordinator = LocalCoordinator::simple(&config());
        let listener = listening(&coordinator);

        coordinator
            .error(
                ProcessingFailure::new(
                    EventTypePartition::new(EventType::new(EVENT_TYPE), "0"),
                    ConsumerError::processing("handler failed"),
                )
                .at(Offset::parse("3")),
            )
            .await
            .unwrap();

        assert!(listener.notifications().is_empty());
    }
}
