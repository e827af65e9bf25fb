//! Durable committed offsets keyed by (event type, partition, consumer).

mod validation;

pub use validation::resolve_start_offset;

use crate::coordination::{CoordinationStore, KeySpace};
use crate::error::ConsumerResult;
use crate::model::{ConsumerName, EventType, EventTypeCursor, EventTypePartition, Offset};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Last committed offset, if any.
    async fn get(
        &self,
        partition: &EventTypePartition,
        consumer: &ConsumerName,
    ) -> ConsumerResult<Option<Offset>>;

    /// Persist `cursor`; returns once the write is durable.
    async fn set(&self, cursor: &EventTypeCursor, consumer: &ConsumerName) -> ConsumerResult<()>;

    /// Remove a stale entry.
    async fn delete(
        &self,
        partition: &EventTypePartition,
        consumer: &ConsumerName,
    ) -> ConsumerResult<()>;

    /// Every committed cursor of `event_type` for `consumer`.
    async fn list(
        &self,
        event_type: &EventType,
        consumer: &ConsumerName,
    ) -> ConsumerResult<Vec<EventTypeCursor>>;
}

/// Offset store on top of the coordination service; values are plain-text offsets.
#[derive(Clone)]
pub struct CoordinatedOffsetStore {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
}

impl CoordinatedOffsetStore {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }
}

#[async_trait]
impl OffsetStore for CoordinatedOffsetStore {
    async fn get(
        &self,
        partition: &EventTypePartition,
        consumer: &ConsumerName,
    ) -> ConsumerResult<Option<Offset>> {
        let value = self.store.get(&self.keys.offset(partition, consumer)).await?;
        Ok(value.map(|v| Offset::parse(v.trim())))
    }

    async fn set(&self, cursor: &EventTypeCursor, consumer: &ConsumerName) -> ConsumerResult<()> {
        let key = self.keys.offset(cursor.partition(), consumer);
        self.store.put(&key, cursor.offset().as_str()).await?;
        debug!(cursor = %cursor, consumer = %consumer, "Offset committed");
        Ok(())
    }

    async fn delete(
        &self,
        partition: &EventTypePartition,
        consumer: &ConsumerName,
    ) -> ConsumerResult<()> {
        self.store
            .delete(&self.keys.offset(partition, consumer))
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        event_type: &EventType,
        consumer: &ConsumerName,
    ) -> ConsumerResult<Vec<EventTypeCursor>> {
        let entries = self.store.list(&self.keys.offsets_prefix(event_type)).await?;

        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| {
                let partition = self.keys.partition_of_offset_key(&key, event_type, consumer)?;
                Some(EventTypeCursor::new(
                    EventTypePartition::new(event_type.clone(), partition),
                    Offset::parse(value.trim()),
                ))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;

    fn store() -> CoordinatedOffsetStore {
        CoordinatedOffsetStore::new(Arc::new(MemoryCoordinationStore::new()), KeySpace::new("nakadi"))
    }

    fn cursor(partition: &str, offset: &str) -> EventTypeCursor {
        EventTypeCursor::new(
            EventTypePartition::new(EventType::new("order.created"), partition),
            Offset::parse(offset),
        )
    }

    #[tokio::test]
    async fn test_commit_then_read_round_trip() {
        let offsets = store();
        let consumer = ConsumerName::new("billing");
        let committed = cursor("0", "000000000000000042");

        offsets.set(&committed, &consumer).await.unwrap();
        let read = offsets.get(committed.partition(), &consumer).await.unwrap();

        assert_eq!(read.as_ref().map(Offset::as_str), Some("000000000000000042"));
    }

    #[tokio::test]
    async fn test_offsets_are_scoped_by_consumer() {
        let offsets = store();
        let billing = ConsumerName::new("billing");
        let audit = ConsumerName::new("audit");

        offsets.set(&cursor("0", "10"), &billing).await.unwrap();
        offsets.set(&cursor("1", "11"), &billing).await.unwrap();
        offsets.set(&cursor("0", "99"), &audit).await.unwrap();

        let mut listed = offsets.list(&EventType::new("order.created"), &billing).await.unwrap();
        listed.sort_by(|a, b| a.partition_id().cmp(b.partition_id()));

        assert_eq!(listed, vec![cursor("0", "10"), cursor("1", "11")]);
    }

    #[tokio::test]
    async fn test_delete() {
        let offsets = store();
        let consumer = ConsumerName::new("billing");
        let committed = cursor("3", "7");

        offsets.set(&committed, &consumer).await.unwrap();
        offsets.delete(committed.partition(), &consumer).await.unwrap();

        assert_eq!(offsets.get(committed.partition(), &consumer).await.unwrap(), None);
    }
}
