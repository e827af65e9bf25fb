use crate::error::HandlerError;
use crate::model::EventTypeCursor;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::value::RawValue;
use std::marker::PhantomData;
use std::sync::Arc;

/// How often progress is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitGranularity {
    /// Once per event, each event at its own offset
    Event,
    /// Once per envelope, after the whole list was handled
    Batch,
}

/// Receives every non-empty envelope exactly as it was received.
#[async_trait]
pub trait RawContentListener: Send + Sync {
    async fn on_content(&self, cursor: &EventTypeCursor, content: &str) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait RawEventListener: Send + Sync {
    async fn on_event(&self, cursor: &EventTypeCursor, event: &str) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait RawEventBulkListener: Send + Sync {
    async fn on_events(&self, cursor: &EventTypeCursor, events: Vec<String>) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait JsonEventListener: Send + Sync {
    async fn on_event(&self, cursor: &EventTypeCursor, event: Value) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait JsonEventBulkListener: Send + Sync {
    async fn on_events(&self, cursor: &EventTypeCursor, events: Vec<Value>) -> Result<(), HandlerError>;
}

/// Receives events deserialized into `T`. A payload that does not parse is
/// a recoverable error.
#[async_trait]
pub trait TypedEventListener<T>: Send + Sync {
    async fn on_event(&self, cursor: &EventTypeCursor, event: T) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait TypedEventBulkListener<T>: Send + Sync {
    async fn on_events(&self, cursor: &EventTypeCursor, events: Vec<T>) -> Result<(), HandlerError>;
}

/// Typed listener with its event type erased
#[async_trait]
pub trait ErasedEventListener: Send + Sync {
    async fn on_raw_event(&self, cursor: &EventTypeCursor, event: &RawValue) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait ErasedBulkListener: Send + Sync {
    async fn on_raw_events(
        &self,
        cursor: &EventTypeCursor,
        events: &[Box<RawValue>],
    ) -> Result<(), HandlerError>;
}

/// A user handler, classified once at registration.
#[derive(Clone)]
pub enum HandlerKind {
    RawContent(Arc<dyn RawContentListener>),
    RawEvent(Arc<dyn RawEventListener>),
    RawEventBulk(Arc<dyn RawEventBulkListener>),
    JsonEvent(Arc<dyn JsonEventListener>),
    JsonEventBulk(Arc<dyn JsonEventBulkListener>),
    Typed(Arc<dyn ErasedEventListener>),
    TypedBulk(Arc<dyn ErasedBulkListener>),
}

impl HandlerKind {
    pub fn typed<T, L>(listener: L) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        L: TypedEventListener<T> + 'static,
    {
        HandlerKind::Typed(Arc::new(TypedEvents {
            listener,
            _event: PhantomData,
        }))
    }

    pub fn typed_bulk<T, L>(listener: L) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        L: TypedEventBulkListener<T> + 'static,
    {
        HandlerKind::TypedBulk(Arc::new(TypedBulk {
            listener,
            _event: PhantomData,
        }))
    }

    pub fn name(&self) -> &'static str {
        match self {
            HandlerKind::RawContent(_) => "raw_content",
            HandlerKind::RawEvent(_) => "raw_event",
            HandlerKind::RawEventBulk(_) => "raw_event_bulk",
            HandlerKind::JsonEvent(_) => "json_event",
            HandlerKind::JsonEventBulk(_) => "json_event_bulk",
            HandlerKind::Typed(_) => "typed",
            HandlerKind::TypedBulk(_) => "typed_bulk",
        }
    }

    pub fn granularity(&self) -> CommitGranularity {
        match self {
            HandlerKind::RawEvent(_) | HandlerKind::JsonEvent(_) | HandlerKind::Typed(_) => {
                CommitGranularity::Event
            }
            HandlerKind::RawContent(_)
            | HandlerKind::RawEventBulk(_)
            | HandlerKind::JsonEventBulk(_)
            | HandlerKind::TypedBulk(_) => CommitGranularity::Batch,
        }
    }

    /// Deliver one event. Batch handlers get a single-element batch.
    pub(crate) async fn handle_event(
        &self,
        cursor: &EventTypeCursor,
        event: &RawValue,
    ) -> Result<(), HandlerError> {
        match self.granularity() {
            CommitGranularity::Event => self.deliver_event(cursor, event).await,
            CommitGranularity::Batch => {
                let single = [event.to_owned()];
                self.deliver_batch(cursor, event.get(), &single).await
            }
        }
    }

    /// Deliver a whole envelope; `content` is the envelope line as received.
    /// Event handlers get the events one by one.
    pub(crate) async fn handle_batch(
        &self,
        cursor: &EventTypeCursor,
        content: &str,
        events: &[Box<RawValue>],
    ) -> Result<(), HandlerError> {
        match self.granularity() {
            CommitGranularity::Batch => self.deliver_batch(cursor, content, events).await,
            CommitGranularity::Event => {
                for event in events {
                    self.deliver_event(cursor, event).await?;
                }
                Ok(())
            }
        }
    }

    async fn deliver_event(&self, cursor: &EventTypeCursor, event: &RawValue) -> Result<(), HandlerError> {
        match self {
            HandlerKind::RawEvent(listener) => listener.on_event(cursor, event.get()).await,
            HandlerKind::JsonEvent(listener) => {
                let value: Value = serde_json::from_str(event.get())?;
                listener.on_event(cursor, value).await
            }
            HandlerKind::Typed(listener) => listener.on_raw_event(cursor, event).await,
            _ => Err(HandlerError::unrecoverable(format!(
                "{} handler cannot take single events",
                self.name()
            ))),
        }
    }

    async fn deliver_batch(
        &self,
        cursor: &EventTypeCursor,
        content: &str,
        events: &[Box<RawValue>],
    ) -> Result<(), HandlerError> {
        match self {
            HandlerKind::RawContent(listener) => listener.on_content(cursor, content).await,
            HandlerKind::RawEventBulk(listener) => {
                let raw = events.iter().map(|e| e.get().to_string()).collect();
                listener.on_events(cursor, raw).await
            }
            HandlerKind::JsonEventBulk(listener) => {
                let values = events
                    .iter()
                    .map(|e| serde_json::from_str(e.get()))
                    .collect::<Result<Vec<Value>, _>>()?;
                listener.on_events(cursor, values).await
            }
            HandlerKind::TypedBulk(listener) => listener.on_raw_events(cursor, events).await,
            _ => Err(HandlerError::unrecoverable(format!(
                "{} handler cannot take batches",
                self.name()
            ))),
        }
    }
}

struct TypedEvents<T, L> {
    listener: L,
    _event: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, L> ErasedEventListener for TypedEvents<T, L>
where
    T: DeserializeOwned + Send + 'static,
    L: TypedEventListener<T> + 'static,
{
    async fn on_raw_event(&self, cursor: &EventTypeCursor, event: &RawValue) -> Result<(), HandlerError> {
        let parsed: T = serde_json::from_str(event.get())?;
        self.listener.on_event(cursor, parsed).await
    }
}

struct TypedBulk<T, L> {
    listener: L,
    _event: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, L> ErasedBulkListener for TypedBulk<T, L>
where
    T: DeserializeOwned + Send + 'static,
    L: TypedEventBulkListener<T> + 'static,
{
    async fn on_raw_events(
        &self,
        cursor: &EventTypeCursor,
        events: &[Box<RawValue>],
    ) -> Result<(), HandlerError> {
        let parsed = events
            .iter()
            .map(|e| serde_json::from_str(e.get()))
            .collect::<Result<Vec<T>, _>>()?;
        self.listener.on_events(cursor, parsed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, EventTypePartition, Offset};
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize, PartialEq)]
    struct OrderCreated {
        order_id: String,
    }

    #[derive(Default)]
    struct Orders {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TypedEventListener<OrderCreated> for Arc<Orders> {
        async fn on_event(&self, _cursor: &EventTypeCursor, event: OrderCreated) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(event.order_id);
            Ok(())
        }
    }

    fn cursor() -> EventTypeCursor {
        EventTypeCursor::new(
            EventTypePartition::new(EventType::new("order.created"), "0"),
            Offset::parse("5"),
        )
    }

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).unwrap()
    }

    #[test]
    fn test_granularity() {
        let orders = Arc::new(Orders::default());
        assert_eq!(HandlerKind::typed::<OrderCreated, _>(orders).granularity(), CommitGranularity::Event);

        struct Bulk;
        #[async_trait]
        impl RawEventBulkListener for Bulk {
            async fn on_events(&self, _: &EventTypeCursor, _: Vec<String>) -> Result<(), HandlerError> {
                Ok(())
            }
        }
        let bulk = HandlerKind::RawEventBulk(Arc::new(Bulk));
        assert_eq!(bulk.granularity(), CommitGranularity::Batch);
        assert_eq!(bulk.name(), "raw_event_bulk");
    }

    #[tokio::test]
    async fn test_typed_dispatch_parses_payload() {
        let orders = Arc::new(Orders::default());
        let handler = HandlerKind::typed::<OrderCreated, _>(orders.clone());

        handler
            .handle_event(&cursor(), &raw(r#"{"order_id":"o-1","total":3}"#))
            .await
            .unwrap();

        assert_eq!(*orders.seen.lock().unwrap(), vec!["o-1".to_string()]);
    }

    #[tokio::test]
    async fn test_unparseable_payload_is_recoverable() {
        let handler = HandlerKind::typed::<OrderCreated, _>(Arc::new(Orders::default()));

        let err = handler
            .handle_event(&cursor(), &raw(r#"{"unexpected":true}"#))
            .await
            .unwrap_err();

        assert!(err.is_recoverable());
    }
}
