use crate::error::ConsumerError;
use crate::model::{ConsumerName, EventTypePartition, Offset};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use tracing::error;

/// A failure raised while processing a partition's events
#[derive(Debug)]
pub struct ProcessingFailure {
    pub partition: EventTypePartition,
    pub offset: Option<Offset>,
    pub error: ConsumerError,
    /// The event as received, when the failure concerns a single event
    pub raw_event: Option<String>,
}

impl ProcessingFailure {
    pub fn new(partition: EventTypePartition, error: ConsumerError) -> Self {
        Self {
            partition,
            offset: None,
            error,
            raw_event: None,
        }
    }

    pub fn at(mut self, offset: Offset) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_raw_event(mut self, raw_event: impl Into<String>) -> Self {
        self.raw_event = Some(raw_event.into());
        self
    }
}

/// Error sink for recoverable failures, e.g. forwarding to a dead-letter queue.
///
/// Invoked best effort; a panicking handler is logged and skipped.
pub trait ErrorHandler: Send + Sync {
    fn on_error(
        &self,
        consumer: &ConsumerName,
        error: &ConsumerError,
        partition: &EventTypePartition,
        offset: Option<&Offset>,
        raw_event: Option<&str>,
    );
}

/// Fans a failure out to every registered error handler
#[derive(Default)]
pub struct ErrorRouter {
    handlers: RwLock<Vec<Arc<dyn ErrorHandler>>>,
}

impl ErrorRouter {
    pub fn register(&self, handler: Arc<dyn ErrorHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(handler);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn dispatch(&self, consumer: &ConsumerName, failure: &ProcessingFailure) {
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };

        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler.on_error(
                    consumer,
                    &failure.error,
                    &failure.partition,
                    failure.offset.as_ref(),
                    failure.raw_event.as_deref(),
                )
            }));
            if outcome.is_err() {
                error!(
                    consumer = %consumer,
                    partition = %failure.partition,
                    "Error handler panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ErrorHandler for Collecting {
        fn on_error(
            &self,
            _consumer: &ConsumerName,
            error: &ConsumerError,
            _partition: &EventTypePartition,
            _offset: Option<&Offset>,
            raw_event: Option<&str>,
        ) {
            self.seen
                .lock()
                .unwrap()
                .push((error.to_string(), raw_event.map(str::to_string)));
        }
    }

    struct Panicking;

    impl ErrorHandler for Panicking {
        fn on_error(
            &self,
            _: &ConsumerName,
            _: &ConsumerError,
            _: &EventTypePartition,
            _: Option<&Offset>,
            _: Option<&str>,
        ) {
            panic!("sink unavailable");
        }
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let router = ErrorRouter::default();
        let collecting = Arc::new(Collecting::default());
        router.register(Arc::new(Panicking));
        router.register(collecting.clone());

        let failure = ProcessingFailure::new(
            EventTypePartition::new(EventType::new("e"), "0"),
            ConsumerError::processing("bad event"),
        )
        .at(Offset::parse("4"))
        .with_raw_event("{\"id\":1}");

        router.dispatch(&ConsumerName::new("c"), &failure);

        let seen = collecting.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].0.contains("bad event"));
        assert_eq!(seen[0].1.as_deref(), Some("{\"id\":1}"));
        assert_eq!(router.len(), 2);
    }
}
