//! Partition coordinators decide which partitions this process consumes.
//!
//! Three interchangeable strategies share one interface:
//!
//! - [`LocalCoordinator::simple`]: takes every reported partition, starts at
//!   the newest (or oldest) offset, persists nothing.
//! - [`LocalCoordinator::durable`]: same assignment, resumes from the offset
//!   store and persists commits.
//! - [`LeaderElectionCoordinator`]: divides partitions across every process
//!   sharing the consumer name via group membership and per-partition
//!   leader election.
//!
//! Coordinators talk outward only through [`RebalanceListener`] (assign,
//! revoke, health check) and [`CommitCallback`]; channels talk inward through
//! `commit` and `error`.

mod distributed;
mod errors;
mod local;
mod registry;

pub use distributed::LeaderElectionCoordinator;
pub use errors::{ErrorHandler, ErrorRouter, ProcessingFailure};
pub use local::LocalCoordinator;
pub use registry::CallbackRegistry;

use crate::config::StartOffset;
use crate::error::{ConsumerResult, ErrorKind};
use crate::metrics::ConsumerMetrics;
use crate::model::{ConsumerName, EventType, EventTypeCursor, EventTypePartition, NakadiPartition};
use crate::offsets::{OffsetStore, resolve_start_offset};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives ownership changes for one event type.
pub trait RebalanceListener: Send + Sync {
    fn on_assign(&self, cursors: Vec<EventTypeCursor>);

    fn on_revoke(&self, partitions: Vec<EventTypePartition>);

    /// Sent instead of assign/revoke when ownership did not change.
    fn on_health_check(&self);
}

/// Receives every committed cursor of one partition.
pub trait CommitCallback: Send + Sync {
    fn on_commit(&self, cursor: &EventTypeCursor);
}

#[async_trait]
pub trait PartitionCoordinator: Send + Sync {
    fn core(&self) -> &CoordinatorCore;

    fn consumer_name(&self) -> &ConsumerName {
        self.core().consumer()
    }

    async fn init(&self) -> ConsumerResult<()>;

    /// Release everything; returns once background work has stopped.
    async fn close(&self) -> ConsumerResult<()>;

    /// Reconcile `owned` partitions with the broker's current `partitions`.
    async fn rebalance(
        &self,
        event_type: &EventType,
        owned: &BTreeSet<String>,
        partitions: &[NakadiPartition],
    ) -> ConsumerResult<()>;

    /// Handle a failure reported by a partition pipeline. Unrecoverable
    /// failures come back as `Err`.
    async fn error(&self, failure: ProcessingFailure) -> ConsumerResult<()>;

    fn register_rebalance_listener(
        &self,
        event_type: &EventType,
        listener: Arc<dyn RebalanceListener>,
    ) -> ConsumerResult<()> {
        self.core().listeners.register(event_type.clone(), listener)
    }

    fn unregister_rebalance_listener(&self, event_type: &EventType) {
        self.core().listeners.unregister(event_type);
    }

    fn register_commit_callback(
        &self,
        partition: &EventTypePartition,
        callback: Arc<dyn CommitCallback>,
    ) -> ConsumerResult<()> {
        self.core().commit_callbacks.register(partition.clone(), callback)
    }

    fn unregister_commit_callback(&self, partition: &EventTypePartition) {
        self.core().commit_callbacks.unregister(partition);
    }

    fn register_error_handler(&self, handler: Arc<dyn ErrorHandler>) {
        self.core().errors.register(handler);
    }

    async fn commit(&self, cursor: &EventTypeCursor) -> ConsumerResult<()> {
        self.core().commit(cursor).await
    }

    /// Commits are durable when `commit` returns; flushing only marks the end
    /// of a stream attempt.
    async fn flush(&self, partition: &EventTypePartition) -> ConsumerResult<()> {
        debug!(partition = %partition, consumer = %self.consumer_name(), "Flushed partition");
        Ok(())
    }

    /// Committed cursors of `event_type`; empty without an offset store.
    async fn committed_offsets(&self, event_type: &EventType) -> ConsumerResult<Vec<EventTypeCursor>> {
        self.core().committed_offsets(event_type).await
    }
}

/// What a coordinator must do after an error was routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ErrorAction {
    Continue,
    /// Give the partition up so it is reassigned with a fresh offset
    Revoke(EventTypePartition),
}

/// State and behavior shared by every coordinator strategy
pub struct CoordinatorCore {
    consumer: ConsumerName,
    start_offset: StartOffset,
    delete_unavailable_cursors: bool,
    offsets: Option<Arc<dyn OffsetStore>>,
    listeners: CallbackRegistry<EventType, Arc<dyn RebalanceListener>>,
    commit_callbacks: CallbackRegistry<EventTypePartition, Arc<dyn CommitCallback>>,
    errors: ErrorRouter,
}

impl CoordinatorCore {
    pub fn new(
        consumer: ConsumerName,
        start_offset: StartOffset,
        delete_unavailable_cursors: bool,
        offsets: Option<Arc<dyn OffsetStore>>,
    ) -> Self {
        Self {
            consumer,
            start_offset,
            delete_unavailable_cursors,
            offsets,
            listeners: CallbackRegistry::new("rebalance listener"),
            commit_callbacks: CallbackRegistry::new("commit callback"),
            errors: ErrorRouter::default(),
        }
    }

    pub fn consumer(&self) -> &ConsumerName {
        &self.consumer
    }

    fn metrics(&self, event_type: &EventType) -> ConsumerMetrics {
        ConsumerMetrics::new(event_type.name(), self.consumer.as_str())
    }

    /// Start cursor for a newly assigned partition.
    pub(crate) async fn start_cursor(
        &self,
        event_type: &EventType,
        partition: &NakadiPartition,
    ) -> ConsumerResult<EventTypeCursor> {
        let key = EventTypePartition::new(event_type.clone(), &partition.partition);
        let persisted = match &self.offsets {
            Some(offsets) => offsets.get(&key, &self.consumer).await?,
            None => None,
        };

        let offset = resolve_start_offset(persisted.as_ref(), partition, self.start_offset);
        Ok(EventTypeCursor::new(key, offset))
    }

    pub(crate) async fn commit(&self, cursor: &EventTypeCursor) -> ConsumerResult<()> {
        if let Some(offsets) = &self.offsets {
            offsets.set(cursor, &self.consumer).await?;
        }

        match self.commit_callbacks.get(cursor.partition()) {
            Some(callback) => callback.on_commit(cursor),
            None => debug!(cursor = %cursor, "No commit callback registered"),
        }

        self.metrics(cursor.event_type()).committed();
        Ok(())
    }

    pub(crate) async fn committed_offsets(
        &self,
        event_type: &EventType,
    ) -> ConsumerResult<Vec<EventTypeCursor>> {
        match &self.offsets {
            Some(offsets) => offsets.list(event_type, &self.consumer).await,
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn emit_assign(&self, event_type: &EventType, cursors: Vec<EventTypeCursor>) {
        if cursors.is_empty() {
            return;
        }
        match self.listeners.get(event_type) {
            Some(listener) => listener.on_assign(cursors),
            None => warn!(event_type = %event_type, "No rebalance listener for assignment"),
        }
    }

    pub(crate) fn emit_revoke(&self, event_type: &EventType, partitions: Vec<EventTypePartition>) {
        if partitions.is_empty() {
            return;
        }
        match self.listeners.get(event_type) {
            Some(listener) => listener.on_revoke(partitions),
            None => warn!(event_type = %event_type, "No rebalance listener for revocation"),
        }
    }

    pub(crate) fn emit_health_check(&self, event_type: &EventType) {
        if let Some(listener) = self.listeners.get(event_type) {
            listener.on_health_check();
        }
    }

    pub(crate) fn record_rebalance(&self, event_type: &EventType, assigned: usize, revoked: usize) {
        self.metrics(event_type).rebalanced(assigned, revoked);
    }

    /// Classify and route a failure.
    pub(crate) async fn route_error(&self, failure: ProcessingFailure) -> ConsumerResult<ErrorAction> {
        let kind = failure.error.kind();
        let metrics = self.metrics(failure.partition.event_type());

        match kind {
            ErrorKind::Unrecoverable => {
                metrics.handler_error("unrecoverable");
                Err(failure.error)
            }
            ErrorKind::StaleCursor => {
                metrics.handler_error("stale_cursor");
                warn!(
                    partition = %failure.partition,
                    consumer = %self.consumer,
                    error = %failure.error,
                    "Broker rejected committed cursor"
                );
                self.errors.dispatch(&self.consumer, &failure);

                if !self.delete_unavailable_cursors {
                    return Ok(ErrorAction::Continue);
                }
                if let Some(offsets) = &self.offsets {
                    if let Err(e) = offsets.delete(&failure.partition, &self.consumer).await {
                        warn!(partition = %failure.partition, error = %e, "Failed to delete stale offset");
                    }
                }
                Ok(ErrorAction::Revoke(failure.partition))
            }
            ErrorKind::Processing | ErrorKind::Transport => {
                metrics.handler_error("processing");
                warn!(
                    partition = %failure.partition,
                    consumer = %self.consumer,
                    offset = ?failure.offset.as_ref().map(|o| o.as_str()),
                    error = %failure.error,
                    "Event processing failed, continuing"
                );
                self.errors.dispatch(&self.consumer, &failure);
                Ok(ErrorAction::Continue)
            }
        }
    }
}
